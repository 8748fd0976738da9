/// Minimal Ethereum JSON-RPC client.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Failure of a single JSON-RPC call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The request never produced a JSON-RPC reply (connect, HTTP, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error object.
    #[error("node error {code}: {message}")]
    Node { code: i64, message: String },

    /// The reply could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Lowercased node error message, empty for non-node errors.
    pub fn node_message(&self) -> String {
        match self {
            RpcError::Node { message, .. } => message.to_lowercase(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

pub struct JsonRpcClient {
    url: String,
    client: Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method` and decode a non-null result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::Malformed(format!("{method}: empty result")))
    }

    /// Call `method`, treating a `null` result as `None`.
    pub async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, RpcError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Transport(format!("{method}: request timed out"))
                } else {
                    RpcError::Transport(format!("{method}: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            return Err(RpcError::Transport(format!("{method}: HTTP {}", resp.status())));
        }

        let parsed: JsonRpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| RpcError::Malformed(format!("{method}: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result)
    }
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &str) -> Result<u64, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Malformed(format!("quantity without 0x prefix: {value}")))?;
    if digits.is_empty() {
        return Err(RpcError::Malformed("empty quantity".into()));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Malformed(format!("invalid quantity {value}: {e}")))
}

/// Like [`parse_quantity`] but for values that may exceed `u64` (gas prices).
pub fn parse_quantity_u128(value: &str) -> Result<u128, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Malformed(format!("quantity without 0x prefix: {value}")))?;
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Malformed(format!("invalid quantity {value}: {e}")))
}

pub fn to_quantity(value: u64) -> String {
    format!("{value:#x}")
}
