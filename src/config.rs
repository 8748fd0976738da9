/// Service configuration, read from environment variables.
///
/// Variables (defaults in parentheses):
/// - `LISTEN_ADDR` (`0.0.0.0:8080`)
/// - `DATABASE_URL` (unset: in-memory receipt store)
/// - `ARTIFACTS_DIR` (`./artifacts`)
/// - `LEDGER_RPC_URL`, `ANCHOR_PRIVATE_KEY`, `ANCHOR_CONTRACT_ADDR` (required to serve)
/// - `ANCHOR_CHAIN_ID` (114), `ANCHOR_CONFIRMATIONS` (1), `ANCHOR_TIMEOUT_SECS` (120),
///   `ANCHOR_POLL_INTERVAL_MS` (2000), `ANCHOR_LOOKBACK_BLOCKS` (50000), `ANCHOR_CHUNK_SIZE` (500)
/// - `RETRY_MAX_ATTEMPTS` (3), `RETRY_INITIAL_BACKOFF_MS` (1000), `RETRY_MAX_BACKOFF_MS` (30000)
/// - `CALLBACK_TIMEOUT_SECS` (15), `CALLBACK_MAX_ATTEMPTS` (3), `CALLBACK_ON_CREATE` (false)
/// - `SERVICE_SIGNING_KEY`: hex seed, or path to a file holding one
/// - `TRUSTED_SIGNER`: hex public key bundles must be signed with
/// - `PUBLIC_BASE_URL`: prefix for bundle URLs handed to clients
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::anchor::evm::EvmConfig;
use crate::anchor::scan::{DEFAULT_CHUNK_BLOCKS, DEFAULT_LOOKBACK_BLOCKS};
use crate::crypto::sign::{self, ServiceKey, PUBLIC_KEY_LEN};
use crate::notify::callback::{DEFAULT_CALLBACK_ATTEMPTS, DEFAULT_CALLBACK_TIMEOUT};
use crate::error::{EvidenceError, Result};

/// Bounded exponential backoff between processing attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per processing run, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before try number `tried + 1`, given `tried` failures so far.
    pub fn backoff(&self, tried: u32) -> Duration {
        let exp = tried.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub database_url: Option<String>,
    pub artifacts_dir: PathBuf,
    pub rpc_url: Option<String>,
    pub anchor_private_key: Option<Zeroizing<String>>,
    pub contract_address: Option<String>,
    pub chain_id: u64,
    pub confirmations: u64,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    pub lookback_blocks: u64,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub callback_timeout: Duration,
    pub callback_max_attempts: u32,
    pub callback_on_create: bool,
    pub signing_key: Option<Zeroizing<String>>,
    pub trusted_signer: Option<[u8; PUBLIC_KEY_LEN]>,
    pub public_base_url: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("listen_addr", &self.listen_addr)
            .field("database_url", &self.database_url.as_ref().map(|_| "[REDACTED]"))
            .field("artifacts_dir", &self.artifacts_dir)
            .field("rpc_url", &self.rpc_url)
            .field("anchor_private_key", &self.anchor_private_key.as_ref().map(|_| "[REDACTED]"))
            .field("contract_address", &self.contract_address)
            .field("chain_id", &self.chain_id)
            .field("confirmations", &self.confirmations)
            .field("confirm_timeout", &self.confirm_timeout)
            .field("lookback_blocks", &self.lookback_blocks)
            .field("retry", &self.retry)
            .field("callback_on_create", &self.callback_on_create)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "[REDACTED]"))
            .field("trusted_signer", &self.trusted_signer.map(hex::encode))
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let retry = RetryPolicy {
            max_attempts: parse_or(&var, "RETRY_MAX_ATTEMPTS", 3u32)?.max(1),
            initial_backoff: Duration::from_millis(parse_or(&var, "RETRY_INITIAL_BACKOFF_MS", 1_000)?),
            max_backoff: Duration::from_millis(parse_or(&var, "RETRY_MAX_BACKOFF_MS", 30_000)?),
        };

        let trusted_signer = var("TRUSTED_SIGNER")
            .map(|hex| sign::parse_public_key(&hex))
            .transpose()?;

        Ok(Self {
            listen_addr: var("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: var("DATABASE_URL"),
            artifacts_dir: var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            rpc_url: var("LEDGER_RPC_URL"),
            anchor_private_key: var("ANCHOR_PRIVATE_KEY").map(Zeroizing::new),
            contract_address: var("ANCHOR_CONTRACT_ADDR"),
            chain_id: parse_or(&var, "ANCHOR_CHAIN_ID", 114)?,
            confirmations: parse_or(&var, "ANCHOR_CONFIRMATIONS", 1u64)?.max(1),
            confirm_timeout: Duration::from_secs(parse_or(&var, "ANCHOR_TIMEOUT_SECS", 120)?),
            poll_interval: Duration::from_millis(parse_or(&var, "ANCHOR_POLL_INTERVAL_MS", 2_000)?),
            lookback_blocks: parse_or(&var, "ANCHOR_LOOKBACK_BLOCKS", DEFAULT_LOOKBACK_BLOCKS)?,
            chunk_size: parse_or(&var, "ANCHOR_CHUNK_SIZE", DEFAULT_CHUNK_BLOCKS)?.max(1),
            retry,
            callback_timeout: Duration::from_secs(parse_or(
                &var,
                "CALLBACK_TIMEOUT_SECS",
                DEFAULT_CALLBACK_TIMEOUT.as_secs(),
            )?),
            callback_max_attempts: parse_or(&var, "CALLBACK_MAX_ATTEMPTS", DEFAULT_CALLBACK_ATTEMPTS)?.max(1),
            callback_on_create: parse_bool(&var, "CALLBACK_ON_CREATE")?,
            signing_key: var("SERVICE_SIGNING_KEY").map(Zeroizing::new),
            trusted_signer,
            public_base_url: var("PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    /// Ledger client settings; fails if the ledger is not configured.
    pub fn evm_config(&self) -> Result<EvmConfig> {
        let rpc_url = self
            .rpc_url
            .clone()
            .ok_or_else(|| EvidenceError::Config("LEDGER_RPC_URL is required".into()))?;
        let contract = self
            .contract_address
            .clone()
            .ok_or_else(|| EvidenceError::Config("ANCHOR_CONTRACT_ADDR is required".into()))?;

        let mut config = EvmConfig::new(rpc_url, contract, self.chain_id);
        config.confirmations = self.confirmations;
        config.confirm_timeout = self.confirm_timeout;
        config.poll_interval = self.poll_interval;
        Ok(config)
    }

    /// The bundle signing key: a hex seed, or a file containing one.
    /// `None` when unset.
    pub fn load_signing_key(&self) -> Result<Option<ServiceKey>> {
        let Some(raw) = &self.signing_key else {
            return Ok(None);
        };
        let path = std::path::Path::new(raw.as_str());
        if path.is_file() {
            let contents = Zeroizing::new(std::fs::read_to_string(path)?);
            return ServiceKey::from_hex(&contents).map(Some);
        }
        ServiceKey::from_hex(raw).map(Some)
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| EvidenceError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

fn parse_bool(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match var(key).map(|v| v.to_lowercase()).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(EvidenceError::Config(format!("{key}={other:?} is not a boolean"))),
    }
}
