/// EVM anchoring client.
///
/// Calls `anchorEvidence(bytes32)` on the anchoring contract with a locally
/// signed legacy transaction and waits for inclusion at the configured
/// depth. The contract emits
/// `EvidenceAnchored(bytes32 bundleHash, address indexed sender, uint256 ts)`,
/// which the same client reads back through `eth_getLogs` for verification.
///
/// Fees are read from the node for every submission; the gas limit comes
/// from `eth_estimateGas` plus a 20% margin, or a fixed fallback when the
/// estimate is unavailable.
use std::time::Duration;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{keccak256, Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use super::nonce::NonceAllocator;
use super::rpc::{self, JsonRpcClient, RpcError};
use super::scan::{unix_to_utc, AnchorLog, LogSource};
use super::{AnchorReceipt, LedgerAnchor};
use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};

/// Solidity signature of the anchoring entry point.
pub const ANCHOR_FUNCTION: &str = "anchorEvidence(bytes32)";
/// Solidity signature of the anchoring event.
pub const ANCHOR_EVENT: &str = "EvidenceAnchored(bytes32,address,uint256)";

pub const FALLBACK_GAS_LIMIT: u64 = 200_000;

/// Configuration for the EVM anchor client.
#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// `0x`-prefixed address of the anchoring contract.
    pub contract_address: String,
    pub chain_id: u64,
    /// Blocks required on top of (and including) the inclusion block.
    pub confirmations: u64,
    /// Deadline for submission plus confirmation.
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl EvmConfig {
    pub fn new(rpc_url: impl Into<String>, contract_address: impl Into<String>, chain_id: u64) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address: contract_address.into(),
            chain_id,
            confirmations: 1,
            confirm_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// 4-byte selector of [`ANCHOR_FUNCTION`].
pub fn anchor_selector() -> [u8; 4] {
    let digest = keccak256(ANCHOR_FUNCTION.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// topic0 of [`ANCHOR_EVENT`], `0x`-prefixed.
pub fn anchor_event_topic() -> String {
    format!("0x{}", hex::encode(keccak256(ANCHOR_EVENT.as_bytes())))
}

/// ABI-encoded call `anchorEvidence(hash)`.
pub fn anchor_calldata(hash: &ContentHash) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&anchor_selector());
    data.extend_from_slice(hash.as_bytes());
    data
}

/// Map a submission failure to `AnchorSubmit` with its retry class.
pub(crate) fn classify_submit(stage: &str, err: &RpcError) -> EvidenceError {
    let msg = err.node_message();
    let permanent = [
        "insufficient funds",
        "revert",
        "invalid sender",
        "invalid chain",
        "exceeds block gas limit",
        "intrinsic gas too low",
    ];
    let retryable = match err {
        RpcError::Transport(_) | RpcError::Malformed(_) => true,
        RpcError::Node { .. } => !permanent.iter().any(|p| msg.contains(p)),
    };
    EvidenceError::submit(format!("{stage}: {err}"), retryable)
}

/// Whether the node rejected the transaction because of its nonce.
pub(crate) fn is_nonce_rejection(err: &RpcError) -> bool {
    let msg = err.node_message();
    ["nonce too low", "nonce too high", "already known", "replacement transaction underpriced"]
        .iter()
        .any(|p| msg.contains(p))
}

fn ledger_error(err: RpcError) -> EvidenceError {
    EvidenceError::Ledger(err.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawLog {
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub transaction_hash: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

fn decode_hex(value: &str) -> std::result::Result<Vec<u8>, String> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value)).map_err(|e| format!("bad hex: {e}"))
}

/// Decode an `EvidenceAnchored` log.
pub(crate) fn decode_log(raw: &RawLog, topic0: &str) -> std::result::Result<AnchorLog, String> {
    if raw.topics.first().map(|t| t.to_lowercase()).as_deref() != Some(topic0) {
        return Err("not an anchoring event".into());
    }
    let sender_topic = decode_hex(raw.topics.get(1).ok_or("missing sender topic")?)?;
    if sender_topic.len() != 32 {
        return Err("sender topic is not 32 bytes".into());
    }
    let data = decode_hex(&raw.data)?;
    if data.len() < 64 {
        return Err(format!("event data is {} bytes, expected 64", data.len()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&data[..32]);
    if data[32..56].iter().any(|b| *b != 0) {
        return Err("timestamp does not fit in 64 bits".into());
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[56..64]);

    let quantity = |field: &Option<String>, name: &str| {
        field
            .as_deref()
            .ok_or_else(|| format!("missing {name}"))
            .and_then(|v| rpc::parse_quantity(v).map_err(|e| e.to_string()))
    };

    Ok(AnchorLog {
        content_hash: ContentHash::new(hash),
        sender: format!("0x{}", hex::encode(&sender_topic[12..])),
        timestamp: u64::from_be_bytes(ts),
        block_number: quantity(&raw.block_number, "blockNumber")?,
        log_index: quantity(&raw.log_index, "logIndex")?,
        txid: raw
            .transaction_hash
            .clone()
            .ok_or("missing transactionHash")?
            .to_lowercase(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: String,
}

/// Read-only access to anchoring events. Needs no account.
pub struct EvmLogReader {
    rpc: JsonRpcClient,
    contract: Address,
    event_topic: String,
}

impl EvmLogReader {
    pub fn new(config: &EvmConfig) -> Result<Self> {
        let contract: Address = config
            .contract_address
            .trim()
            .parse()
            .map_err(|e| EvidenceError::Config(format!("invalid contract address: {e}")))?;
        let rpc = JsonRpcClient::new(config.rpc_url.clone(), config.request_timeout)
            .map_err(|e| EvidenceError::Config(e.to_string()))?;
        Ok(Self {
            rpc,
            contract,
            event_topic: anchor_event_topic(),
        })
    }

    async fn head(&self) -> std::result::Result<u64, RpcError> {
        let head: String = self.rpc.call("eth_blockNumber", serde_json::json!([])).await?;
        rpc::parse_quantity(&head)
    }
}

#[async_trait]
impl LogSource for EvmLogReader {
    async fn head_block(&self) -> Result<u64> {
        self.head().await.map_err(ledger_error)
    }

    async fn anchor_logs(&self, hash: &ContentHash, from: u64, to: u64) -> Result<Vec<AnchorLog>> {
        let filter = serde_json::json!([{
            "address": format!("{:?}", self.contract),
            "fromBlock": rpc::to_quantity(from),
            "toBlock": rpc::to_quantity(to),
            "topics": [self.event_topic],
        }]);
        let raw: Vec<RawLog> = self.rpc.call("eth_getLogs", filter).await.map_err(ledger_error)?;

        let mut logs = Vec::new();
        for entry in raw.iter().filter(|l| !l.removed) {
            match decode_log(entry, &self.event_topic) {
                Ok(log) if &log.content_hash == hash => logs.push(log),
                Ok(_) => {}
                Err(reason) => tracing::debug!(reason = %reason, "skipping undecodable log"),
            }
        }
        Ok(logs)
    }
}

/// Submitting client. Also serves as a [`LogSource`] through its reader.
pub struct EvmAnchorClient {
    config: EvmConfig,
    reader: EvmLogReader,
    signer: PrivateKeySigner,
    nonces: NonceAllocator,
}

impl EvmAnchorClient {
    pub fn new(config: EvmConfig, private_key_hex: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key_hex
            .trim()
            .parse()
            .map_err(|e| EvidenceError::Config(format!("invalid anchor private key: {e}")))?;
        let reader = EvmLogReader::new(&config)?;

        Ok(Self {
            config,
            reader,
            signer,
            nonces: NonceAllocator::new(),
        })
    }

    /// `0x`-prefixed address of the submitting account.
    pub fn sender_address(&self) -> String {
        format!("{:?}", self.signer.address())
    }

    pub fn config(&self) -> &EvmConfig {
        &self.config
    }

    fn rpc(&self) -> &JsonRpcClient {
        &self.reader.rpc
    }

    async fn gas_limit(&self, calldata: &[u8]) -> Result<u64> {
        let call = serde_json::json!([{
            "from": self.sender_address(),
            "to": format!("{:?}", self.reader.contract),
            "data": format!("0x{}", hex::encode(calldata)),
        }]);
        match self.rpc().call::<String>("eth_estimateGas", call).await {
            Ok(estimate) => {
                let gas = rpc::parse_quantity(&estimate).map_err(|e| classify_submit("estimate gas", &e))?;
                Ok(gas.saturating_add(gas / 5))
            }
            Err(e) if e.node_message().contains("revert") => Err(classify_submit("estimate gas", &e)),
            Err(e) => {
                tracing::warn!(error = %e, "gas estimate unavailable, using fallback limit");
                Ok(FALLBACK_GAS_LIMIT)
            }
        }
    }

    /// Allocate a nonce, sign and broadcast. Returns the transaction hash.
    async fn submit(&self, hash: &ContentHash) -> Result<String> {
        let calldata = anchor_calldata(hash);
        let from = self.sender_address();

        let mut lease = self.nonces.lease().await;

        let pending: String = self
            .rpc()
            .call("eth_getTransactionCount", serde_json::json!([from, "pending"]))
            .await
            .map_err(|e| classify_submit("read nonce", &e))?;
        let chain_pending = rpc::parse_quantity(&pending).map_err(|e| classify_submit("read nonce", &e))?;
        let nonce = lease.reserve(chain_pending);

        let gas_price_hex: String = self
            .rpc()
            .call("eth_gasPrice", serde_json::json!([]))
            .await
            .map_err(|e| classify_submit("read gas price", &e))?;
        let gas_price =
            rpc::parse_quantity_u128(&gas_price_hex).map_err(|e| classify_submit("read gas price", &e))?;
        let gas_limit = self.gas_limit(&calldata).await?;

        let tx = TxLegacy {
            chain_id: Some(self.config.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(self.reader.contract),
            value: U256::ZERO,
            input: Bytes::from(calldata),
        };

        let sig_hash = tx.signature_hash();
        let sig = self
            .signer
            .sign_hash(&sig_hash)
            .await
            .map_err(|e| EvidenceError::submit(format!("signing failed: {e}"), false))?;
        let signed = TxEnvelope::Legacy(tx.into_signed(sig));

        let mut raw_tx = Vec::new();
        signed.encode_2718(&mut raw_tx);
        let raw_hex = format!("0x{}", hex::encode(&raw_tx));

        match self
            .rpc()
            .call::<String>("eth_sendRawTransaction", serde_json::json!([raw_hex]))
            .await
        {
            Ok(txid) => {
                lease.commit(nonce);
                tracing::debug!(nonce, gas_price = %gas_price, gas_limit, txid = %txid, "anchor transaction accepted");
                Ok(txid.to_lowercase())
            }
            Err(e) => {
                if is_nonce_rejection(&e) {
                    tracing::warn!(nonce, error = %e, "nonce rejected, resynchronising counter");
                    lease.invalidate();
                }
                Err(classify_submit("send transaction", &e))
            }
        }
    }

    /// One receipt poll. `Ok(None)` means not yet confirmed at depth.
    async fn poll_confirmation(&self, txid: &str) -> Result<Option<AnchorReceipt>> {
        let receipt = match self
            .rpc()
            .call_optional::<TxReceipt>("eth_getTransactionReceipt", serde_json::json!([txid]))
            .await
        {
            Ok(Some(r)) => r,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(txid, error = %e, "receipt poll failed");
                return Ok(None);
            }
        };
        let Some(block_hex) = receipt.block_number else {
            return Ok(None);
        };
        let block = rpc::parse_quantity(&block_hex).map_err(ledger_error)?;
        if receipt.status.as_deref() == Some("0x0") {
            return Err(EvidenceError::submit(
                format!("transaction {txid} reverted in block {block}"),
                false,
            ));
        }

        let head = match self.reader.head().await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(txid, error = %e, "head lookup failed");
                return Ok(None);
            }
        };
        let depth = self.config.confirmations.max(1);
        if head.saturating_add(1) < block.saturating_add(depth) {
            return Ok(None);
        }

        let block_time = match self
            .rpc()
            .call::<BlockHeader>("eth_getBlockByNumber", serde_json::json!([rpc::to_quantity(block), false]))
            .await
            .and_then(|b| rpc::parse_quantity(&b.timestamp))
        {
            Ok(ts) => Some(unix_to_utc(ts)),
            Err(e) => {
                tracing::warn!(txid, block, error = %e, "block timestamp unavailable");
                None
            }
        };

        Ok(Some(AnchorReceipt {
            txid: txid.to_string(),
            block_number: block,
            block_time,
        }))
    }

    async fn wait_for_confirmation(&self, txid: &str) -> Result<AnchorReceipt> {
        loop {
            if let Some(receipt) = self.poll_confirmation(txid).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl LedgerAnchor for EvmAnchorClient {
    async fn anchor(&self, hash: &ContentHash) -> Result<AnchorReceipt> {
        let deadline = Instant::now() + self.config.confirm_timeout;

        let txid = match tokio::time::timeout_at(deadline, self.submit(hash)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(content_hash = %hash, "anchor submission timed out");
                return Err(EvidenceError::AnchorTimeout { txid: None });
            }
        };
        tracing::info!(content_hash = %hash, txid = %txid, "anchor transaction broadcast");

        match tokio::time::timeout_at(deadline, self.wait_for_confirmation(&txid)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(content_hash = %hash, txid = %txid, "anchor confirmation timed out");
                Err(EvidenceError::AnchorTimeout { txid: Some(txid) })
            }
        }
    }

    async fn await_transaction(&self, txid: &str) -> Result<Option<AnchorReceipt>> {
        let known = self
            .rpc()
            .call_optional::<serde_json::Value>("eth_getTransactionByHash", serde_json::json!([txid]))
            .await
            .map_err(ledger_error)?;
        if known.is_none() {
            tracing::warn!(txid, "earlier anchor transaction unknown to the node");
            return Ok(None);
        }

        let deadline = Instant::now() + self.config.confirm_timeout;
        match tokio::time::timeout_at(deadline, self.wait_for_confirmation(txid)).await {
            Ok(result) => result.map(Some),
            Err(_) => Err(EvidenceError::AnchorTimeout {
                txid: Some(txid.to_string()),
            }),
        }
    }
}

#[async_trait]
impl LogSource for EvmAnchorClient {
    async fn head_block(&self) -> Result<u64> {
        self.reader.head_block().await
    }

    async fn anchor_logs(&self, hash: &ContentHash, from: u64, to: u64) -> Result<Vec<AnchorLog>> {
        self.reader.anchor_logs(hash, from, to).await
    }
}
