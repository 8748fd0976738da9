/// Ledger anchoring for evidence bundle hashes.
///
/// A content hash is written to the ledger by calling an anchoring
/// contract, which emits an event carrying the hash, the submitting
/// account and the ledger timestamp. The write side is [`LedgerAnchor`];
/// the read side used by verification is [`scan::LogSource`].
pub mod evm;
pub mod nonce;
pub mod rpc;
pub mod scan;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::hash::ContentHash;
use crate::error::Result;

/// Result of a confirmed anchoring transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    /// `0x`-prefixed transaction hash.
    pub txid: String,
    pub block_number: u64,
    /// Timestamp of the block that included the transaction.
    pub block_time: Option<DateTime<Utc>>,
}

/// Submits content hashes to the ledger.
#[async_trait]
pub trait LedgerAnchor: Send + Sync {
    /// Anchor `hash`, returning once the transaction is confirmed at the
    /// configured depth.
    ///
    /// Fails with `AnchorTimeout` if confirmation is not observed before
    /// the deadline (the transaction may still land later) and with
    /// `AnchorSubmit` for every other failure.
    async fn anchor(&self, hash: &ContentHash) -> Result<AnchorReceipt>;

    /// Wait for a transaction broadcast by an earlier, timed-out `anchor`.
    ///
    /// `Ok(None)` means the ledger no longer knows the transaction and the
    /// hash must be submitted again.
    async fn await_transaction(&self, txid: &str) -> Result<Option<AnchorReceipt>>;
}
