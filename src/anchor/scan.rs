/// Ledger log scanning: find the anchoring event for a content hash.
///
/// The window is the last `lookback` blocks up to the current head, walked
/// most-recent-first in chunks. The whole window is always scanned because
/// when several events carry the same hash the earliest one wins, ordered
/// by (timestamp, block, log index).
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};

pub const DEFAULT_LOOKBACK_BLOCKS: u64 = 50_000;
pub const DEFAULT_CHUNK_BLOCKS: u64 = 500;
/// Smallest chunk a failing range is split down to before giving up.
pub const MIN_CHUNK_BLOCKS: u64 = 50;

/// One decoded anchoring event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorLog {
    pub content_hash: ContentHash,
    pub sender: String,
    /// Ledger timestamp recorded by the contract (unix seconds).
    pub timestamp: u64,
    pub block_number: u64,
    pub log_index: u64,
    pub txid: String,
}

/// Read access to anchoring events on the ledger.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head_block(&self) -> Result<u64>;

    /// Anchoring events in `[from, to]` whose hash equals `hash`.
    async fn anchor_logs(&self, hash: &ContentHash, from: u64, to: u64) -> Result<Vec<AnchorLog>>;
}

/// The on-chain record matching a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainMatch {
    pub txid: String,
    pub block_number: u64,
    pub anchored_at: DateTime<Utc>,
    pub sender: String,
}

impl From<AnchorLog> for ChainMatch {
    fn from(log: AnchorLog) -> Self {
        Self {
            anchored_at: unix_to_utc(log.timestamp),
            txid: log.txid,
            block_number: log.block_number,
            sender: log.sender,
        }
    }
}

pub(crate) fn unix_to_utc(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Inclusive block ranges covering the window ending at `head`,
/// most recent first.
pub fn chunk_ranges(head: u64, lookback: u64, chunk: u64) -> Vec<(u64, u64)> {
    if lookback == 0 {
        return Vec::new();
    }
    let chunk = chunk.max(1);
    let start = head.saturating_sub(lookback - 1);
    let mut ranges = Vec::new();
    let mut to = head;
    loop {
        let from = to.saturating_sub(chunk - 1).max(start);
        ranges.push((from, to));
        if from == start {
            break;
        }
        to = from - 1;
    }
    ranges
}

/// Earliest event for `hash`, ordered by (timestamp, block, log index).
pub fn earliest_match<'a>(
    logs: impl IntoIterator<Item = &'a AnchorLog>,
    hash: &ContentHash,
) -> Option<&'a AnchorLog> {
    logs.into_iter()
        .filter(|log| &log.content_hash == hash)
        .min_by_key(|log| (log.timestamp, log.block_number, log.log_index))
}

/// Halves of an inclusive range, upper (more recent) half first.
fn split(from: u64, to: u64) -> [(u64, u64); 2] {
    let mid = from + (to - from) / 2;
    [(mid + 1, to), (from, mid)]
}

pub struct LogScanner {
    source: Arc<dyn LogSource>,
    lookback: u64,
    chunk: u64,
}

impl LogScanner {
    pub fn new(source: Arc<dyn LogSource>, lookback: u64, chunk: u64) -> Self {
        Self {
            source,
            lookback,
            chunk: chunk.max(1),
        }
    }

    /// Search the window for `hash`. `Ok(None)` means no event in range.
    pub async fn find(&self, hash: &ContentHash) -> Result<Option<ChainMatch>> {
        let head = self.source.head_block().await?;
        let mut pending = chunk_ranges(head, self.lookback, self.chunk);
        pending.reverse();

        let mut found: Vec<AnchorLog> = Vec::new();
        while let Some((from, to)) = pending.pop() {
            match self.source.anchor_logs(hash, from, to).await {
                Ok(logs) => found.extend(logs),
                Err(e) if to - from + 1 > MIN_CHUNK_BLOCKS => {
                    tracing::debug!(from, to, error = %e, "log query failed, splitting range");
                    let [recent, older] = split(from, to);
                    pending.push(older);
                    pending.push(recent);
                }
                Err(e) => {
                    return Err(EvidenceError::Ledger(format!(
                        "log scan failed at blocks {from}..={to}: {e}"
                    )));
                }
            }
        }

        Ok(earliest_match(&found, hash).cloned().map(ChainMatch::from))
    }
}
