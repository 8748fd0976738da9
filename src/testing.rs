/// Scripted in-memory ledger for tests.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::anchor::scan::{unix_to_utc, AnchorLog, LogSource};
use crate::anchor::{AnchorReceipt, LedgerAnchor};
use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};

pub(crate) const GENESIS_TIME: u64 = 1_700_000_000;

/// What the next `anchor` call does.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outcome {
    Confirm,
    Fail { retryable: bool },
    /// The transaction lands but confirmation is not observed in time.
    TimeoutAfterLanding,
    /// Nothing reaches the ledger before the deadline.
    TimeoutLost,
    /// Broadcast but still unmined at the deadline; lands once awaited.
    TimeoutInMempool,
}

#[derive(Default)]
struct LedgerState {
    head: u64,
    logs: Vec<AnchorLog>,
    script: VecDeque<Outcome>,
    max_log_range: Option<u64>,
    scans_fail: bool,
    mempool: Vec<(String, ContentHash)>,
    broadcasts: u64,
}

#[derive(Default)]
pub(crate) struct MockLedger {
    state: Mutex<LedgerState>,
    anchor_calls: AtomicUsize,
    await_calls: AtomicUsize,
    scan_calls: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MockLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub(crate) fn set_max_log_range(&self, blocks: u64) {
        self.state.lock().unwrap().max_log_range = Some(blocks);
    }

    pub(crate) fn set_scans_fail(&self, fail: bool) {
        self.state.lock().unwrap().scans_fail = fail;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn push_log(&self, log: AnchorLog) {
        let mut state = self.state.lock().unwrap();
        state.head = state.head.max(log.block_number);
        state.logs.push(log);
    }

    pub(crate) fn anchor_calls(&self) -> usize {
        self.anchor_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn await_calls(&self) -> usize {
        self.await_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    /// Record an anchoring event in a fresh block and return it.
    fn land(&self, hash: &ContentHash) -> AnchorLog {
        let txid = self.broadcast();
        self.land_as(hash, txid)
    }

    fn broadcast(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.broadcasts += 1;
        format!("0x{:064x}", 0xa000 + state.broadcasts)
    }

    fn land_as(&self, hash: &ContentHash, txid: String) -> AnchorLog {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        let block = state.head;
        let log = AnchorLog {
            content_hash: *hash,
            sender: "0x00000000000000000000000000000000000000aa".into(),
            timestamp: GENESIS_TIME + block,
            block_number: block,
            log_index: 0,
            txid,
        };
        state.logs.push(log.clone());
        log
    }
}

#[async_trait]
impl LedgerAnchor for MockLedger {
    async fn anchor(&self, hash: &ContentHash) -> Result<AnchorReceipt> {
        self.anchor_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = self
            .state
            .lock()
            .unwrap()
            .script
            .pop_front()
            .unwrap_or(Outcome::Confirm);

        match outcome {
            Outcome::Confirm => {
                let log = self.land(hash);
                Ok(AnchorReceipt {
                    txid: log.txid,
                    block_number: log.block_number,
                    block_time: Some(unix_to_utc(log.timestamp)),
                })
            }
            Outcome::Fail { retryable } => Err(EvidenceError::submit("scripted failure", retryable)),
            Outcome::TimeoutAfterLanding => {
                let log = self.land(hash);
                Err(EvidenceError::AnchorTimeout { txid: Some(log.txid) })
            }
            Outcome::TimeoutLost => Err(EvidenceError::AnchorTimeout { txid: None }),
            Outcome::TimeoutInMempool => {
                let txid = self.broadcast();
                self.state.lock().unwrap().mempool.push((txid.clone(), *hash));
                Err(EvidenceError::AnchorTimeout { txid: Some(txid) })
            }
        }
    }

    async fn await_transaction(&self, txid: &str) -> Result<Option<AnchorReceipt>> {
        self.await_calls.fetch_add(1, Ordering::SeqCst);
        let queued = {
            let mut state = self.state.lock().unwrap();
            let found = state.mempool.iter().position(|(t, _)| t == txid);
            found.map(|i| state.mempool.remove(i))
        };
        let log = match queued {
            Some((txid, hash)) => self.land_as(&hash, txid),
            None => match self.state.lock().unwrap().logs.iter().find(|l| l.txid == txid) {
                Some(log) => log.clone(),
                None => return Ok(None),
            },
        };
        Ok(Some(AnchorReceipt {
            txid: log.txid,
            block_number: log.block_number,
            block_time: Some(unix_to_utc(log.timestamp)),
        }))
    }
}

#[async_trait]
impl LogSource for MockLedger {
    async fn head_block(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.scans_fail {
            return Err(EvidenceError::Ledger("node unavailable".into()));
        }
        Ok(state.head)
    }

    async fn anchor_logs(&self, hash: &ContentHash, from: u64, to: u64) -> Result<Vec<AnchorLog>> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.scans_fail {
            return Err(EvidenceError::Ledger("node unavailable".into()));
        }
        if let Some(max) = state.max_log_range {
            if to - from + 1 > max {
                return Err(EvidenceError::Ledger(format!("range {from}..={to} too large")));
            }
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| &l.content_hash == hash && (from..=to).contains(&l.block_number))
            .cloned()
            .collect())
    }
}
