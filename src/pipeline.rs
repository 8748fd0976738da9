/// Receipt processing pipeline.
///
/// Drives one receipt from intake to a terminal state:
/// 1. Intake: create the receipt exclusively on its external reference
/// 2. Build and sign the evidence bundle, store it
/// 3. Persist the content hash
/// 4. Anchor the hash on the ledger, retrying transient failures
/// 5. Persist the ledger transaction and mark the receipt anchored
///
/// Any failure marks the receipt failed with a reason; a failed receipt can
/// be re-driven. Every persisted transition is published to subscribers.
/// At most one processing run per receipt is in flight; concurrent triggers
/// share it.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::anchor::scan::{ChainMatch, LogScanner};
use crate::anchor::LedgerAnchor;
use crate::bundle::Packager;
use crate::config::RetryPolicy;
use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};
use crate::notify::Notifier;
use crate::state::models::{Receipt, ReceiptSnapshot, ReceiptStatus, TransferFacts};
use crate::state::{Intake, ReceiptStore};
use crate::storage::{self, StorageBackend};

/// Handle on an in-flight processing run.
pub type ProcessingRun = Shared<BoxFuture<'static, ()>>;

const RESUME_BATCH: usize = 1_000;

/// Collaborators of the pipeline.
pub struct PipelineParts {
    pub store: Arc<dyn ReceiptStore>,
    pub packager: Packager,
    pub ledger: Arc<dyn LedgerAnchor>,
    pub scanner: Arc<LogScanner>,
    pub storage: Arc<dyn StorageBackend>,
    pub notifier: Arc<Notifier>,
    pub retry: RetryPolicy,
    /// Prefix for bundle URLs recorded on receipts (may be empty).
    pub public_base_url: String,
}

#[derive(Clone)]
pub struct ReceiptPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    parts: PipelineParts,
    /// In-flight runs, tagged with the generation that started them.
    inflight: DashMap<Uuid, (u64, ProcessingRun)>,
    generation: AtomicU64,
}

impl ReceiptPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                parts,
                inflight: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn parts(&self) -> &PipelineParts {
        &self.inner.parts
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.parts().notifier
    }

    /// Register a transfer. An existing receipt for the same reference is
    /// returned unchanged; a new one is acknowledged as pending and
    /// processed in the background.
    pub async fn intake(&self, facts: TransferFacts, callback_url: Option<String>) -> Result<Intake> {
        let facts = facts.validated()?;
        let callback_url = callback_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .map(validate_callback_url)
            .transpose()?;

        let intake = self
            .parts()
            .store
            .insert_if_absent(Receipt::new(facts, callback_url))
            .await?;

        match &intake {
            Intake::Created(receipt) => {
                info!(
                    receipt_id = %receipt.id,
                    reference = %receipt.facts.reference,
                    "Receipt created"
                );
                self.parts().notifier.publish(receipt.snapshot());
                self.trigger(receipt.id);
            }
            Intake::Existing(receipt) => {
                debug!(receipt_id = %receipt.id, reference = %receipt.facts.reference, "Duplicate intake");
            }
        }
        Ok(intake)
    }

    /// Start processing `id`, or join the run already in flight.
    pub fn trigger(&self, id: Uuid) -> ProcessingRun {
        use dashmap::mapref::entry::Entry;

        match self.inner.inflight.entry(id) {
            Entry::Occupied(mut slot) => {
                if slot.get().1.peek().is_none() {
                    return slot.get().1.clone();
                }
                let (generation, run) = self.start(id);
                slot.insert((generation, run.clone()));
                tokio::spawn(run.clone());
                run
            }
            Entry::Vacant(slot) => {
                let (generation, run) = self.start(id);
                slot.insert((generation, run.clone()));
                tokio::spawn(run.clone());
                run
            }
        }
    }

    fn start(&self, id: Uuid) -> (u64, ProcessingRun) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let run = async move {
            let handled = this.process(id).await;
            this.inner
                .inflight
                .remove_if(&id, |_, (owner, _)| *owner == generation);

            // A re-drive committed while this run was finishing joined it
            // instead of starting its own attempt.
            if let Ok(receipt) = this.get(id).await {
                let newer = handled.is_some_and(|attempt| receipt.attempt > attempt);
                if receipt.status == ReceiptStatus::Pending && newer {
                    debug!(receipt_id = %id, attempt = receipt.attempt, "Picking up re-driven attempt");
                    this.trigger(id).await;
                }
            }
        }
        .boxed()
        .shared();
        (generation, run)
    }

    /// Re-drive a failed receipt as a fresh attempt.
    pub async fn retry(&self, id: Uuid) -> Result<Receipt> {
        let current = self.get(id).await?;
        let next = self.commit(&current, current.redriven()?).await?;
        info!(receipt_id = %id, attempt = next.attempt, "Receipt re-driven");
        self.trigger(id);
        Ok(next)
    }

    /// Restart processing for receipts left pending (e.g. by a crash).
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self
            .parts()
            .store
            .list_by_status(ReceiptStatus::Pending, RESUME_BATCH)
            .await?;
        for receipt in &pending {
            self.trigger(receipt.id);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Resumed pending receipts");
        }
        Ok(pending.len())
    }

    pub async fn get(&self, id: Uuid) -> Result<Receipt> {
        self.parts()
            .store
            .get(id)
            .await?
            .ok_or(EvidenceError::NotFound(id))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Receipt>> {
        self.parts().store.list_recent(limit).await
    }

    /// Stored bundle bytes for a receipt.
    pub async fn bundle(&self, id: Uuid) -> Result<Vec<u8>> {
        let receipt = self.get(id).await?;
        if receipt.content_hash.is_none() {
            return Err(EvidenceError::ArtifactNotFound(format!(
                "receipt {id} has no bundle yet"
            )));
        }
        self.parts().storage.download(&storage::bundle_key(&id)).await
    }

    /// Live snapshots for a receipt, starting with its current state.
    pub async fn subscribe(&self, id: Uuid) -> Result<watch::Receiver<ReceiptSnapshot>> {
        let current = self.get(id).await?;
        let rx = self.parts().notifier.subscribe(current.snapshot());
        // Catch transitions published before the channel existed.
        let latest = self.get(id).await?;
        self.parts().notifier.offer(&latest.snapshot());
        Ok(rx)
    }

    /// Run one attempt. Returns the attempt number that was handled, if any.
    async fn process(&self, id: Uuid) -> Option<u32> {
        let receipt = match self.get(id).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(receipt_id = %id, error = %e, "Receipt processing aborted");
                return None;
            }
        };
        if receipt.status != ReceiptStatus::Pending {
            debug!(receipt_id = %id, status = receipt.status.as_str(), "Nothing to process");
            return Some(receipt.attempt);
        }
        let attempt = receipt.attempt;
        if let Err(e) = self.run(receipt).await {
            error!(receipt_id = %id, error = %e, "Receipt processing aborted");
        }
        Some(attempt)
    }

    async fn run(&self, receipt: Receipt) -> Result<()> {
        let id = receipt.id;

        let (receipt, hash) = match receipt.content_hash {
            Some(hash) => {
                // Hash recorded by an earlier attempt: it may already be on chain.
                if let Some(found) = self.reconcile(&hash).await {
                    self.settle_anchored_from_chain(&receipt, found).await?;
                    return Ok(());
                }
                (receipt, hash)
            }
            None => match self.package(&receipt).await {
                Ok(hash) => {
                    let location = format!(
                        "{}/v1/receipts/{id}/bundle",
                        self.parts().public_base_url
                    );
                    let next = self
                        .commit(&receipt, receipt.with_content_hash(hash, Some(location))?)
                        .await?;
                    (next, hash)
                }
                Err(e) => {
                    warn!(receipt_id = %id, error = %e, "Bundle build failed");
                    self.commit(&receipt, receipt.failed(e.to_string())?).await?;
                    return Ok(());
                }
            },
        };

        self.anchor_with_retry(receipt, hash).await
    }

    /// Build, sign and store the bundle. Returns its content hash.
    async fn package(&self, receipt: &Receipt) -> Result<ContentHash> {
        let bundle = self.parts().packager.package(&receipt.facts)?;
        let backend = &self.parts().storage;
        let stored = backend
            .upload(&storage::bundle_key(&receipt.id), &bundle.bytes)
            .await?;
        if stored.content_hash != *bundle.content_hash.as_bytes() {
            return Err(EvidenceError::Storage(format!(
                "{} backend stored {} with a different hash",
                backend.name(),
                stored.storage_key
            )));
        }
        info!(
            receipt_id = %receipt.id,
            content_hash = %bundle.content_hash,
            backend = backend.name(),
            key = %stored.storage_key,
            size = stored.size,
            "Evidence bundle stored"
        );
        Ok(bundle.content_hash)
    }

    async fn anchor_with_retry(&self, receipt: Receipt, hash: ContentHash) -> Result<()> {
        let policy = &self.parts().retry;
        let mut tried = 0u32;
        // Broadcast by a timed-out attempt and not yet seen on chain.
        let mut outstanding: Option<String> = None;
        loop {
            tried += 1;
            let result = match outstanding.take() {
                Some(txid) => match self.parts().ledger.await_transaction(&txid).await {
                    Ok(Some(anchor)) => Ok(anchor),
                    Ok(None) => {
                        warn!(receipt_id = %receipt.id, txid = %txid, "Earlier anchor transaction dropped, resubmitting");
                        self.parts().ledger.anchor(&hash).await
                    }
                    Err(e) => Err(e),
                },
                None => self.parts().ledger.anchor(&hash).await,
            };
            match result {
                Ok(anchor) => {
                    let at = anchor.block_time.unwrap_or_else(Utc::now);
                    let next = self
                        .commit(&receipt, receipt.anchored(anchor.txid, Some(anchor.block_number), at)?)
                        .await?;
                    info!(
                        receipt_id = %next.id,
                        content_hash = %hash,
                        txid = next.ledger_txid.as_deref().unwrap_or_default(),
                        "Receipt anchored"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retryable() && tried < policy.max_attempts => {
                    let delay = policy.backoff(tried);
                    warn!(
                        receipt_id = %receipt.id,
                        attempt = tried,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Anchor attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    if let EvidenceError::AnchorTimeout { txid } = &e {
                        if let Some(found) = self.reconcile(&hash).await {
                            return self.settle_anchored_from_chain(&receipt, found).await;
                        }
                        outstanding = txid.clone();
                    }
                }
                Err(e) => {
                    warn!(receipt_id = %receipt.id, attempt = tried, error = %e, "Anchoring failed");
                    self.commit(&receipt, receipt.failed(e.to_string())?).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Look for an existing anchoring event; lookup errors count as absent.
    async fn reconcile(&self, hash: &ContentHash) -> Option<ChainMatch> {
        match self.parts().scanner.find(hash).await {
            Ok(found) => found,
            Err(e) => {
                warn!(content_hash = %hash, error = %e, "Reconciliation lookup failed");
                None
            }
        }
    }

    async fn settle_anchored_from_chain(&self, receipt: &Receipt, found: ChainMatch) -> Result<()> {
        info!(
            receipt_id = %receipt.id,
            txid = %found.txid,
            "Anchor found on ledger, settling without resubmission"
        );
        let next = receipt.anchored(found.txid, Some(found.block_number), found.anchored_at)?;
        self.commit(receipt, next).await?;
        Ok(())
    }

    /// Persist `next` if `current` is still the stored revision, then publish.
    async fn commit(&self, current: &Receipt, next: Receipt) -> Result<Receipt> {
        if !self
            .parts()
            .store
            .compare_and_set(current.revision, &next)
            .await?
        {
            return Err(EvidenceError::Conflict(format!(
                "receipt {} changed concurrently (expected revision {})",
                current.id, current.revision
            )));
        }
        self.parts().notifier.publish(next.snapshot());
        Ok(next)
    }
}

fn validate_callback_url(url: String) -> Result<String> {
    let ok = (url.starts_with("https://") || url.starts_with("http://"))
        && !url.chars().any(char::is_whitespace)
        && url.len() <= 2048;
    if !ok {
        return Err(EvidenceError::Validation(format!("invalid callback_url: {url}")));
    }
    Ok(url)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::anchor::scan::LogSource;
    use crate::bundle::{Document, DocumentRenderer, StatementRenderer};
    use crate::crypto::sign::ServiceKey;
    use crate::state::memory::MemoryReceiptStore;
    use crate::state::models::tests::demo_facts;
    use crate::storage::memory::MemoryStorage;
    use crate::testing::{MockLedger, Outcome};
    use crate::verify::Verifier;

    pub(crate) struct Harness {
        pub pipeline: ReceiptPipeline,
        pub ledger: Arc<MockLedger>,
        pub store: Arc<MemoryReceiptStore>,
        pub storage: Arc<MemoryStorage>,
        pub scanner: Arc<LogScanner>,
    }

    pub(crate) fn harness_with(max_attempts: u32, renderer: Box<dyn DocumentRenderer>) -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let store = Arc::new(MemoryReceiptStore::new());
        let storage = Arc::new(MemoryStorage::new());
        let source: Arc<dyn LogSource> = ledger.clone();
        let scanner = Arc::new(LogScanner::new(source, 10_000, 500));
        let pipeline = ReceiptPipeline::new(PipelineParts {
            store: store.clone(),
            packager: Packager::new(ServiceKey::from_seed(&[1u8; 32]), renderer),
            ledger: ledger.clone(),
            scanner: scanner.clone(),
            storage: storage.clone(),
            notifier: Arc::new(Notifier::local()),
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            public_base_url: "https://evidence.example".into(),
        });
        Harness {
            pipeline,
            ledger,
            store,
            storage,
            scanner,
        }
    }

    pub(crate) fn harness(max_attempts: u32) -> Harness {
        harness_with(max_attempts, Box::new(StatementRenderer))
    }

    struct BrokenRenderer;

    impl DocumentRenderer for BrokenRenderer {
        fn render(&self, _facts: &TransferFacts) -> Result<Vec<Document>> {
            Err(EvidenceError::BundleBuild("schema validation failed".into()))
        }
    }

    async fn run_to_end(h: &Harness, id: Uuid) -> Receipt {
        tokio::time::timeout(Duration::from_secs(5), h.pipeline.trigger(id))
            .await
            .unwrap();
        h.pipeline.get(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let h = harness(3);
        let intake = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap();
        assert!(intake.is_created());
        assert_eq!(intake.receipt().status, ReceiptStatus::Pending);

        let receipt = run_to_end(&h, intake.receipt().id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        let hash = receipt.content_hash.unwrap();
        assert_eq!(hash.to_hex().len(), 64);
        let txid = receipt.ledger_txid.clone().unwrap();
        assert!(txid.starts_with("0x"));
        assert_eq!(txid.len(), 66);
        assert!(receipt.anchored_at.is_some());
        assert_eq!(
            receipt.bundle_location.as_deref(),
            Some(format!("https://evidence.example/v1/receipts/{}/bundle", receipt.id).as_str())
        );

        let stored = h.pipeline.bundle(receipt.id).await.unwrap();
        assert_eq!(ContentHash::of(&stored), hash);
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_bundle_is_reproducible_from_facts() {
        let h = harness(3);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;
        let receipt = run_to_end(&h, id).await;

        let packager = Packager::new(ServiceKey::from_seed(&[1u8; 32]), Box::new(StatementRenderer));
        let rebuilt = packager.package(&receipt.facts).unwrap();
        assert_eq!(Some(rebuilt.content_hash), receipt.content_hash);
    }

    #[tokio::test]
    async fn test_duplicate_intake_returns_existing() {
        let h = harness(3);
        let first = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap();
        let id = first.receipt().id;
        run_to_end(&h, id).await;

        let second = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.receipt().id, id);
        assert_eq!(second.receipt().status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_intake_rejected() {
        let h = harness(3);
        let mut facts = demo_facts("demo:tip:1");
        facts.amount = "-1".into();
        assert!(matches!(
            h.pipeline.intake(facts, None).await,
            Err(EvidenceError::Validation(_))
        ));
        assert!(matches!(
            h.pipeline
                .intake(demo_facts("demo:tip:2"), Some("ftp://x".into()))
                .await,
            Err(EvidenceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_anchor_once() {
        let h = harness(3);
        h.ledger.set_delay(Duration::from_millis(50));
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let runs: Vec<ProcessingRun> = (0..16).map(|_| h.pipeline.trigger(id)).collect();
        futures::future::join_all(runs).await;

        let receipt = h.pipeline.get(id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_hash_and_is_verifiable() {
        let h = harness(1);
        h.ledger.script([Outcome::TimeoutAfterLanding]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert!(receipt.ledger_txid.is_none());
        assert!(receipt.anchored_at.is_none());
        let hash = receipt.content_hash.unwrap();
        assert!(receipt.failure_reason.unwrap().contains("timed out"));

        let verifier = Verifier::new(h.scanner.clone(), h.storage.clone(), None);
        let outcome = verifier.verify_hash(&hash).await;
        assert!(outcome.matches);

        // Re-drive settles from the ledger without a second submission.
        let redriven = h.pipeline.retry(id).await.unwrap();
        assert_eq!(redriven.attempt, 2);
        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(receipt.content_hash, Some(hash));
        assert_eq!(receipt.ledger_txid, outcome.ledger_txid);
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_timeout_reconciled_before_resubmitting() {
        let h = harness(3);
        h.ledger.script([Outcome::TimeoutAfterLanding]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_unmined_transaction_awaited_not_resubmitted() {
        let h = harness(3);
        h.ledger.script([Outcome::TimeoutInMempool]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 1);
        assert_eq!(h.ledger.await_calls(), 1);
        assert_eq!(receipt.ledger_txid.as_deref(), Some(format!("0x{:064x}", 0xa001).as_str()));
    }

    #[tokio::test]
    async fn test_lost_timeout_resubmits() {
        let h = harness(3);
        h.ledger.script([Outcome::TimeoutLost]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let h = harness(3);
        h.ledger.script([Outcome::Fail { retryable: true }, Outcome::Fail { retryable: true }]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(h.ledger.anchor_calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let h = harness(2);
        h.ledger.script([Outcome::Fail { retryable: true }; 5]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert_eq!(h.ledger.anchor_calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let h = harness(3);
        h.ledger.script([Outcome::Fail { retryable: false }]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert!(receipt.content_hash.is_some());
        assert_eq!(h.ledger.anchor_calls(), 1);
    }

    #[tokio::test]
    async fn test_bundle_failure_fails_immediately() {
        let h = harness_with(3, Box::new(BrokenRenderer));
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert!(receipt.content_hash.is_none());
        assert!(receipt.failure_reason.unwrap().contains("schema validation failed"));
        assert_eq!(h.ledger.anchor_calls(), 0);
        assert!(matches!(
            h.pipeline.bundle(id).await,
            Err(EvidenceError::ArtifactNotFound(_))
        ));
    }

    /// Backend that silently stores different bytes than it was given.
    struct CorruptingStorage(MemoryStorage);

    #[async_trait::async_trait]
    impl StorageBackend for CorruptingStorage {
        fn name(&self) -> &str {
            "corrupting"
        }

        async fn upload(&self, key: &str, data: &[u8]) -> Result<crate::storage::UploadResult> {
            let mut bytes = data.to_vec();
            bytes[0] ^= 0xff;
            self.0.upload(key, &bytes).await
        }

        async fn download(&self, key: &str) -> Result<Vec<u8>> {
            self.0.download(key).await
        }
    }

    #[tokio::test]
    async fn test_corrupted_upload_fails_before_anchoring() {
        let ledger = Arc::new(MockLedger::new());
        let source: Arc<dyn LogSource> = ledger.clone();
        let pipeline = ReceiptPipeline::new(PipelineParts {
            store: Arc::new(MemoryReceiptStore::new()),
            packager: Packager::new(ServiceKey::from_seed(&[1u8; 32]), Box::new(StatementRenderer)),
            ledger: ledger.clone(),
            scanner: Arc::new(LogScanner::new(source, 10_000, 500)),
            storage: Arc::new(CorruptingStorage(MemoryStorage::new())),
            notifier: Arc::new(Notifier::local()),
            retry: RetryPolicy::default(),
            public_base_url: String::new(),
        });
        let id = pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;
        tokio::time::timeout(Duration::from_secs(5), pipeline.trigger(id))
            .await
            .unwrap();

        let receipt = pipeline.get(id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Failed);
        assert!(receipt.content_hash.is_none());
        assert!(receipt.failure_reason.unwrap().contains("corrupting backend"));
        assert_eq!(ledger.anchor_calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let h = harness(3);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;
        run_to_end(&h, id).await;
        assert!(matches!(
            h.pipeline.retry(id).await,
            Err(EvidenceError::InvalidTransition(_))
        ));
        assert!(matches!(
            h.pipeline.retry(Uuid::now_v7()).await,
            Err(EvidenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_pending_after_restart() {
        let h = harness(3);
        let receipt = Receipt::new(demo_facts("demo:tip:9").validated().unwrap(), None);
        let id = receipt.id;
        h.store.insert_if_absent(receipt).await.unwrap();

        assert_eq!(h.pipeline.resume_pending().await.unwrap(), 1);
        let receipt = run_to_end(&h, id).await;
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
    }

    #[tokio::test]
    async fn test_subscriber_sees_terminal_state() {
        let h = harness(3);
        h.ledger.set_delay(Duration::from_millis(20));
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        let mut rx = h.pipeline.subscribe(id).await.unwrap();
        let terminal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snap = rx.borrow_and_update().clone();
                if snap.status.is_terminal() {
                    return snap;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(terminal.status, ReceiptStatus::Anchored);
        assert!(terminal.ledger_txid.is_some());
    }

    #[tokio::test]
    async fn test_hash_immutable_across_attempts() {
        let h = harness(1);
        h.ledger.script([Outcome::Fail { retryable: true }]);
        let id = h.pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;
        let failed = run_to_end(&h, id).await;
        assert_eq!(failed.status, ReceiptStatus::Failed);

        h.pipeline.retry(id).await.unwrap();
        let anchored = run_to_end(&h, id).await;
        assert_eq!(anchored.status, ReceiptStatus::Anchored);
        assert_eq!(anchored.content_hash, failed.content_hash);
        assert_eq!(anchored.attempt, 2);
    }

    /// Store whose acknowledgement of a `failed` write arrives late, as with
    /// a database round trip after the row is already visible.
    struct SlowFailureAck {
        inner: MemoryReceiptStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ReceiptStore for SlowFailureAck {
        async fn insert_if_absent(&self, receipt: Receipt) -> Result<Intake> {
            self.inner.insert_if_absent(receipt).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Receipt>> {
            self.inner.get(id).await
        }

        async fn find_by_reference(&self, reference: &str) -> Result<Option<Receipt>> {
            self.inner.find_by_reference(reference).await
        }

        async fn compare_and_set(&self, expected_revision: u64, next: &Receipt) -> Result<bool> {
            let stored = self.inner.compare_and_set(expected_revision, next).await?;
            if next.status == ReceiptStatus::Failed {
                tokio::time::sleep(self.delay).await;
            }
            Ok(stored)
        }

        async fn list_by_status(&self, status: ReceiptStatus, limit: usize) -> Result<Vec<Receipt>> {
            self.inner.list_by_status(status, limit).await
        }

        async fn list_recent(&self, limit: usize) -> Result<Vec<Receipt>> {
            self.inner.list_recent(limit).await
        }
    }

    #[tokio::test]
    async fn test_redrive_while_failure_is_committing() {
        let ledger = Arc::new(MockLedger::new());
        ledger.script([Outcome::Fail { retryable: false }]);
        let source: Arc<dyn LogSource> = ledger.clone();
        let pipeline = ReceiptPipeline::new(PipelineParts {
            store: Arc::new(SlowFailureAck {
                inner: MemoryReceiptStore::new(),
                delay: Duration::from_millis(50),
            }),
            packager: Packager::new(ServiceKey::from_seed(&[1u8; 32]), Box::new(StatementRenderer)),
            ledger: ledger.clone(),
            scanner: Arc::new(LogScanner::new(source, 10_000, 500)),
            storage: Arc::new(MemoryStorage::new()),
            notifier: Arc::new(Notifier::local()),
            retry: RetryPolicy::default(),
            public_base_url: String::new(),
        });
        let id = pipeline.intake(demo_facts("demo:tip:1"), None).await.unwrap().receipt().id;

        // Re-drive as soon as the failure is visible, before its write returns.
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.get(id).await.unwrap().status != ReceiptStatus::Failed {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        pipeline.retry(id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), pipeline.trigger(id))
            .await
            .unwrap();
        let receipt = pipeline.get(id).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Anchored);
        assert_eq!(receipt.attempt, 2);
        assert_eq!(ledger.anchor_calls(), 2);
    }
}
