/// Read-path verification: does a bundle (or hash) match an on-chain anchor?
///
/// Independent of receipt processing and safe to call concurrently. A
/// bundle is integrity-checked before any ledger access; ledger failures
/// are reported in `errors` with `matches: false` rather than as errors.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::anchor::scan::LogScanner;
use crate::bundle;
use crate::crypto::hash::ContentHash;
use crate::crypto::sign::PUBLIC_KEY_LEN;
use crate::error::{EvidenceError, Result};
use crate::storage::{self, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub matches: bool,
    pub content_hash: ContentHash,
    pub ledger_txid: Option<String>,
    pub block_number: Option<u64>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl VerifyOutcome {
    fn unmatched(content_hash: ContentHash) -> Self {
        Self {
            matches: false,
            content_hash,
            ledger_txid: None,
            block_number: None,
            anchored_at: None,
            errors: Vec::new(),
        }
    }
}

pub struct Verifier {
    scanner: Arc<LogScanner>,
    storage: Arc<dyn StorageBackend>,
    trusted_signer: Option<[u8; PUBLIC_KEY_LEN]>,
}

impl Verifier {
    pub fn new(
        scanner: Arc<LogScanner>,
        storage: Arc<dyn StorageBackend>,
        trusted_signer: Option<[u8; PUBLIC_KEY_LEN]>,
    ) -> Self {
        Self {
            scanner,
            storage,
            trusted_signer,
        }
    }

    /// Look up `hash` on the ledger.
    pub async fn verify_hash(&self, hash: &ContentHash) -> VerifyOutcome {
        let mut outcome = VerifyOutcome::unmatched(*hash);
        match self.scanner.find(hash).await {
            Ok(Some(found)) => {
                outcome.matches = true;
                outcome.ledger_txid = Some(found.txid);
                outcome.block_number = Some(found.block_number);
                outcome.anchored_at = Some(found.anchored_at);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(content_hash = %hash, error = %e, "ledger lookup failed during verification");
                outcome.errors.push(e.to_string());
            }
        }
        outcome
    }

    /// Check a bundle's integrity, then look up its hash.
    pub async fn verify_bundle(&self, bytes: &[u8]) -> Result<VerifyOutcome> {
        let verified = bundle::verify_integrity(bytes, self.trusted_signer.as_ref())?;
        tracing::debug!(
            content_hash = %verified.content_hash,
            reference = %verified.facts.reference,
            "bundle integrity verified"
        );
        Ok(self.verify_hash(&verified.content_hash).await)
    }

    /// Verify a stored bundle. `reference` is a receipt id, a bundle URL
    /// ending in `/receipts/<id>/bundle`, or a raw storage key.
    pub async fn verify_reference(&self, reference: &str) -> Result<VerifyOutcome> {
        let key = resolve_bundle_ref(reference)?;
        let bytes = self.storage.download(&key).await?;
        self.verify_bundle(&bytes).await
    }
}

pub(crate) fn resolve_bundle_ref(reference: &str) -> Result<String> {
    let trimmed = reference.trim();
    if let Ok(id) = Uuid::parse_str(trimmed) {
        return Ok(storage::bundle_key(&id));
    }
    if let Some(rest) = trimmed.trim_end_matches('/').strip_suffix("/bundle") {
        if let Some((_, id)) = rest.rsplit_once("/receipts/") {
            let id = Uuid::parse_str(id)
                .map_err(|_| EvidenceError::Validation(format!("bad receipt id in bundle ref: {id}")))?;
            return Ok(storage::bundle_key(&id));
        }
    }
    if trimmed.contains("://") {
        return Err(EvidenceError::Validation(format!(
            "unsupported bundle reference: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{Document, Packager, StatementRenderer};
    use crate::crypto::sign::ServiceKey;
    use crate::state::models::tests::demo_facts;
    use crate::storage::memory::MemoryStorage;
    use crate::testing::MockLedger;

    fn packager() -> Packager {
        Packager::new(ServiceKey::from_seed(&[3u8; 32]), Box::new(StatementRenderer))
    }

    fn verifier(ledger: Arc<MockLedger>, storage: Arc<MemoryStorage>) -> Verifier {
        let scanner = Arc::new(LogScanner::new(ledger, 10_000, 500));
        Verifier::new(scanner, storage, Some(packager().public_key()))
    }

    #[tokio::test]
    async fn test_anchored_bundle_matches() {
        use crate::anchor::LedgerAnchor;

        let ledger = Arc::new(MockLedger::new());
        let bundle = packager().package(&demo_facts("demo:tip:1")).unwrap();
        let receipt = ledger.anchor(&bundle.content_hash).await.unwrap();

        let v = verifier(ledger, Arc::new(MemoryStorage::new()));
        let outcome = v.verify_bundle(&bundle.bytes).await.unwrap();
        assert!(outcome.matches);
        assert_eq!(outcome.ledger_txid, Some(receipt.txid));
        assert_eq!(outcome.anchored_at, receipt.block_time);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unanchored_hash_is_not_an_error() {
        let v = verifier(Arc::new(MockLedger::new()), Arc::new(MemoryStorage::new()));
        let outcome = v.verify_hash(&ContentHash::of(b"never anchored")).await;
        assert!(!outcome.matches);
        assert!(outcome.ledger_txid.is_none());
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_bundle_fails_before_ledger() {
        let ledger = Arc::new(MockLedger::new());
        let mut bytes = packager().package(&demo_facts("demo:tip:1")).unwrap().bytes;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;

        let v = verifier(ledger.clone(), Arc::new(MemoryStorage::new()));
        let err = v.verify_bundle(&bytes).await.unwrap_err();
        assert!(matches!(err, EvidenceError::Integrity(_)));
        assert_eq!(ledger.scan_calls(), 0);
    }

    #[tokio::test]
    async fn test_foreign_signer_rejected() {
        let facts = demo_facts("demo:tip:1");
        let other = ServiceKey::from_seed(&[4u8; 32]);
        let forged = bundle::build(&facts, &[Document::new("statement.txt", b"x".to_vec())], &other).unwrap();
        let v = verifier(Arc::new(MockLedger::new()), Arc::new(MemoryStorage::new()));
        assert!(matches!(
            v.verify_bundle(&forged.bytes).await,
            Err(EvidenceError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_errors_are_reported() {
        let ledger = Arc::new(MockLedger::new());
        ledger.set_scans_fail(true);
        let v = verifier(ledger, Arc::new(MemoryStorage::new()));
        let outcome = v.verify_hash(&ContentHash::of(b"x")).await;
        assert!(!outcome.matches);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_by_reference() {
        use crate::anchor::LedgerAnchor;

        let ledger = Arc::new(MockLedger::new());
        let storage = Arc::new(MemoryStorage::new());
        let bundle = packager().package(&demo_facts("demo:tip:1")).unwrap();
        ledger.anchor(&bundle.content_hash).await.unwrap();
        let id = Uuid::now_v7();
        storage.upload(&storage::bundle_key(&id), &bundle.bytes).await.unwrap();

        let v = verifier(ledger, storage);
        assert!(v.verify_reference(&id.to_string()).await.unwrap().matches);
        let url = format!("https://evidence.example/v1/receipts/{id}/bundle");
        assert!(v.verify_reference(&url).await.unwrap().matches);
        assert!(matches!(
            v.verify_reference(&Uuid::now_v7().to_string()).await,
            Err(EvidenceError::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_bundle_ref() {
        let id = Uuid::nil();
        let key = storage::bundle_key(&id);
        assert_eq!(resolve_bundle_ref(&id.to_string()).unwrap(), key);
        assert_eq!(
            resolve_bundle_ref(&format!("/v1/receipts/{id}/bundle")).unwrap(),
            key
        );
        assert_eq!(resolve_bundle_ref("abc/evidence.bundle").unwrap(), "abc/evidence.bundle");
        assert!(resolve_bundle_ref("https://elsewhere.example/file").is_err());
    }
}
