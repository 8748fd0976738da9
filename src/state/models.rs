/// Receipt data model and its state transitions.
///
/// A `Receipt` tracks one transfer event through the pipeline. Every
/// transition is a pure function returning the next version of the
/// receipt; the store persists it with compare-and-set on `revision`.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};

/// Receipt lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Pending,
    Anchored,
    Failed,
}

impl ReceiptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReceiptStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Anchored => "anchored",
            ReceiptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "anchored" => Ok(ReceiptStatus::Anchored),
            "failed" => Ok(ReceiptStatus::Failed),
            other => Err(EvidenceError::Store(format!("unknown receipt status: {other}"))),
        }
    }
}

/// Facts about the on-chain transfer being evidenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFacts {
    /// Caller-supplied idempotency key, e.g. `capella:tip:42`.
    pub reference: String,
    /// Source chain identifier (e.g. "coston2", "flare").
    pub chain: String,
    /// Transaction hash of the transfer on the source chain.
    pub source_tx_hash: String,
    /// Exact decimal amount. Never parsed into a float.
    pub amount: String,
    pub currency: String,
    pub sender: String,
    pub receiver: String,
}

impl TransferFacts {
    /// Validate and normalize caller input.
    ///
    /// The amount is canonicalized (no leading zeros, no trailing
    /// fractional zeros) so that equal amounts produce equal bundles.
    pub fn validated(mut self) -> Result<Self> {
        self.reference = required("reference", &self.reference, 256)?;
        self.chain = required("chain", &self.chain, 64)?.to_lowercase();
        self.source_tx_hash = required("source_tx_hash", &self.source_tx_hash, 128)?;
        self.sender = required("sender", &self.sender, 128)?;
        self.receiver = required("receiver", &self.receiver, 128)?;
        self.amount = canonical_amount(&self.amount)?;

        let currency = required("currency", &self.currency, 12)?.to_uppercase();
        if currency.len() < 2 || !currency.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EvidenceError::Validation(format!(
                "currency must be 2-12 alphanumeric characters, got {currency:?}"
            )));
        }
        self.currency = currency;

        for (field, value) in [
            ("reference", &self.reference),
            ("chain", &self.chain),
            ("source_tx_hash", &self.source_tx_hash),
            ("sender", &self.sender),
            ("receiver", &self.receiver),
        ] {
            if value.chars().any(char::is_whitespace) {
                return Err(EvidenceError::Validation(format!(
                    "{field} must not contain whitespace"
                )));
            }
        }
        Ok(self)
    }
}

fn required(field: &str, value: &str, max_len: usize) -> Result<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(EvidenceError::Validation(format!("{field} is required")));
    }
    if v.len() > max_len {
        return Err(EvidenceError::Validation(format!(
            "{field} exceeds {max_len} characters"
        )));
    }
    Ok(v.to_string())
}

/// Canonical form of a non-negative exact decimal string.
pub fn canonical_amount(raw: &str) -> Result<String> {
    let s = raw.trim();
    let invalid = || EvidenceError::Validation(format!("amount must be a plain decimal string, got {raw:?}"));

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if s.ends_with('.') && frac_part.is_empty() && s.contains('.') {
        return Err(invalid());
    }

    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    if int_part == "0" && frac_part.is_empty() {
        return Err(EvidenceError::Validation("amount must be greater than zero".into()));
    }

    Ok(if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    })
}

/// Off-chain record tracking one transfer event through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: Uuid,
    pub facts: TransferFacts,
    pub callback_url: Option<String>,
    pub status: ReceiptStatus,
    pub content_hash: Option<ContentHash>,
    pub ledger_txid: Option<String>,
    pub block_number: Option<u64>,
    pub bundle_location: Option<String>,
    pub failure_reason: Option<String>,
    /// 1-based processing attempt.
    pub attempt: u32,
    /// Bumped on every persisted transition.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub anchored_at: Option<DateTime<Utc>>,
}

impl Receipt {
    pub fn new(facts: TransferFacts, callback_url: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            facts,
            callback_url,
            status: ReceiptStatus::Pending,
            content_hash: None,
            ledger_txid: None,
            block_number: None,
            bundle_location: None,
            failure_reason: None,
            attempt: 1,
            revision: 0,
            created_at: Utc::now(),
            anchored_at: None,
        }
    }

    fn next(&self) -> Self {
        let mut next = self.clone();
        next.revision += 1;
        next
    }

    fn require_pending(&self, transition: &str) -> Result<()> {
        if self.status != ReceiptStatus::Pending {
            return Err(EvidenceError::InvalidTransition(format!(
                "{transition}: receipt {} is {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Record the bundle hash. A hash, once set, may only be re-recorded
    /// with the identical value.
    pub fn with_content_hash(&self, hash: ContentHash, location: Option<String>) -> Result<Self> {
        self.require_pending("record content hash")?;
        if let Some(existing) = self.content_hash {
            if existing != hash {
                return Err(EvidenceError::InvalidTransition(format!(
                    "receipt {} already has content hash {existing}, refusing {hash}",
                    self.id
                )));
            }
        }
        let mut next = self.next();
        next.content_hash = Some(hash);
        if next.bundle_location.is_none() {
            next.bundle_location = location;
        }
        Ok(next)
    }

    /// pending -> anchored.
    pub fn anchored(
        &self,
        txid: String,
        block_number: Option<u64>,
        anchored_at: DateTime<Utc>,
    ) -> Result<Self> {
        self.require_pending("mark anchored")?;
        if self.content_hash.is_none() {
            return Err(EvidenceError::InvalidTransition(format!(
                "receipt {} cannot be anchored without a content hash",
                self.id
            )));
        }
        if let Some(existing) = &self.ledger_txid {
            return Err(EvidenceError::InvalidTransition(format!(
                "receipt {} already has ledger tx {existing}",
                self.id
            )));
        }
        let mut next = self.next();
        next.status = ReceiptStatus::Anchored;
        next.ledger_txid = Some(txid);
        next.block_number = block_number;
        next.anchored_at = Some(anchored_at);
        next.failure_reason = None;
        Ok(next)
    }

    /// pending -> failed. The content hash, if any, is preserved.
    pub fn failed(&self, reason: impl Into<String>) -> Result<Self> {
        self.require_pending("mark failed")?;
        let mut next = self.next();
        next.status = ReceiptStatus::Failed;
        next.failure_reason = Some(reason.into());
        Ok(next)
    }

    /// failed -> pending, as a fresh attempt under the same reference.
    pub fn redriven(&self) -> Result<Self> {
        if self.status != ReceiptStatus::Failed {
            return Err(EvidenceError::InvalidTransition(format!(
                "only failed receipts can be retried; receipt {} is {}",
                self.id,
                self.status.as_str()
            )));
        }
        let mut next = self.next();
        next.status = ReceiptStatus::Pending;
        next.failure_reason = None;
        next.attempt += 1;
        Ok(next)
    }

    pub fn snapshot(&self) -> ReceiptSnapshot {
        ReceiptSnapshot {
            id: self.id,
            reference: self.facts.reference.clone(),
            status: self.status,
            content_hash: self.content_hash,
            ledger_txid: self.ledger_txid.clone(),
            block_number: self.block_number,
            bundle_url: self.bundle_location.clone(),
            failure_reason: self.failure_reason.clone(),
            attempt: self.attempt,
            revision: self.revision,
            created_at: self.created_at,
            anchored_at: self.anchored_at,
            callback_url: self.callback_url.clone(),
        }
    }
}

/// Read-only view of a receipt, as returned by status queries, pushed to
/// live subscribers and POSTed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptSnapshot {
    pub id: Uuid,
    pub reference: String,
    pub status: ReceiptStatus,
    pub content_hash: Option<ContentHash>,
    pub ledger_txid: Option<String>,
    pub block_number: Option<u64>,
    pub bundle_url: Option<String>,
    pub failure_reason: Option<String>,
    pub attempt: u32,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub anchored_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub callback_url: Option<String>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn demo_facts(reference: &str) -> TransferFacts {
        TransferFacts {
            reference: reference.to_string(),
            chain: "coston2".to_string(),
            source_tx_hash: format!("0x{}", "ab".repeat(32)),
            amount: "10.5".to_string(),
            currency: "FLR".to_string(),
            sender: "0x1111111111111111111111111111111111111111".to_string(),
            receiver: "0x2222222222222222222222222222222222222222".to_string(),
        }
    }

    #[test]
    fn test_canonical_amount() {
        assert_eq!(canonical_amount("10.5").unwrap(), "10.5");
        assert_eq!(canonical_amount("010.500").unwrap(), "10.5");
        assert_eq!(canonical_amount("7").unwrap(), "7");
        assert_eq!(canonical_amount("7.000").unwrap(), "7");
        assert_eq!(canonical_amount(".25").unwrap(), "0.25");
        assert_eq!(
            canonical_amount("0.000000000000000001").unwrap(),
            "0.000000000000000001"
        );
        assert_eq!(
            canonical_amount("123456789012345678901234567890.1").unwrap(),
            "123456789012345678901234567890.1"
        );
    }

    #[test]
    fn test_canonical_amount_rejects() {
        for bad in ["", ".", "-1", "1e5", "1.2.3", "abc", "0", "0.000", "1.", " "] {
            assert!(canonical_amount(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_facts_validation_normalizes() {
        let mut facts = demo_facts("demo:tip:1");
        facts.currency = "flr".into();
        facts.chain = "Coston2".into();
        facts.amount = "10.50".into();
        let facts = facts.validated().unwrap();
        assert_eq!(facts.currency, "FLR");
        assert_eq!(facts.chain, "coston2");
        assert_eq!(facts.amount, "10.5");
    }

    #[test]
    fn test_facts_validation_rejects() {
        let mut facts = demo_facts("");
        assert!(facts.clone().validated().is_err());
        facts.reference = "has space".into();
        assert!(facts.clone().validated().is_err());
        let mut facts = demo_facts("demo:tip:1");
        facts.currency = "$".into();
        assert!(facts.validated().is_err());
    }

    #[test]
    fn test_happy_transitions() {
        let r = Receipt::new(demo_facts("demo:tip:1"), None);
        assert_eq!(r.status, ReceiptStatus::Pending);
        assert_eq!(r.revision, 0);

        let hash = ContentHash::of(b"bundle");
        let r = r.with_content_hash(hash, Some("k".into())).unwrap();
        assert_eq!(r.revision, 1);
        let r = r.anchored("0xtx".into(), Some(9), Utc::now()).unwrap();
        assert_eq!(r.status, ReceiptStatus::Anchored);
        assert!(r.anchored_at.is_some());
        assert_eq!(r.revision, 2);
    }

    #[test]
    fn test_content_hash_is_immutable() {
        let r = Receipt::new(demo_facts("demo:tip:1"), None)
            .with_content_hash(ContentHash::of(b"a"), None)
            .unwrap();
        assert!(r.with_content_hash(ContentHash::of(b"a"), None).is_ok());
        assert!(r.with_content_hash(ContentHash::of(b"b"), None).is_err());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        let r = Receipt::new(demo_facts("demo:tip:1"), None)
            .with_content_hash(ContentHash::of(b"a"), None)
            .unwrap()
            .anchored("0xtx".into(), None, Utc::now())
            .unwrap();
        assert!(r.failed("late").is_err());
        assert!(r.anchored("0xother".into(), None, Utc::now()).is_err());
        assert!(r.redriven().is_err());
    }

    #[test]
    fn test_anchor_requires_hash() {
        let r = Receipt::new(demo_facts("demo:tip:1"), None);
        assert!(r.anchored("0xtx".into(), None, Utc::now()).is_err());
    }

    #[test]
    fn test_redrive_keeps_hash() {
        let hash = ContentHash::of(b"a");
        let r = Receipt::new(demo_facts("demo:tip:1"), None)
            .with_content_hash(hash, None)
            .unwrap()
            .failed("timeout")
            .unwrap();
        assert_eq!(r.anchored_at, None);
        let r = r.redriven().unwrap();
        assert_eq!(r.status, ReceiptStatus::Pending);
        assert_eq!(r.attempt, 2);
        assert_eq!(r.content_hash, Some(hash));
        assert_eq!(r.failure_reason, None);
    }

    #[test]
    fn test_snapshot_serializes_status() {
        let r = Receipt::new(demo_facts("demo:tip:1"), Some("https://cb".into()));
        let json = serde_json::to_value(r.snapshot()).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["reference"], "demo:tip:1");
        assert!(json.get("callback_url").is_none());
    }
}
