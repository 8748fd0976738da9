/// In-memory receipt store backed by DashMap.
///
/// Data is lost on restart. Used when no `DATABASE_URL` is configured and
/// throughout the test suite.
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{Receipt, ReceiptStatus};
use super::{Intake, ReceiptStore};
use crate::error::{EvidenceError, Result};

#[derive(Default)]
pub struct MemoryReceiptStore {
    receipts: DashMap<Uuid, Receipt>,
    by_reference: DashMap<String, Uuid>,
    by_source_tx: DashMap<(String, String), Uuid>,
    /// Serializes intake so both unique indexes are claimed atomically.
    intake_lock: Mutex<()>,
}

impl MemoryReceiptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<Intake> {
        let _guard = self
            .intake_lock
            .lock()
            .map_err(|_| EvidenceError::Store("intake lock poisoned".into()))?;

        if let Some(id) = self.by_reference.get(&receipt.facts.reference).map(|e| *e) {
            let existing = self
                .receipts
                .get(&id)
                .map(|r| r.clone())
                .ok_or_else(|| EvidenceError::Store(format!("dangling reference index for {id}")))?;
            return Ok(Intake::Existing(existing));
        }

        let source_key = (
            receipt.facts.chain.clone(),
            receipt.facts.source_tx_hash.clone(),
        );
        if let Some(other) = self.by_source_tx.get(&source_key) {
            return Err(EvidenceError::Conflict(format!(
                "transfer {} on {} is already recorded as receipt {}",
                source_key.1,
                source_key.0,
                *other
            )));
        }

        self.by_reference
            .insert(receipt.facts.reference.clone(), receipt.id);
        self.by_source_tx.insert(source_key, receipt.id);
        self.receipts.insert(receipt.id, receipt.clone());
        Ok(Intake::Created(receipt))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Receipt>> {
        Ok(self.receipts.get(&id).map(|r| r.clone()))
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Receipt>> {
        let id = match self.by_reference.get(reference) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn compare_and_set(&self, expected_revision: u64, next: &Receipt) -> Result<bool> {
        match self.receipts.get_mut(&next.id) {
            Some(mut current) => {
                if current.revision != expected_revision {
                    return Ok(false);
                }
                *current = next.clone();
                Ok(true)
            }
            None => Err(EvidenceError::NotFound(next.id)),
        }
    }

    async fn list_by_status(&self, status: ReceiptStatus, limit: usize) -> Result<Vec<Receipt>> {
        let mut out: Vec<Receipt> = self
            .receipts
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Receipt>> {
        let mut out: Vec<Receipt> = self.receipts.iter().map(|r| r.clone()).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }
}
