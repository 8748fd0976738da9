/// PostgreSQL receipt store.
///
/// All queries use sqlx runtime-checked queries (not compile-time checked)
/// to avoid requiring a live database during development builds.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::models::{Receipt, ReceiptStatus, TransferFacts};
use super::{Database, Intake, ReceiptStore};
use crate::crypto::hash::ContentHash;
use crate::error::{EvidenceError, Result};

fn db_err(e: sqlx::Error) -> EvidenceError {
    EvidenceError::Store(e.to_string())
}

/// Row shape of the `receipts` table.
#[derive(Debug, Clone, FromRow)]
struct ReceiptRow {
    id: Uuid,
    reference: String,
    chain: String,
    source_tx_hash: String,
    amount: String,
    currency: String,
    sender: String,
    receiver: String,
    callback_url: Option<String>,
    status: String,
    content_hash: Option<Vec<u8>>,
    ledger_txid: Option<String>,
    block_number: Option<i64>,
    bundle_location: Option<String>,
    failure_reason: Option<String>,
    attempt: i32,
    revision: i64,
    created_at: DateTime<Utc>,
    anchored_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = EvidenceError;

    fn try_from(row: ReceiptRow) -> Result<Self> {
        let content_hash = match row.content_hash {
            Some(bytes) => {
                let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    EvidenceError::Store(format!("receipt {} has a malformed content hash", row.id))
                })?;
                Some(ContentHash::new(arr))
            }
            None => None,
        };

        Ok(Receipt {
            id: row.id,
            facts: TransferFacts {
                reference: row.reference,
                chain: row.chain,
                source_tx_hash: row.source_tx_hash,
                amount: row.amount,
                currency: row.currency,
                sender: row.sender,
                receiver: row.receiver,
            },
            callback_url: row.callback_url,
            status: ReceiptStatus::parse(&row.status)?,
            content_hash,
            ledger_txid: row.ledger_txid,
            block_number: row.block_number.map(|b| b as u64),
            bundle_location: row.bundle_location,
            failure_reason: row.failure_reason,
            attempt: row.attempt as u32,
            revision: row.revision as u64,
            created_at: row.created_at,
            anchored_at: row.anchored_at,
        })
    }
}

fn rows_to_receipts(rows: Vec<ReceiptRow>) -> Result<Vec<Receipt>> {
    rows.into_iter().map(Receipt::try_from).collect()
}

/// Receipt store over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgReceiptStore {
    pool: PgPool,
}

impl PgReceiptStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl ReceiptStore for PgReceiptStore {
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<Intake> {
        // Both unique constraints (reference, chain+source_tx_hash) are
        // enforced by the table; ON CONFLICT makes creation exclusive.
        let inserted = sqlx::query_as::<_, ReceiptRow>(
            r#"
            INSERT INTO receipts
            (id, reference, chain, source_tx_hash, amount, currency, sender, receiver,
             callback_url, status, attempt, revision, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(receipt.id)
        .bind(&receipt.facts.reference)
        .bind(&receipt.facts.chain)
        .bind(&receipt.facts.source_tx_hash)
        .bind(&receipt.facts.amount)
        .bind(&receipt.facts.currency)
        .bind(&receipt.facts.sender)
        .bind(&receipt.facts.receiver)
        .bind(&receipt.callback_url)
        .bind(receipt.status.as_str())
        .bind(receipt.attempt as i32)
        .bind(receipt.revision as i64)
        .bind(receipt.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(row) = inserted {
            return Ok(Intake::Created(row.try_into()?));
        }

        if let Some(existing) = self.find_by_reference(&receipt.facts.reference).await? {
            return Ok(Intake::Existing(existing));
        }

        Err(EvidenceError::Conflict(format!(
            "transfer {} on {} is already recorded under another reference",
            receipt.facts.source_tx_hash, receipt.facts.chain
        )))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Receipt>> {
        sqlx::query_as::<_, ReceiptRow>("SELECT * FROM receipts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Receipt::try_from)
            .transpose()
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Receipt>> {
        sqlx::query_as::<_, ReceiptRow>("SELECT * FROM receipts WHERE reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(Receipt::try_from)
            .transpose()
    }

    async fn compare_and_set(&self, expected_revision: u64, next: &Receipt) -> Result<bool> {
        // content_hash and ledger_txid are write-once at the row level too.
        let result = sqlx::query(
            r#"
            UPDATE receipts
            SET status = $3,
                content_hash = COALESCE(content_hash, $4),
                ledger_txid = COALESCE(ledger_txid, $5),
                block_number = $6,
                bundle_location = $7,
                failure_reason = $8,
                attempt = $9,
                revision = $10,
                anchored_at = $11
            WHERE id = $1 AND revision = $2
            "#,
        )
        .bind(next.id)
        .bind(expected_revision as i64)
        .bind(next.status.as_str())
        .bind(next.content_hash.map(|h| h.as_bytes().to_vec()))
        .bind(&next.ledger_txid)
        .bind(next.block_number.map(|b| b as i64))
        .bind(&next.bundle_location)
        .bind(&next.failure_reason)
        .bind(next.attempt as i32)
        .bind(next.revision as i64)
        .bind(next.anchored_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_status(&self, status: ReceiptStatus, limit: usize) -> Result<Vec<Receipt>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(
            "SELECT * FROM receipts WHERE status = $1 ORDER BY created_at LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_receipts(rows)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Receipt>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(
            "SELECT * FROM receipts ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows_to_receipts(rows)
    }
}
