/// Receipt state layer.
///
/// The pipeline consumes persistence through the narrow [`ReceiptStore`]
/// interface: exclusive creation keyed on the external reference, reads,
/// and compare-and-set on the receipt revision. Two implementations:
/// - PostgreSQL via sqlx (production)
/// - DashMap in memory (development and tests)
pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EvidenceError, Result};
use models::{Receipt, ReceiptStatus};

/// Outcome of an exclusive intake insert.
#[derive(Debug, Clone)]
pub enum Intake {
    /// A new receipt was created.
    Created(Receipt),
    /// A receipt with the same external reference already existed.
    Existing(Receipt),
}

impl Intake {
    pub fn receipt(&self) -> &Receipt {
        match self {
            Intake::Created(r) | Intake::Existing(r) => r,
        }
    }

    pub fn into_receipt(self) -> Receipt {
        match self {
            Intake::Created(r) | Intake::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Intake::Created(_))
    }
}

/// Injectable receipt table.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Insert `receipt` unless one with the same external reference exists,
    /// in which case the existing receipt is returned unchanged. A different
    /// reference for an already-recorded `(chain, source_tx_hash)` is a
    /// conflict.
    async fn insert_if_absent(&self, receipt: Receipt) -> Result<Intake>;

    async fn get(&self, id: Uuid) -> Result<Option<Receipt>>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Receipt>>;

    /// Replace the stored receipt with `next` only if its current revision
    /// equals `expected_revision`. Returns `false` when the revision moved.
    async fn compare_and_set(&self, expected_revision: u64, next: &Receipt) -> Result<bool>;

    /// Receipts in `status`, oldest first.
    async fn list_by_status(&self, status: ReceiptStatus, limit: usize) -> Result<Vec<Receipt>>;

    /// Most recently created receipts.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Receipt>>;
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| EvidenceError::Store(format!("connect failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EvidenceError::Store(format!("Migration failed: {e}")))
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
