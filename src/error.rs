use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Bundle build failed: {0}")]
    BundleBuild(String),

    #[error("Anchor submission failed: {reason}")]
    AnchorSubmit { reason: String, retryable: bool },

    #[error("Anchor confirmation timed out (tx: {})", txid.as_deref().unwrap_or("not broadcast"))]
    AnchorTimeout { txid: Option<String> },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Ledger lookup failed: {0}")]
    Ledger(String),

    #[error("Receipt store error: {0}")]
    Store(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Receipt not found: {0}")]
    NotFound(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EvidenceError {
    /// Whether the processing attempt may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            EvidenceError::AnchorSubmit { retryable, .. } => *retryable,
            EvidenceError::AnchorTimeout { .. } => true,
            EvidenceError::Ledger(_) => true,
            _ => false,
        }
    }

    pub(crate) fn submit(reason: impl Into<String>, retryable: bool) -> Self {
        EvidenceError::AnchorSubmit {
            reason: reason.into(),
            retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, EvidenceError>;
