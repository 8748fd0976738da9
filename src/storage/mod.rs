/// Pluggable artifact storage for evidence bundles.
///
/// Bundles are written once under `<receipt_id>/evidence.bundle` and served
/// back for download and verification by reference. Backends:
/// - Local filesystem (default, rooted at `ARTIFACTS_DIR`)
/// - In-memory (tests)
pub mod local;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::error::{EvidenceError, Result};

/// Metadata returned after a successful upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    /// Backend-specific storage key.
    pub storage_key: String,
    /// SHA-256 of the stored bytes.
    pub content_hash: [u8; 32],
    /// Size in bytes.
    pub size: u64,
}

impl UploadResult {
    pub(crate) fn for_data(key: &str, data: &[u8]) -> Self {
        Self {
            storage_key: key.to_string(),
            content_hash: hash::sha256(data),
            size: data.len() as u64,
        }
    }
}

/// Trait for pluggable storage backends.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    /// Store data under `key`, replacing any previous object.
    async fn upload(&self, key: &str, data: &[u8]) -> Result<UploadResult>;

    /// Download data by storage key.
    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

/// Storage key of the evidence bundle for a receipt.
pub fn bundle_key(receipt_id: &uuid::Uuid) -> String {
    format!("{receipt_id}/evidence.bundle")
}

/// Reject keys that could escape the storage root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(EvidenceError::Validation(format!("invalid storage key: {key:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("abc/evidence.bundle").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_bundle_key() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            bundle_key(&id),
            "00000000-0000-0000-0000-000000000000/evidence.bundle"
        );
    }
}
