use async_trait::async_trait;
use dashmap::DashMap;

use super::{validate_key, StorageBackend, UploadResult};
use crate::error::{EvidenceError, Result};

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<UploadResult> {
        validate_key(key)?;
        self.objects.insert(key.to_string(), data.to_vec());
        Ok(UploadResult::for_data(key, data))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| EvidenceError::ArtifactNotFound(key.to_string()))
    }
}
