/// Local filesystem storage backend.
///
/// Objects are written to a temporary sibling first and renamed into
/// place, so readers never observe a partially written bundle.
use std::path::PathBuf;

use async_trait::async_trait;

use super::{validate_key, StorageBackend, UploadResult};
use crate::error::{EvidenceError, Result};

pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<UploadResult> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(UploadResult::for_data(key, data))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EvidenceError::ArtifactNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
