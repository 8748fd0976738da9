/// Bundle manifest: the table of contents of an evidence bundle.
///
/// Lists every other entry with its SHA-256 and size, sorted by name.
/// Carries no timestamps or random identifiers so that it is a pure
/// function of the bundle contents.
use serde::{Deserialize, Serialize};

use crate::crypto::hash;
use crate::error::{EvidenceError, Result};

/// Current manifest format version.
pub const MANIFEST_VERSION: u8 = 1;

/// Name of the manifest entry inside the bundle.
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u8,
    /// External reference of the transfer this bundle evidences.
    pub reference: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// `0x`-prefixed SHA-256 of the entry bytes.
    pub sha256: String,
    pub size: u64,
}

impl BundleManifest {
    /// Build a manifest over `(name, bytes)` entries. Entries are sorted by
    /// name regardless of input order.
    pub fn from_entries<'a>(
        reference: &str,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Self {
        let mut files: Vec<ManifestEntry> = entries
            .into_iter()
            .map(|(name, data)| ManifestEntry {
                name: name.to_string(),
                sha256: hash::sha256_hex(data),
                size: data.len() as u64,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            version: MANIFEST_VERSION,
            reference: reference.to_string(),
            files,
        }
    }

    /// Serialize the manifest to pretty-printed JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| EvidenceError::Serialization(e.to_string()))
    }

    /// Deserialize a manifest from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| EvidenceError::Serialization(e.to_string()))
    }

    /// Check that `entries` are exactly the files listed, with matching
    /// hashes and sizes.
    pub fn verify_entries<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(EvidenceError::Integrity(format!(
                "unsupported manifest version {}",
                self.version
            )));
        }

        let mut seen = 0usize;
        for (name, data) in entries {
            let listed = self
                .files
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| EvidenceError::Integrity(format!("entry not in manifest: {name}")))?;
            if listed.size != data.len() as u64 || listed.sha256 != hash::sha256_hex(data) {
                return Err(EvidenceError::Integrity(format!("file_hash_mismatch:{name}")));
            }
            seen += 1;
        }

        if seen != self.files.len() {
            return Err(EvidenceError::Integrity(
                "manifest lists entries missing from the bundle".into(),
            ));
        }
        Ok(())
    }
}
