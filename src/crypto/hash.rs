/// SHA-256 content hashing for evidence bundles.
///
/// SHA-256 is the digest anchored on-chain as a `bytes32`, so any third
/// party can recompute it with stock tooling. Hashes are rendered as
/// `0x` followed by 64 lowercase hex characters.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{EvidenceError, Result};

/// Hash arbitrary data with SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `0x`-prefixed hex SHA-256 of `data`, as written into bundle manifests.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(sha256(data)))
}

/// Fixed-size digest of an evidence bundle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest of a complete bundle.
    pub fn of(bundle_bytes: &[u8]) -> Self {
        Self(sha256(bundle_bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 lowercase hex characters, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse `0x`-prefixed or bare 64-character hex.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s.trim();
        let body = body
            .strip_prefix("0x")
            .or_else(|| body.strip_prefix("0X"))
            .unwrap_or(body);
        if body.len() != 64 {
            return Err(EvidenceError::Validation(
                "content hash must be 32 bytes (64 hex chars)".into(),
            ));
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(body, &mut out)
            .map_err(|e| EvidenceError::Validation(format!("content hash is not hex: {e}")))?;
        Ok(Self(out))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl FromStr for ContentHash {
    type Err = EvidenceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
