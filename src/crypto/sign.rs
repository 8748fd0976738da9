/// Ed25519 integrity signatures for evidence bundles.
///
/// The service signs the SHA-256 digest of a bundle body. Ed25519 is
/// deterministic, so the same key and body always produce the same
/// signature, which keeps the signed bundle byte-for-byte reproducible.
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{EvidenceError, Result};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Signing identity of this service.
pub struct ServiceKey {
    signing_key: SigningKey,
}

impl ServiceKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parse a 32-byte hex seed (optionally `0x`-prefixed). A 64-byte
    /// expanded key is accepted and truncated to its seed half.
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let trimmed = seed_hex.trim().to_lowercase();
        let body = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
        let bytes = Zeroizing::new(
            hex::decode(body)
                .map_err(|e| EvidenceError::Config(format!("signing key is not hex: {e}")))?,
        );
        if bytes.len() != 32 && bytes.len() != 64 {
            return Err(EvidenceError::Config(format!(
                "signing key must be a 32-byte seed or 64-byte expanded key, got {} bytes",
                bytes.len()
            )));
        }
        let mut seed = Zeroizing::new([0u8; 32]);
        seed.copy_from_slice(&bytes[..32]);
        Ok(Self::from_seed(&seed))
    }

    /// Hex seed for persisting a generated key.
    pub fn seed_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature made by `public_key` over `message`.
pub fn verify(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<()> {
    let vk = VerifyingKey::from_bytes(public_key)
        .map_err(|_| EvidenceError::Integrity("embedded signer key is invalid".into()))?;
    let sig = Signature::from_bytes(signature);
    vk.verify(message, &sig)
        .map_err(|_| EvidenceError::Integrity("bundle signature does not verify".into()))
}

/// Parse a hex-encoded public key (e.g. a configured trusted signer).
pub fn parse_public_key(key_hex: &str) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let trimmed = key_hex.trim().to_lowercase();
    let body = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    hex::decode_to_slice(body, &mut out)
        .map_err(|e| EvidenceError::Config(format!("invalid public key hex: {e}")))?;
    Ok(out)
}
