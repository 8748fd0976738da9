/// Evidence bundle packaging.
///
/// Format (all integers big-endian):
/// ```text
/// body    = "EVB1" | entry_count(u32) | entry*
/// entry   = name_len(u16) | name | data_len(u32) | data
/// trailer = "SIG1" | signer_pk(32B) | ed25519_sig(64B)
/// bundle  = body | trailer
/// ```
/// Entries are strictly ordered by name. The signature covers
/// `SHA-256(body)`; the content hash anchored on the ledger is the SHA-256
/// of the full bundle, trailer included. Ed25519 is deterministic, so the
/// same facts, documents and key always produce the same bytes.
pub mod documents;
pub mod manifest;

use std::collections::BTreeMap;

use crate::crypto::hash::{self, ContentHash};
use crate::crypto::sign::{self, ServiceKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::error::{EvidenceError, Result};
use crate::state::models::TransferFacts;

pub use documents::{Document, DocumentRenderer, StatementRenderer};
pub use manifest::{BundleManifest, MANIFEST_NAME};

pub const BUNDLE_MAGIC: &[u8; 4] = b"EVB1";
pub const TRAILER_MAGIC: &[u8; 4] = b"SIG1";
pub const TRAILER_LEN: usize = 4 + PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// Name of the canonical transfer facts entry.
pub const FACTS_NAME: &str = "transfer.json";

const MAX_NAME_LEN: usize = 128;
const MAX_ENTRIES: u32 = 1024;

/// A signed, serialized evidence bundle.
#[derive(Debug, Clone)]
pub struct EvidenceBundle {
    pub bytes: Vec<u8>,
    pub content_hash: ContentHash,
    pub signer: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

/// A bundle after parsing and integrity verification.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    pub content_hash: ContentHash,
    pub facts: TransferFacts,
    pub manifest: BundleManifest,
    pub entries: BTreeMap<String, Vec<u8>>,
    pub signer: [u8; PUBLIC_KEY_LEN],
}

/// Builds signed bundles from transfer facts and rendered documents.
pub struct Packager {
    key: ServiceKey,
    renderer: Box<dyn DocumentRenderer>,
}

impl Packager {
    pub fn new(key: ServiceKey, renderer: Box<dyn DocumentRenderer>) -> Self {
        Self { key, renderer }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.key.public_key()
    }

    /// Render documents for `facts` and package them.
    pub fn package(&self, facts: &TransferFacts) -> Result<EvidenceBundle> {
        let documents = self.renderer.render(facts)?;
        build(facts, &documents, &self.key)
    }
}

/// Assemble and sign a bundle.
pub fn build(
    facts: &TransferFacts,
    documents: &[Document],
    key: &ServiceKey,
) -> Result<EvidenceBundle> {
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    let facts_json = serde_json::to_vec_pretty(facts)
        .map_err(|e| EvidenceError::BundleBuild(format!("transfer facts: {e}")))?;
    entries.insert(FACTS_NAME.to_string(), facts_json);

    for doc in documents {
        check_name(&doc.name).map_err(EvidenceError::BundleBuild)?;
        if doc.name == FACTS_NAME || doc.name == MANIFEST_NAME {
            return Err(EvidenceError::BundleBuild(format!(
                "document name {} is reserved",
                doc.name
            )));
        }
        if entries.insert(doc.name.clone(), doc.content.clone()).is_some() {
            return Err(EvidenceError::BundleBuild(format!(
                "duplicate document name {}",
                doc.name
            )));
        }
    }

    let manifest = BundleManifest::from_entries(
        &facts.reference,
        entries.iter().map(|(n, d)| (n.as_str(), d.as_slice())),
    );
    let manifest_json = manifest
        .to_bytes()
        .map_err(|e| EvidenceError::BundleBuild(format!("manifest: {e}")))?;
    entries.insert(MANIFEST_NAME.to_string(), manifest_json);

    let body = encode_body(&entries)?;
    let signer = key.public_key();
    let signature = key.sign(&hash::sha256(&body));

    let mut bytes = body;
    bytes.reserve(TRAILER_LEN);
    bytes.extend_from_slice(TRAILER_MAGIC);
    bytes.extend_from_slice(&signer);
    bytes.extend_from_slice(&signature);

    Ok(EvidenceBundle {
        content_hash: ContentHash::of(&bytes),
        bytes,
        signer,
        signature,
    })
}

/// Parse a bundle and check its signature, manifest and canonical form.
///
/// When `trusted_signer` is given the embedded signer must equal it.
/// Every failure is reported as [`EvidenceError::Integrity`].
pub fn verify_integrity(
    bytes: &[u8],
    trusted_signer: Option<&[u8; PUBLIC_KEY_LEN]>,
) -> Result<VerifiedBundle> {
    if bytes.len() < BUNDLE_MAGIC.len() + 4 + TRAILER_LEN {
        return Err(EvidenceError::Integrity(format!(
            "bundle too short: {} bytes",
            bytes.len()
        )));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    if &trailer[..4] != TRAILER_MAGIC {
        return Err(EvidenceError::Integrity("missing signature trailer".into()));
    }
    let mut signer = [0u8; PUBLIC_KEY_LEN];
    signer.copy_from_slice(&trailer[4..4 + PUBLIC_KEY_LEN]);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&trailer[4 + PUBLIC_KEY_LEN..]);

    if let Some(trusted) = trusted_signer {
        if trusted != &signer {
            return Err(EvidenceError::Integrity(format!(
                "bundle signed by untrusted key {}",
                hex::encode(signer)
            )));
        }
    }
    sign::verify(&signer, &hash::sha256(body), &signature)?;

    let entries = decode_body(body)?;

    let manifest_bytes = entries
        .get(MANIFEST_NAME)
        .ok_or_else(|| EvidenceError::Integrity("bundle has no manifest".into()))?;
    let manifest = BundleManifest::from_bytes(manifest_bytes)
        .map_err(|e| EvidenceError::Integrity(format!("unreadable manifest: {e}")))?;
    manifest.verify_entries(
        entries
            .iter()
            .filter(|(name, _)| name.as_str() != MANIFEST_NAME)
            .map(|(n, d)| (n.as_str(), d.as_slice())),
    )?;

    let facts_bytes = entries
        .get(FACTS_NAME)
        .ok_or_else(|| EvidenceError::Integrity("bundle has no transfer facts".into()))?;
    let facts: TransferFacts = serde_json::from_slice(facts_bytes)
        .map_err(|e| EvidenceError::Integrity(format!("unreadable transfer facts: {e}")))?;

    Ok(VerifiedBundle {
        content_hash: ContentHash::of(bytes),
        facts,
        manifest,
        entries,
        signer,
    })
}

fn check_name(name: &str) -> std::result::Result<(), String> {
    let ok_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if name.is_empty() || name.len() > MAX_NAME_LEN || !ok_chars || name.starts_with('.') {
        return Err(format!("invalid entry name {name:?}"));
    }
    Ok(())
}

fn encode_body(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let count = u32::try_from(entries.len())
        .map_err(|_| EvidenceError::BundleBuild("too many entries".into()))?;
    let mut out = Vec::with_capacity(
        8 + entries
            .iter()
            .map(|(n, d)| 6 + n.len() + d.len())
            .sum::<usize>(),
    );
    out.extend_from_slice(BUNDLE_MAGIC);
    out.extend_from_slice(&count.to_be_bytes());
    for (name, data) in entries {
        let name_len = u16::try_from(name.len())
            .map_err(|_| EvidenceError::BundleBuild(format!("entry name too long: {name}")))?;
        let data_len = u32::try_from(data.len())
            .map_err(|_| EvidenceError::BundleBuild(format!("entry too large: {name}")))?;
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&data_len.to_be_bytes());
        out.extend_from_slice(data);
    }
    Ok(out)
}

/// Cursor over the body with bounds-checked reads.
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| EvidenceError::Integrity("bundle truncated".into()))?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn decode_body(body: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut r = Reader { data: body, offset: 0 };
    if r.take(4)? != BUNDLE_MAGIC {
        return Err(EvidenceError::Integrity("not an evidence bundle".into()));
    }
    let count = r.u32()?;
    if count > MAX_ENTRIES {
        return Err(EvidenceError::Integrity(format!("too many entries: {count}")));
    }

    let mut entries = BTreeMap::new();
    let mut previous: Option<String> = None;
    for _ in 0..count {
        let name_len = r.u16()? as usize;
        let name = std::str::from_utf8(r.take(name_len)?)
            .map_err(|_| EvidenceError::Integrity("entry name is not utf-8".into()))?
            .to_string();
        check_name(&name).map_err(EvidenceError::Integrity)?;
        if previous.as_deref().is_some_and(|p| p >= name.as_str()) {
            return Err(EvidenceError::Integrity("entries are not in canonical order".into()));
        }
        let data_len = r.u32()? as usize;
        let data = r.take(data_len)?.to_vec();
        previous = Some(name.clone());
        entries.insert(name, data);
    }

    if r.offset != body.len() {
        return Err(EvidenceError::Integrity("trailing bytes after entries".into()));
    }
    Ok(entries)
}
