/// Documents carried inside an evidence bundle.
///
/// Producing the compliance document itself (and validating it against
/// its schema) happens outside this crate; the pipeline only needs a
/// stateless transform from transfer facts to named byte blobs. The
/// shipped renderer writes a plain-text payment statement.
use crate::error::{EvidenceError, Result};
use crate::state::models::TransferFacts;

/// A named document to be placed in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub name: String,
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Stateless transform from transfer facts to bundle documents.
///
/// Implementations must be deterministic: no clocks, no randomness.
pub trait DocumentRenderer: Send + Sync {
    fn render(&self, facts: &TransferFacts) -> Result<Vec<Document>>;
}

/// Renders `statement.txt`, a human-readable payment statement.
#[derive(Debug, Default, Clone)]
pub struct StatementRenderer;

impl DocumentRenderer for StatementRenderer {
    fn render(&self, facts: &TransferFacts) -> Result<Vec<Document>> {
        if facts.amount.is_empty() {
            return Err(EvidenceError::BundleBuild("statement needs an amount".into()));
        }
        let body = format!(
            "PAYMENT STATEMENT\n\
             reference: {}\n\
             chain: {}\n\
             source_tx_hash: {}\n\
             amount: {} {}\n\
             debtor: {}\n\
             creditor: {}\n",
            facts.reference,
            facts.chain,
            facts.source_tx_hash,
            facts.amount,
            facts.currency,
            facts.sender,
            facts.receiver,
        );
        Ok(vec![Document::new("statement.txt", body)])
    }
}
