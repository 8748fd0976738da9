/// Sequence-number allocation for the submitting account.
///
/// Holding a [`NonceLease`] serializes "allocate -> build -> submit" for the
/// account; confirmation waits happen after the lease is dropped. The local
/// counter never goes below the node's pending count, and is forgotten
/// whenever the node rejects a nonce so the next lease re-reads the chain.
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct NonceAllocator {
    next: Mutex<Option<u64>>,
}

/// Exclusive right to allocate and submit with the account's next nonce.
pub struct NonceLease<'a> {
    next: MutexGuard<'a, Option<u64>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of the counter.
    pub async fn lease(&self) -> NonceLease<'_> {
        NonceLease {
            next: self.next.lock().await,
        }
    }
}

impl NonceLease<'_> {
    /// Nonce to use given the node's pending transaction count.
    pub fn reserve(&self, chain_pending: u64) -> u64 {
        match *self.next {
            Some(local) => local.max(chain_pending),
            None => chain_pending,
        }
    }

    /// Record that `nonce` was accepted by the node.
    pub fn commit(&mut self, nonce: u64) {
        *self.next = Some(nonce + 1);
    }

    /// Drop the local counter after the node rejected our nonce.
    pub fn invalidate(&mut self) {
        *self.next = None;
    }
}
