/// Fan-out of receipt transitions to live subscribers and callbacks.
///
/// Each watched receipt has a `watch` channel holding its latest snapshot:
/// slow subscribers skip intermediate states instead of queueing them, and
/// a new subscriber starts from the current state. Snapshots only ever move
/// forward by revision. Callbacks run on detached tasks so publishing never
/// waits on the network.
pub mod callback;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

use crate::state::models::ReceiptSnapshot;
pub use callback::CallbackClient;

pub struct Notifier {
    channels: DashMap<Uuid, watch::Sender<ReceiptSnapshot>>,
    callbacks: Option<Arc<CallbackClient>>,
    callback_on_create: bool,
}

impl Notifier {
    pub fn new(callbacks: Option<CallbackClient>, callback_on_create: bool) -> Self {
        Self {
            channels: DashMap::new(),
            callbacks: callbacks.map(Arc::new),
            callback_on_create,
        }
    }

    /// Notifier with no callback delivery.
    pub fn local() -> Self {
        Self::new(None, false)
    }

    /// Deliver a transition. Never blocks on subscribers or callbacks.
    pub fn publish(&self, snapshot: ReceiptSnapshot) {
        self.offer(&snapshot);
        if snapshot.status.is_terminal() {
            self.channels
                .remove_if(&snapshot.id, |_, tx| tx.receiver_count() == 0);
        }

        let wants_callback = snapshot.status.is_terminal()
            || (self.callback_on_create && snapshot.revision == 0);
        if !wants_callback {
            return;
        }
        if let (Some(client), Some(url)) = (&self.callbacks, snapshot.callback_url.clone()) {
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.deliver(&url, &snapshot).await {
                    tracing::warn!(receipt_id = %snapshot.id, url = %url, error = %e, "callback delivery failed");
                }
            });
        }
    }

    /// Update a live channel if `snapshot` is newer than what it holds.
    pub fn offer(&self, snapshot: &ReceiptSnapshot) {
        if let Some(tx) = self.channels.get(&snapshot.id) {
            tx.send_if_modified(|current| advance(current, snapshot));
        }
    }

    /// Subscribe to a receipt, seeding the channel with `current`.
    ///
    /// The caller should re-read the receipt afterwards and [`offer`] it,
    /// covering transitions published before the channel existed.
    ///
    /// [`offer`]: Notifier::offer
    pub fn subscribe(&self, current: ReceiptSnapshot) -> watch::Receiver<ReceiptSnapshot> {
        let entry = self
            .channels
            .entry(current.id)
            .or_insert_with(|| watch::channel(current.clone()).0);
        entry.send_if_modified(|held| advance(held, &current));
        entry.subscribe()
    }

    /// Drop the channel for `id` once nobody listens.
    pub fn release(&self, id: Uuid) {
        self.channels.remove_if(&id, |_, tx| tx.receiver_count() == 0);
    }

    #[cfg(test)]
    pub(crate) fn watched(&self) -> usize {
        self.channels.len()
    }
}

fn advance(held: &mut ReceiptSnapshot, next: &ReceiptSnapshot) -> bool {
    if next.revision > held.revision {
        *held = next.clone();
        true
    } else {
        false
    }
}
