/// Outbound HTTP callbacks carrying receipt snapshots.
use std::time::Duration;

use reqwest::Client;

use crate::error::{EvidenceError, Result};
use crate::state::models::ReceiptSnapshot;

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CALLBACK_ATTEMPTS: u32 = 3;

pub struct CallbackClient {
    client: Client,
    max_attempts: u32,
    backoff: Duration,
}

impl CallbackClient {
    pub fn new(timeout: Duration, max_attempts: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvidenceError::Config(format!("failed to build callback client: {e}")))?;
        Ok(Self {
            client,
            max_attempts: max_attempts.max(1),
            backoff: Duration::from_millis(500),
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST `snapshot` to `url`, retrying on transport errors and non-2xx
    /// responses. Returns the last failure once attempts are exhausted.
    pub async fn deliver(&self, url: &str, snapshot: &ReceiptSnapshot) -> std::result::Result<(), String> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.client.post(url).json(snapshot).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(receipt_id = %snapshot.id, url, attempt, "callback delivered");
                    return Ok(());
                }
                Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            tracing::debug!(receipt_id = %snapshot.id, url, attempt, error = %last_error, "callback attempt failed");
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }
        Err(last_error)
    }
}
