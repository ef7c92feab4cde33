//! Delivery sinks
//!
//! The aggregator fans out through this interface; the conversational
//! bot, webhooks, whatever — all of that lives on the other side of it.
//! Sinks must tolerate the occasional duplicate send: the ledger
//! minimises duplicates under retry races but does not eliminate them.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Transport-level failure with a status code; 5xx and 429 retry.
    #[error("transport error {status}")]
    Transport { status: u16 },
    #[error("{0}")]
    Other(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transport { status } => *status == 429 || *status >= 500,
            SinkError::Other(_) => false,
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn send_text(&self, recipient: &str, body: &str) -> Result<(), SinkError>;

    /// Batched convenience; default implementation sends one by one.
    async fn send_batch(&self, recipient: &str, bodies: &[String]) -> Result<(), SinkError> {
        for body in bodies {
            self.send_text(recipient, body).await?;
        }
        Ok(())
    }
}

/// Sink that writes deliveries to the log. The default when no real
/// transport is wired up; also what `--dry-run`-style diagnostics use.
pub struct TracingSink;

#[async_trait]
impl Sink for TracingSink {
    async fn send_text(&self, recipient: &str, body: &str) -> Result<(), SinkError> {
        info!(recipient, "📨 {}", body);
        Ok(())
    }
}

/// In-memory sink capturing every send. Test and diagnostic helper.
#[derive(Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(String, String)>>,
    /// When set, the next `fail_next` sends error with this status.
    fail_next: Mutex<Option<(u16, u32)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Make the next `count` sends fail with `status`.
    pub fn fail_next(&self, status: u16, count: u32) {
        *self.fail_next.lock() = Some((status, count));
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn send_text(&self, recipient: &str, body: &str) -> Result<(), SinkError> {
        let mut fail = self.fail_next.lock();
        if let Some((status, remaining)) = *fail {
            if remaining > 0 {
                *fail = if remaining > 1 {
                    Some((status, remaining - 1))
                } else {
                    None
                };
                return Err(SinkError::Transport { status });
            }
        }
        drop(fail);

        self.sent
            .lock()
            .push((recipient.to_string(), body.to_string()));
        Ok(())
    }
}
