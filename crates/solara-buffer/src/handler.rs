use async_trait::async_trait;
use solara_core::types::InboundMessage;
use thiserror::Error;

/// Boxed error returned by a flush handler; only its message is kept, unless
/// it is a [`Requeue`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler error that hands the batch back to the buffer.
///
/// The batch goes back in front of anything that arrived meanwhile and is
/// retried when the key's debounce timer next fires. Use it for failures that
/// leave the batch unprocessed and are expected to clear, such as a storage
/// outage.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct Requeue {
    pub batch: Vec<InboundMessage>,
    pub reason: String,
}

impl Requeue {
    pub fn new(batch: Vec<InboundMessage>, reason: impl Into<String>) -> Self {
        Self {
            batch,
            reason: reason.into(),
        }
    }
}

/// Downstream consumer of consolidated batches.
///
/// One handler is supplied when the buffer is built and shared by every key.
/// It runs outside all buffer locks, so it may take as long as it needs;
/// new messages for the same key meanwhile start the next batch.
#[async_trait]
pub trait FlushHandler: Send + Sync + 'static {
    /// Process `batch` (arrival order preserved) for conversation `key`.
    async fn on_flush(&self, key: &str, batch: Vec<InboundMessage>) -> Result<(), HandlerError>;
}
