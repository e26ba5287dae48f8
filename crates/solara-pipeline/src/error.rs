use solara_buffer::BufferError;
use solara_identity::IdentityError;
use thiserror::Error;

/// Failure of the downstream stage that turns a batch into a reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher request failed: {0}")]
    Request(String),

    #[error("dispatcher timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("dispatcher returned an invalid reply: {0}")]
    InvalidReply(String),

    #[error("no dispatcher configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chunk delivery failed: {0}")]
    SendFailed(String),

    #[error("chunk delivery timed out after {ms}ms")]
    Timeout { ms: u64 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid inbound message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("delivery to {key} stopped after {sent} chunk(s): {source}")]
    Delivery {
        key: String,
        sent: usize,
        #[source]
        source: DeliveryError,
    },
}

impl PipelineError {
    /// Whether the sender should deliver the same message again later. Only
    /// an identity store outage qualifies: the message was not acted on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Identity(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
