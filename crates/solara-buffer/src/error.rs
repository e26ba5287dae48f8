use thiserror::Error;

/// Errors surfaced by [`ConsolidationBuffer`](crate::ConsolidationBuffer).
#[derive(Debug, Error)]
pub enum BufferError {
    /// The flush handler returned an error (or panicked). The buffer state for
    /// the key has already been cleaned up; retrying is the caller's call.
    #[error("flush handler failed for {key} ({batch_size} messages): {reason}")]
    Handler {
        key: String,
        batch_size: usize,
        reason: String,
    },

    /// The handler returned the batch with a [`Requeue`](crate::Requeue). It is
    /// pending again and will be retried on the key's next timer.
    #[error("flush for {key} requeued ({batch_size} messages): {reason}")]
    Requeued {
        key: String,
        batch_size: usize,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, BufferError>;
