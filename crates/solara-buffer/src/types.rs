use serde::{Deserialize, Serialize};

/// Read-only snapshot of one conversation's buffer, for operational tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatus {
    pub buffer_size: usize,
    pub has_active_timer: bool,
    pub is_flushing: bool,
}

/// What a forced flush actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "messages", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// The handler ran on this many messages and succeeded.
    Flushed(usize),
    /// Another flush for the key was already in flight; nothing was done.
    AlreadyFlushing,
    /// Nothing was pending for the key.
    Empty,
}
