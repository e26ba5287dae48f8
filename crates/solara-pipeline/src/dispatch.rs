use async_trait::async_trait;

use crate::error::DispatchError;
use crate::types::{ConsolidatedBatch, DispatchReply};

/// Produces the reply for one consolidated batch (an LLM agent, a rules
/// engine, a remote service).
///
/// A failure here never reaches the user as silence: the pipeline logs it and
/// sends the configured fallback reply instead.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, batch: &ConsolidatedBatch) -> Result<DispatchReply, DispatchError>;
}
