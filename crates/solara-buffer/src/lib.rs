//! solara-buffer: inbound-side coordination for the Solara pipeline.
//!
//! - [`IdempotencyCache`] drops webhook redeliveries before they reach the
//!   buffer.
//! - [`ConsolidationBuffer`] groups a burst of messages from one conversation
//!   into a single batch using a per-key debounce timer, then hands the batch
//!   to the deployment's [`FlushHandler`].

pub mod consolidation;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod types;

pub use consolidation::ConsolidationBuffer;
pub use error::{BufferError, Result};
pub use handler::{FlushHandler, HandlerError, Requeue};
pub use idempotency::IdempotencyCache;
pub use types::{BufferStatus, FlushOutcome};
