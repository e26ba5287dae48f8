//! solara-pipeline: ties the inbound and outbound halves together.
//!
//! ```text
//! ingest → dedup → reset command? → consolidation buffer
//!            ↓ (flush)
//! identity → dispatcher → sanitize → chunk → paced delivery
//! ```
//!
//! The dispatcher (whatever produces the reply) and the chunk sink (whatever
//! delivers it) are traits so the gateway can plug in HTTP implementations and
//! tests can plug in recorders.

pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod types;

pub use delivery::{deliver_paced, ChunkSink};
pub use dispatch::Dispatcher;
pub use error::{DeliveryError, DispatchError, PipelineError, Result};
pub use pipeline::{Pipeline, PipelineConfig};
pub use types::{ConsolidatedBatch, DeliveryHints, DispatchReply, IngestOutcome, ProcessedBatch};
