//! solara-egress: outbound reply shaping.
//!
//! Every reply passes through [`sanitize`] (strip internal artefacts that
//! leaked into model output) and then [`chunk`] (split into short, paced
//! messages that read like a person typing). Neither step can fail.

pub mod chunk;
pub mod sanitize;

pub use chunk::{chunk, chunk_with_rng, ChunkedReply, OutboundChunk};
pub use sanitize::{analyze, sanitize, LeakCategory, LeakageReport, ResponseSanitizer};
