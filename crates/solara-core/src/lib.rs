//! solara-core: shared types, configuration and errors for the Solara
//! message pipeline.

pub mod config;
pub mod error;
pub mod types;

pub use config::SolaraConfig;
pub use error::{Result, SolaraError};
pub use types::{InboundMessage, MessageKind};
