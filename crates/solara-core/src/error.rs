use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolaraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid inbound event: {0}")]
    InvalidEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SolaraError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            SolaraError::Config(_) => "CONFIG_ERROR",
            SolaraError::AuthFailed(_) => "AUTH_FAILED",
            SolaraError::InvalidEvent(_) => "INVALID_EVENT",
            SolaraError::Serialization(_) => "SERIALIZATION_ERROR",
            SolaraError::Io(_) => "IO_ERROR",
            SolaraError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SolaraError>;
