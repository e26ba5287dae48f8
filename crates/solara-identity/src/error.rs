use thiserror::Error;

/// Failures reported by an [`IdentityStore`](crate::IdentityStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer created the record for this key first. Expected under
    /// concurrency; the resolver re-reads instead of surfacing it.
    #[error("conversation already exists: {key}")]
    Conflict { key: String },

    /// Transient condition (busy/locked database, lost connection).
    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Errors returned by [`IdentityResolver`](crate::IdentityResolver).
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The store kept failing after every retry. Callers must treat this as a
    /// hard error: no identity means the batch cannot be processed.
    #[error("identity store unavailable for {key} after {attempts} attempts: {reason}")]
    Unavailable {
        key: String,
        attempts: u32,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, IdentityError>;
