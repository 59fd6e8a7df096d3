//! Error types shared across Burstcast crates.

use thiserror::Error;

/// Result alias used throughout Burstcast.
pub type Result<T> = std::result::Result<T, BurstError>;

/// Every failure the dispatch engine can surface.
///
/// Only errors that prevent any progress for a target reach the caller of
/// `batch_start`/`stop`; per-endpoint and per-channel failures are logged and
/// contained by the engine.
#[derive(Debug, Error)]
pub enum BurstError {
    /// Endpoint or sub-target creation failed.
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// A single delivery attempt failed.
    #[error("Send error: {0}")]
    Send(String),

    /// The bulk endpoint listing for a group could not be fetched.
    #[error("Cache fetch error: {0}")]
    CacheFetch(String),

    /// Invalid or missing target configuration.
    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Target already running: {0}")]
    AlreadyRunning(String),

    /// The rate-limit circuit breaker is engaged; new work is refused.
    #[error("Circuit breaker engaged, refusing new work")]
    CircuitOpen,

    /// The owning session was stopped while the operation waited.
    #[error("Cancelled")]
    Cancelled,

    /// The vote panel could not be posted.
    #[error("Vote panel error: {0}")]
    VotePost(String),

    #[error("Store error: {0}")]
    Store(String),

    /// None of the requested targets could be prepared.
    #[error("No targets could be prepared")]
    NoTargetsPrepared,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for BurstError {
    fn from(e: rusqlite::Error) -> Self {
        BurstError::Store(e.to_string())
    }
}
