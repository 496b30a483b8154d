//! Error types for the conduit pipeline.

use thiserror::Error;

/// Result type alias using conduit's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pipeline operations.
///
/// Variants fall into two classes that drive retry behavior in the workers:
/// transient failures (see [`Error::is_transient`]) are retried with backoff,
/// everything else is permanent and fails the active step immediately.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Queue publish/consume/ack failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// External record source returned an error or was unreachable
    #[error("Source error: {0}")]
    Source(String),

    /// External record source throttled the request
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Authentication/authorization against an external source failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted in the job's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is expected to clear on its own (network blips,
    /// upstream throttling, exhausted connection pools).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Source(_) | Error::RateLimited(_) | Error::Timeout(_) | Error::Queue(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Whether retrying cannot help (bad credentials, malformed configuration).
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
