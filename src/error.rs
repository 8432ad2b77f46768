//! Error types for proxymod-dispatcher.

use thiserror::Error;

use crate::model::State;

#[derive(Debug, Error)]
pub enum Error {
    /// The event descriptor was rejected before any task was created.
    #[error("invalid event descriptor: {0}")]
    Validation(String),

    #[error("receive task not found: {0}")]
    NotFound(String),

    /// Transient store connectivity failure, after retries.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transient broker failure, after retries.
    #[error("dispatch queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A conditional transition lost the race; the row is no longer in `expected`.
    #[error("stale state for task {id}: expected {expected}")]
    StaleState { id: String, expected: State },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("processing failed: {0}")]
    Processing(#[from] crate::processor::ProcessingError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::QueueUnavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::StoreUnavailable(e.to_string()),
            other => Error::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
