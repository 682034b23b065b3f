//! Error taxonomy shared by the Store, SessionFSM, Dispatcher, and SyncHub.
//!
//! Variants are semantic, not type-name — each maps onto exactly one HTTP
//! status code in the bin/server crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {message}")]
    Database { message: String, retryable: bool },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        // sqlx rolls back on drop, so any error reaching here already implies
        // a clean abort, which makes it retryable.
        CoreError::Database {
            message: err.to_string(),
            retryable: true,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
