//! Error types for Runnel.

use crate::dag::DagError;
use crate::model::FailedReason;
use crate::status::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] DagError),

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    // State machine errors
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Lock is held by someone else: {0}")]
    LockContention(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Execution errors
    #[error("Execution cancelled: {0}")]
    Cancelled(FailedReason),

    #[error("Remote call failed: {0}")]
    Transport(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Unsupported os: {0}")]
    UnsupportedOs(String),

    // Log errors
    #[error("Log already closed")]
    LogAlreadyClosed,

    #[error("Failed to flush log: {0}")]
    LogFlush(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Worth retrying later with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockContention(_) | Error::Transport(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
