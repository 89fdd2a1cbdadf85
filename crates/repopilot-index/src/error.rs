//! Error types for repopilot-index.

use std::num::TryFromIntError;

use crate::status::IndexStatus;
use crate::store::VectorStoreError;

/// Errors that can occur during indexing and index maintenance.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// IO error reading the repository root.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` metadata store error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Vector store unavailable or rejected an operation.
    #[error("vector store error: {0}")]
    Store(#[from] VectorStoreError),

    /// Embedding kept failing after retry with backoff.
    #[error("embedding failed after {attempts} attempt(s): {source}")]
    Embedding {
        attempts: u32,
        #[source]
        source: repopilot_llm::LlmError,
    },

    /// Tree-sitter could not produce a usable tree. Never escapes the chunker.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Another indexing run for this repository is in flight.
    #[error("repository {0} is already being indexed")]
    Busy(String),

    #[error("invalid status transition for {repository}: {from} -> {to}")]
    InvalidTransition {
        repository: String,
        from: IndexStatus,
        to: IndexStatus,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Integer conversion error.
    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
