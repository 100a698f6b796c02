//! Crate-wide error taxonomy.
//!
//! A small, closed set of variants rather than one type per failure mode:
//! callers match on kind and map it to the host's user-visible status codes
//! (accepted/bad-request/conflict/too-large/not-found/internal) at the
//! `engine` boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate document hash: {0}")]
    DuplicateHash(String),

    #[error("invalid label '{label}': {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("graph error: {0}")]
    Graph(#[from] neo4rs::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient errors are the ones the Orchestrator's retry loop should
    /// retry with backoff; everything else is either a permanent failure
    /// routed to the dead-letter handler or a programmer/contract error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransientProvider(_) | EngineError::Database(_) | EngineError::Graph(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
