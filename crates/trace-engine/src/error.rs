//! Error types for trace engine operations
//!
//! Background passes never surface errors to an interactive caller; anything
//! that fails here is logged at the pass level and retried on the next timer
//! tick, so the taxonomy stays deliberately small.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceEngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TraceEngineError>;
