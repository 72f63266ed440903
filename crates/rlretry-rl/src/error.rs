//! Error types for the learning core

use thiserror::Error;

/// Main error type for rlretry-rl
#[derive(Error, Debug)]
pub enum RlError {
    #[error("Invalid delay ladder: {0}")]
    InvalidLadder(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ladder mismatch: expected {expected} actions, found {found}")]
    LadderMismatch { expected: usize, found: usize },

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for learning operations
pub type Result<T> = std::result::Result<T, RlError>;
