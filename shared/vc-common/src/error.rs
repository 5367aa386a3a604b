//! Common Error Types

use thiserror::Error;

/// Errors produced while handling shared wire types.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown moderation action name.
    #[error("Unknown moderation action: {0}")]
    UnknownAction(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
