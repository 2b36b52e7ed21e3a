//! Error types for the itinerary collaboration crate.

use std::io;
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can escape the public API.
///
/// Transport and storage failures are normally absorbed (logged and surfaced
/// as connection or degraded status); they appear here for the lower-level
/// APIs that report them directly.
#[derive(Error, Debug)]
pub enum CollabError {
    /// A mutation intent is missing required data or is malformed.
    #[error("Invalid block: {field} {reason}")]
    InvalidBlock { field: &'static str, reason: String },

    /// A comment has no content.
    #[error("Invalid comment: {0}")]
    InvalidComment(String),

    /// Durable storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The transport could not deliver or connect.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by update stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised while connecting to or talking with a relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The relay refused the auth token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The relay could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The relay or peer sent something unreadable.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,
}
