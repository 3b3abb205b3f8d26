//! Error types for logship-core

use thiserror::Error;

/// Main error type for the logship-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The group is at capacity and every stored log belongs to an in-flight batch
    #[error("storage full for group {group_id}")]
    StorageFull { group_id: String },

    /// The store failed validation and could not be repaired
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// A channel unit is already registered for the group
    #[error("group already registered: {0}")]
    DuplicateGroup(String),

    /// The channel unit task has stopped
    #[error("channel closed for group {0}")]
    ChannelClosed(String),

    /// HTTP transport setup error
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias for logship-core
pub type Result<T> = std::result::Result<T, Error>;
