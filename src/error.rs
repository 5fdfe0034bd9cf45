//! Error types for mailsync
//!
//! Defines the crate-wide error enum used by configuration, storage setup,
//! the CLI and the HTTP surface. The sync engine has its own tagged error
//! kinds in [`crate::sync::SyncError`]; the leaf collaborators each carry a
//! narrow error type of their own.
//! Uses thiserror for ergonomic error handling.

use crate::notify::DeliveryError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for mailsync operations
pub type Result<T> = std::result::Result<T, MailsyncError>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum MailsyncError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store errors (mailboxes, sync state, messages)
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Remote mailbox protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Notification(#[from] DeliveryError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Mailbox lookup failures
    #[error("Mailbox not found: {0}")]
    MailboxNotFound(i64),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context), printed with their full chain
    #[error("{0:#}")]
    Anyhow(#[from] anyhow::Error),
}
