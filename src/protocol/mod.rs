//! Remote mailbox protocol capability
//!
//! The engine only needs a handful of operations against a remote folder,
//! expressed by [`MailClient`] (connect and authenticate) and
//! [`MailSession`] (open, search, fetch, logout). [`ImapClient`] is the
//! production implementation; tests substitute scripted fakes.

mod imap;

pub use self::imap::ImapClient;

use crate::model::Mailbox;
use crate::sync::backoff::{RetryDecision, RetryableError};
use async_trait::async_trait;
use thiserror::Error;

/// Protocol errors, tagged by what the caller should do about them
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Credentials rejected; permanent until the mailbox changes
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or TLS trouble; the session is gone
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server refused a command on a live session
    #[error("command failed: {0}")]
    Command(String),
}

impl ProtocolError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProtocolError::Auth(_))
    }

    /// Whether the session that produced this error is unusable
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, ProtocolError::Connection(_))
    }
}

impl RetryableError for ProtocolError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            ProtocolError::Auth(_) => RetryDecision::NoRetry,
            ProtocolError::Connection(_) | ProtocolError::Command(_) => RetryDecision::Retry,
        }
    }
}

impl From<imap_session::Error> for ProtocolError {
    fn from(err: imap_session::Error) -> Self {
        match err {
            imap_session::Error::AuthRejected(msg) => ProtocolError::Auth(msg),
            e @ (imap_session::Error::Transport(_) | imap_session::Error::Tls(_)) => {
                ProtocolError::Connection(e.to_string())
            }
            e => ProtocolError::Command(e.to_string()),
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Opens authenticated sessions against a mailbox's server
#[async_trait]
pub trait MailClient: Send + Sync {
    async fn connect(&self, mailbox: &Mailbox) -> ProtocolResult<Box<dyn MailSession>>;
}

/// An authenticated session
#[async_trait]
pub trait MailSession: Send {
    /// Open a folder, returning the next identifier the server will assign
    async fn open(&mut self, folder: &str) -> ProtocolResult<u32>;

    /// Identifiers strictly greater than `cursor`
    async fn search_after(&mut self, cursor: u32) -> ProtocolResult<Vec<u32>>;

    /// Raw bytes of one message
    async fn fetch(&mut self, uid: u32) -> ProtocolResult<Vec<u8>>;

    async fn logout(&mut self) -> ProtocolResult<()>;
}
