//! Control-plane storage
//!
//! The sync engine talks to storage through three narrow traits:
//!
//! - [`MailboxDirectory`]: which mailboxes exist and who owns them
//! - [`SyncStateStore`]: the per-mailbox cursor record
//! - [`MessageStore`]: idempotent message inserts
//!
//! [`MailboxAdmin`] adds the operations the control plane (CLI and HTTP API)
//! needs. [`Store`] bundles all four for callers that want a single handle.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{
    Mailbox, MailboxId, NewMailbox, NewMessage, SkippedMessage, StoredMessage, SyncState,
};
use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
///
/// `Conflict` is the idempotency signal for inserts and is never a failure
/// from the pipeline's point of view.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate record: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read access to configured mailboxes
#[async_trait]
pub trait MailboxDirectory: Send + Sync {
    async fn get_mailbox(&self, id: MailboxId) -> StoreResult<Option<Mailbox>>;

    /// Active mailboxes assigned to `shard`, ordered by id
    async fn list_active_mailboxes(&self, shard: &str) -> StoreResult<Vec<Mailbox>>;
}

/// Durable per-mailbox cursor records
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Load the sync state, creating a fresh one if none exists yet
    ///
    /// Idempotent: concurrent callers observe the same record.
    async fn get_or_create_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<SyncState>;

    /// Persist a sync state
    ///
    /// The stored cursor never decreases and a stored baseline timestamp is
    /// never cleared, whatever the caller passes.
    async fn update_sync_state(&self, state: &SyncState) -> StoreResult<()>;
}

/// Durable message records
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a message, returning its row id
    ///
    /// Returns [`StoreError::Conflict`] when (mailbox, uid) or
    /// (mailbox, message id) is already recorded.
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<i64>;

    /// Record a message the pipeline gave up parsing
    async fn record_skipped(&self, skipped: &SkippedMessage) -> StoreResult<()>;
}

/// Control-plane operations
#[async_trait]
pub trait MailboxAdmin: Send + Sync {
    async fn create_mailbox(&self, mailbox: NewMailbox) -> StoreResult<Mailbox>;

    /// Delete a mailbox with its sync state and messages
    async fn delete_mailbox(&self, id: MailboxId) -> StoreResult<()>;

    async fn set_active(&self, id: MailboxId, active: bool) -> StoreResult<Mailbox>;

    async fn assign_shard(&self, id: MailboxId, shard: &str) -> StoreResult<Mailbox>;

    async fn list_mailboxes(&self) -> StoreResult<Vec<Mailbox>>;

    async fn get_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<Option<SyncState>>;

    async fn list_sync_states(&self) -> StoreResult<Vec<SyncState>>;

    /// Most recent messages of a mailbox, newest uid first
    async fn list_messages(&self, mailbox_id: MailboxId, limit: usize)
        -> StoreResult<Vec<StoredMessage>>;

    async fn count_messages(&self, mailbox_id: MailboxId) -> StoreResult<u64>;

    async fn list_skipped(&self, mailbox_id: MailboxId) -> StoreResult<Vec<SkippedMessage>>;
}

/// Everything the engine and the control plane need from storage
pub trait Store: MailboxDirectory + SyncStateStore + MessageStore + MailboxAdmin {}

impl<T> Store for T where T: MailboxDirectory + SyncStateStore + MessageStore + MailboxAdmin {}
