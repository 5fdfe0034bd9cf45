//! Mailbox synchronization engine
//!
//! - **MailboxManager**: one mailbox's connection, cursor and poll cycle
//! - **ManagerHandle**: the task running a manager and its command channel
//! - **Reconciler**: keeps live managers matched to the shard's mailboxes
//! - **PollScheduler**: dispatches due managers to poll
//! - **SyncDaemon**: the event loop tying the above together

pub mod backoff;
mod daemon;
mod handle;
mod manager;
pub mod metrics;
mod pipeline;
mod reconciler;
mod scheduler;
mod state;

pub use backoff::{Backoff, BackoffConfig};
pub use daemon::{DaemonCommand, DaemonConfig, DaemonStats, SyncDaemon};
pub use handle::ManagerHandle;
pub use manager::MailboxManager;
pub use pipeline::{PoisonTracker, PollReport};
pub use reconciler::{ManagedMailboxes, ManagerStatus, ReconcileReport, Reconciler};
pub use scheduler::PollScheduler;
pub use state::ManagerState;

use crate::model::MailboxId;
use crate::notify::NotificationSink;
use crate::parser::MessageParser;
use crate::protocol::{MailClient, ProtocolError};
use crate::store::Store;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Tagged failure kinds of the engine
///
/// Duplicate inserts are not errors; they show up as
/// [`PollReport::duplicates`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Credentials rejected; the manager terminates
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Connect or folder open failed; the manager backs off
    #[error("connection failed: {0}")]
    TransientConnection(String),

    /// Search or fetch failed; the cycle ends early
    #[error("search or fetch failed: {0}")]
    SearchOrFetch(String),

    /// A message could not be parsed; the cycle stops at it
    #[error("parse failed for uid {uid}: {reason}")]
    Parse { uid: u32, reason: String },

    /// A store write failed; the cycle stops at the failing message
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl SyncError {
    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Authentication(_) => "authentication",
            SyncError::TransientConnection(_) => "transient_connection",
            SyncError::SearchOrFetch(_) => "search_or_fetch",
            SyncError::Parse { .. } => "parse",
            SyncError::Persistence(_) => "persistence",
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Auth(msg) => SyncError::Authentication(msg),
            other => SyncError::TransientConnection(other.to_string()),
        }
    }
}

/// Events broadcast by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A manager task started
    ManagerStarted { mailbox_id: MailboxId },

    /// A manager connected and opened its folder
    Connected { mailbox_id: MailboxId },

    /// First connect skipped existing history
    Baselined { mailbox_id: MailboxId, cursor: u32 },

    /// A poll cycle finished
    PollCompleted {
        mailbox_id: MailboxId,
        report: PollReport,
    },

    /// A connection attempt failed and a retry is scheduled
    Backoff {
        mailbox_id: MailboxId,
        attempt: u32,
        delay_ms: u64,
    },

    /// Credentials were rejected; the manager stopped for good
    Terminated { mailbox_id: MailboxId, reason: String },

    /// A manager task exited
    ManagerStopped { mailbox_id: MailboxId },

    /// A reconcile pass finished
    ReconcileCompleted(ReconcileReport),
}

/// Collaborators shared by every manager
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn Store>,
    pub client: Arc<dyn MailClient>,
    pub parser: Arc<dyn MessageParser>,
    /// `None` disables notifications
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub events: broadcast::Sender<SyncEvent>,
    pub backoff: BackoffConfig,
    /// Consecutive parse failures before a message is skipped (0 never skips)
    pub max_parse_attempts: u32,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn MailClient>,
        parser: Arc<dyn MessageParser>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            store,
            client,
            parser,
            notifier: None,
            events,
            backoff: BackoffConfig::default(),
            max_parse_attempts: 5,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_parse_attempts(mut self, attempts: u32) -> Self {
        self.max_parse_attempts = attempts;
        self
    }

    /// Broadcast an event; having no subscribers is fine
    pub(crate) fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Sync event sent with no subscribers");
        }
    }
}
