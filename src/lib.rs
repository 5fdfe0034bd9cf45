//! mailsync - Sharded mailbox ingestion daemon
//!
//! Keeps a fleet of remote IMAP mailboxes mirrored into a relational store.
//! Each worker instance owns the mailboxes assigned to its shard, runs one
//! long-lived manager per mailbox and ingests only messages newer than a
//! durable per-mailbox cursor. Newly stored messages are announced to a
//! notification sink.
//!
//! # Architecture
//!
//! - **config**: YAML configuration and validation
//! - **model**: Mailbox, sync state and message records
//! - **store**: Storage traits with SQLite and in-memory backends
//! - **protocol**: Async mail client/session traits and the IMAP adapter
//! - **parser**: Raw RFC 5322 messages into structured fields
//! - **notify**: Notification events and the webhook sink
//! - **sync**: Managers, reconciler, poll scheduler and the daemon loop
//! - **server**: Control-plane HTTP API

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod notify;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sync;

// Re-exports
pub use error::{MailsyncError, Result};
