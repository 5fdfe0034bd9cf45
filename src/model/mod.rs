//! Core records of the sync engine
//!
//! - **Mailbox**: a remote mailbox configured by the control plane
//! - **SyncState**: the per-mailbox cursor and baseline marker
//! - **Message**: a parsed, persisted message and its insert form
//! - **SkippedMessage**: dead-letter record for unparseable messages

mod mailbox;
mod message;
mod sync_state;

pub use mailbox::{Mailbox, MailboxId, NewMailbox, Security};
pub use message::{HeaderField, NewMessage, ParsedMessage, SkippedMessage, StoredMessage};
pub use sync_state::SyncState;
