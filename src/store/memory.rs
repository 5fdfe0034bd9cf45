//! In-memory store for tests and dry runs

use super::{
    MailboxAdmin, MailboxDirectory, MessageStore, StoreError, StoreResult, SyncStateStore,
};
use crate::model::{
    Mailbox, MailboxId, NewMailbox, NewMessage, SkippedMessage, StoredMessage, SyncState,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Tables {
    next_mailbox_id: MailboxId,
    next_message_id: i64,
    mailboxes: BTreeMap<MailboxId, Mailbox>,
    sync_states: BTreeMap<MailboxId, SyncState>,
    messages: Vec<StoredMessage>,
    skipped: HashMap<(MailboxId, u32), SkippedMessage>,
}

/// Store that keeps every table in process memory
///
/// Enforces the same invariants as [`super::SqliteStore`]: unique
/// (mailbox, uid) and (mailbox, message id), monotonic cursors and cascading
/// deletes.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Every stored message, in insertion order
    pub fn all_messages(&self) -> StoreResult<Vec<StoredMessage>> {
        Ok(self.tables()?.messages.clone())
    }
}

fn require<'a>(tables: &'a mut Tables, id: MailboxId) -> StoreResult<&'a mut Mailbox> {
    tables
        .mailboxes
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))
}

#[async_trait]
impl MailboxDirectory for InMemoryStore {
    async fn get_mailbox(&self, id: MailboxId) -> StoreResult<Option<Mailbox>> {
        Ok(self.tables()?.mailboxes.get(&id).cloned())
    }

    async fn list_active_mailboxes(&self, shard: &str) -> StoreResult<Vec<Mailbox>> {
        Ok(self
            .tables()?
            .mailboxes
            .values()
            .filter(|m| m.active && m.shard == shard)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncStateStore for InMemoryStore {
    async fn get_or_create_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<SyncState> {
        let mut tables = self.tables()?;
        require(&mut tables, mailbox_id)?;
        Ok(tables
            .sync_states
            .entry(mailbox_id)
            .or_insert_with(|| SyncState::new(mailbox_id))
            .clone())
    }

    async fn update_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        let mut tables = self.tables()?;
        require(&mut tables, state.mailbox_id)?;

        let stored = tables
            .sync_states
            .entry(state.mailbox_id)
            .or_insert_with(|| SyncState::new(state.mailbox_id));
        stored.cursor = stored.cursor.max(state.cursor);
        if stored.initial_sync_completed_at.is_none() {
            stored.initial_sync_completed_at = state.initial_sync_completed_at;
        }
        if state.last_synced_at.is_some() {
            stored.last_synced_at = state.last_synced_at;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<i64> {
        let mut tables = self.tables()?;
        require(&mut tables, message.mailbox_id)?;

        let duplicate = tables.messages.iter().any(|m| {
            m.message.mailbox_id == message.mailbox_id
                && (m.message.uid == message.uid
                    || (message.message_id.is_some()
                        && m.message.message_id == message.message_id))
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "mailbox {} uid {}",
                message.mailbox_id, message.uid
            )));
        }

        tables.next_message_id += 1;
        let id = tables.next_message_id;
        tables.messages.push(StoredMessage {
            id,
            message: message.clone(),
            stored_at: Utc::now(),
        });
        Ok(id)
    }

    async fn record_skipped(&self, skipped: &SkippedMessage) -> StoreResult<()> {
        let mut tables = self.tables()?;
        require(&mut tables, skipped.mailbox_id)?;
        tables
            .skipped
            .insert((skipped.mailbox_id, skipped.uid), skipped.clone());
        Ok(())
    }
}

#[async_trait]
impl MailboxAdmin for InMemoryStore {
    async fn create_mailbox(&self, mailbox: NewMailbox) -> StoreResult<Mailbox> {
        let mut tables = self.tables()?;
        tables.next_mailbox_id += 1;
        let created = mailbox.into_mailbox(tables.next_mailbox_id, Utc::now());
        tables.mailboxes.insert(created.id, created.clone());
        Ok(created)
    }

    async fn delete_mailbox(&self, id: MailboxId) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if tables.mailboxes.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("mailbox {}", id)));
        }
        tables.sync_states.remove(&id);
        tables.messages.retain(|m| m.message.mailbox_id != id);
        tables.skipped.retain(|(mailbox_id, _), _| *mailbox_id != id);
        Ok(())
    }

    async fn set_active(&self, id: MailboxId, active: bool) -> StoreResult<Mailbox> {
        let mut tables = self.tables()?;
        let mailbox = require(&mut tables, id)?;
        mailbox.active = active;
        Ok(mailbox.clone())
    }

    async fn assign_shard(&self, id: MailboxId, shard: &str) -> StoreResult<Mailbox> {
        let mut tables = self.tables()?;
        let mailbox = require(&mut tables, id)?;
        mailbox.shard = shard.to_string();
        Ok(mailbox.clone())
    }

    async fn list_mailboxes(&self) -> StoreResult<Vec<Mailbox>> {
        Ok(self.tables()?.mailboxes.values().cloned().collect())
    }

    async fn get_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<Option<SyncState>> {
        Ok(self.tables()?.sync_states.get(&mailbox_id).cloned())
    }

    async fn list_sync_states(&self) -> StoreResult<Vec<SyncState>> {
        Ok(self.tables()?.sync_states.values().cloned().collect())
    }

    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.message.uid.cmp(&a.message.uid));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn count_messages(&self, mailbox_id: MailboxId) -> StoreResult<u64> {
        Ok(self
            .tables()?
            .messages
            .iter()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .count() as u64)
    }

    async fn list_skipped(&self, mailbox_id: MailboxId) -> StoreResult<Vec<SkippedMessage>> {
        let mut skipped: Vec<SkippedMessage> = self
            .tables()?
            .skipped
            .values()
            .filter(|s| s.mailbox_id == mailbox_id)
            .cloned()
            .collect();
        skipped.sort_by_key(|s| s.uid);
        Ok(skipped)
    }
}
