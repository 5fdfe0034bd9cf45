//! Integration tests for mailsync
//!
//! These tests drive managers, the reconciler and the daemon against a
//! scripted in-process mail server and the in-memory store.

use async_trait::async_trait;
use mailsync::model::{
    Mailbox, MailboxId, NewMailbox, NewMessage, SkippedMessage, StoredMessage, SyncState,
};
use mailsync::notify::{DeliveryError, NotificationEvent, NotificationSink};
use mailsync::parser::MailParser;
use mailsync::protocol::{MailClient, MailSession, ProtocolError, ProtocolResult};
use mailsync::store::{
    InMemoryStore, MailboxAdmin, MailboxDirectory, MessageStore, Store, StoreError, StoreResult,
    SyncStateStore,
};
use mailsync::sync::{
    BackoffConfig, DaemonConfig, MailboxManager, ManagerState, PollScheduler, Reconciler,
    SyncContext, SyncDaemon, SyncError, SyncEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const SHARD: &str = "worker-1";

// ============================================================================
// Scripted mail server
// ============================================================================

#[derive(Default)]
struct Folder {
    messages: BTreeMap<u32, Vec<u8>>,
    uid_next: u32,
}

#[derive(Default)]
struct ServerState {
    folders: HashMap<String, Folder>,
    rejected: HashSet<String>,
    connect_failures: HashMap<String, u32>,
    fetch_failures: HashSet<(String, u32)>,
    connects: HashMap<String, u32>,
}

#[derive(Clone, Default)]
struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    fn new() -> Self {
        Self::default()
    }

    /// Append messages with the given uids to a user's folder
    fn deliver(&self, user: &str, uids: impl IntoIterator<Item = u32>) {
        let mut state = self.state.lock().unwrap();
        let folder = state.folders.entry(user.to_string()).or_insert_with(|| Folder {
            uid_next: 1,
            ..Default::default()
        });
        for uid in uids {
            folder.messages.insert(uid, raw_message(user, uid));
            folder.uid_next = folder.uid_next.max(uid + 1);
        }
    }

    fn deliver_raw(&self, user: &str, uid: u32, raw: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let folder = state.folders.entry(user.to_string()).or_insert_with(|| Folder {
            uid_next: 1,
            ..Default::default()
        });
        folder.messages.insert(uid, raw.to_vec());
        folder.uid_next = folder.uid_next.max(uid + 1);
    }

    fn reject(&self, user: &str) {
        self.state.lock().unwrap().rejected.insert(user.to_string());
    }

    fn accept(&self, user: &str) {
        self.state.lock().unwrap().rejected.remove(user);
    }

    fn fail_connects(&self, user: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .connect_failures
            .insert(user.to_string(), times);
    }

    fn fail_fetch(&self, user: &str, uid: u32) {
        self.state
            .lock()
            .unwrap()
            .fetch_failures
            .insert((user.to_string(), uid));
    }

    fn connects(&self, user: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .connects
            .get(user)
            .copied()
            .unwrap_or(0)
    }
}

fn raw_message(user: &str, uid: u32) -> Vec<u8> {
    format!(
        "Message-ID: <{uid}.{user}>\r\n\
         From: Sender <sender@example.com>\r\n\
         To: {user}\r\n\
         Subject: Message {uid}\r\n\
         Date: Mon, 19 Oct 2026 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Body of message {uid}\r\n"
    )
    .into_bytes()
}

#[async_trait]
impl MailClient for FakeServer {
    async fn connect(&self, mailbox: &Mailbox) -> ProtocolResult<Box<dyn MailSession>> {
        let user = mailbox.username.clone();
        let mut state = self.state.lock().unwrap();
        *state.connects.entry(user.clone()).or_insert(0) += 1;

        if state.rejected.contains(&user) {
            return Err(ProtocolError::Auth(format!("LOGIN rejected for {}", user)));
        }
        if let Some(remaining) = state.connect_failures.get_mut(&user) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProtocolError::Connection("connection refused".to_string()));
            }
        }

        Ok(Box::new(FakeSession {
            user,
            server: self.clone(),
        }))
    }
}

struct FakeSession {
    user: String,
    server: FakeServer,
}

#[async_trait]
impl MailSession for FakeSession {
    async fn open(&mut self, _folder: &str) -> ProtocolResult<u32> {
        let state = self.server.state.lock().unwrap();
        Ok(state
            .folders
            .get(&self.user)
            .map(|f| f.uid_next)
            .unwrap_or(1))
    }

    async fn search_after(&mut self, cursor: u32) -> ProtocolResult<Vec<u32>> {
        let state = self.server.state.lock().unwrap();
        let Some(folder) = state.folders.get(&self.user) else {
            return Ok(Vec::new());
        };
        let newer: Vec<u32> = folder.messages.range(cursor + 1..).map(|(uid, _)| *uid).collect();
        if newer.is_empty() {
            // `UID n:*` always matches the highest message
            return Ok(folder.messages.keys().next_back().copied().into_iter().collect());
        }
        Ok(newer)
    }

    async fn fetch(&mut self, uid: u32) -> ProtocolResult<Vec<u8>> {
        let state = self.server.state.lock().unwrap();
        if state.fetch_failures.contains(&(self.user.clone(), uid)) {
            return Err(ProtocolError::Connection("connection reset".to_string()));
        }
        state
            .folders
            .get(&self.user)
            .and_then(|f| f.messages.get(&uid).cloned())
            .ok_or_else(|| ProtocolError::Command(format!("uid {} not found", uid)))
    }

    async fn logout(&mut self) -> ProtocolResult<()> {
        Ok(())
    }
}

// ============================================================================
// Store and notifier doubles
// ============================================================================

/// In-memory store whose writes can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_cursor_updates: AtomicBool,
    fail_inserts: AtomicBool,
    fail_listing: AtomicBool,
}

#[async_trait]
impl MailboxDirectory for FlakyStore {
    async fn get_mailbox(&self, id: MailboxId) -> StoreResult<Option<Mailbox>> {
        self.inner.get_mailbox(id).await
    }

    async fn list_active_mailboxes(&self, shard: &str) -> StoreResult<Vec<Mailbox>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection pool exhausted".to_string()));
        }
        self.inner.list_active_mailboxes(shard).await
    }
}

#[async_trait]
impl SyncStateStore for FlakyStore {
    async fn get_or_create_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<SyncState> {
        self.inner.get_or_create_sync_state(mailbox_id).await
    }

    async fn update_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        if self.fail_cursor_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("sync state table locked".to_string()));
        }
        self.inner.update_sync_state(state).await
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<i64> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.insert_message(message).await
    }

    async fn record_skipped(&self, skipped: &SkippedMessage) -> StoreResult<()> {
        self.inner.record_skipped(skipped).await
    }
}

#[async_trait]
impl MailboxAdmin for FlakyStore {
    async fn create_mailbox(&self, mailbox: NewMailbox) -> StoreResult<Mailbox> {
        self.inner.create_mailbox(mailbox).await
    }

    async fn delete_mailbox(&self, id: MailboxId) -> StoreResult<()> {
        self.inner.delete_mailbox(id).await
    }

    async fn set_active(&self, id: MailboxId, active: bool) -> StoreResult<Mailbox> {
        self.inner.set_active(id, active).await
    }

    async fn assign_shard(&self, id: MailboxId, shard: &str) -> StoreResult<Mailbox> {
        self.inner.assign_shard(id, shard).await
    }

    async fn list_mailboxes(&self) -> StoreResult<Vec<Mailbox>> {
        self.inner.list_mailboxes().await
    }

    async fn get_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<Option<SyncState>> {
        self.inner.get_sync_state(mailbox_id).await
    }

    async fn list_sync_states(&self) -> StoreResult<Vec<SyncState>> {
        self.inner.list_sync_states().await
    }

    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.inner.list_messages(mailbox_id, limit).await
    }

    async fn count_messages(&self, mailbox_id: MailboxId) -> StoreResult<u64> {
        self.inner.count_messages(mailbox_id).await
    }

    async fn list_skipped(&self, mailbox_id: MailboxId) -> StoreResult<Vec<SkippedMessage>> {
        self.inner.list_skipped(mailbox_id).await
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    fn uids(&self) -> Vec<u32> {
        self.events.lock().unwrap().iter().map(|e| e.uid).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Transport("sink offline".to_string()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    server: FakeServer,
    store: Arc<FlakyStore>,
    notifier: Arc<RecordingNotifier>,
    ctx: SyncContext,
    events: broadcast::Sender<SyncEvent>,
}

impl Harness {
    fn new() -> Self {
        let server = FakeServer::new();
        let store = Arc::new(FlakyStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let (events, _) = broadcast::channel(256);
        let ctx = SyncContext::new(
            store.clone(),
            Arc::new(server.clone()),
            Arc::new(MailParser::new()),
            events.clone(),
        )
        .with_notifier(notifier.clone())
        .with_backoff(BackoffConfig::fixed(
            Duration::from_secs(1),
            Duration::from_secs(4),
        ));

        Self {
            server,
            store,
            notifier,
            ctx,
            events,
        }
    }

    async fn add_mailbox(&self, address: &str) -> Mailbox {
        self.store
            .create_mailbox(NewMailbox::new(address, "secret", "imap.example.com", SHARD))
            .await
            .unwrap()
    }

    /// A connected, baselined manager for a fresh mailbox
    async fn baselined_manager(&self, address: &str, existing: u32) -> MailboxManager {
        self.server.deliver(address, 1..=existing);
        let mailbox = self.add_mailbox(address).await;
        let mut manager = MailboxManager::new(mailbox, self.ctx.clone());
        manager.initialize().await.unwrap();
        manager.connect().await.unwrap();
        manager
    }

    async fn cursor(&self, mailbox_id: MailboxId) -> u32 {
        self.store
            .get_sync_state(mailbox_id)
            .await
            .unwrap()
            .map(|s| s.cursor)
            .unwrap_or(0)
    }

    async fn stored_uids(&self, mailbox_id: MailboxId) -> Vec<u32> {
        let mut uids: Vec<u32> = self
            .store
            .list_messages(mailbox_id, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message.uid)
            .collect();
        uids.sort_unstable();
        uids
    }
}

/// Wait for the first event matching `pred`
async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ============================================================================
// Manager lifecycle
// ============================================================================

mod baseline_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_connect_skips_existing_history() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();

        assert_eq!(manager.state(), ManagerState::Authenticated);
        assert_eq!(h.cursor(id).await, 100);
        let state = h.store.get_sync_state(id).await.unwrap().unwrap();
        assert!(state.initial_sync_completed_at.is_some());

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 0);
        assert!(report.is_clean());
        assert!(h.stored_uids(id).await.is_empty());
        assert!(h.notifier.uids().is_empty());
        assert_eq!(manager.state(), ManagerState::Idle);
    }

    #[tokio::test]
    async fn test_empty_folder_baselines_at_zero() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("empty@example.com", 0).await;
        let id = manager.mailbox_id();
        assert_eq!(h.cursor(id).await, 0);

        h.server.deliver("empty@example.com", [1]);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(h.cursor(id).await, 1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_existing_baseline() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("bob@example.com", 10).await;
        let id = manager.mailbox_id();
        let first = h.store.get_sync_state(id).await.unwrap().unwrap();

        manager.disconnect().await;
        h.server.deliver("bob@example.com", 11..=12);
        manager.connect().await.unwrap();

        let state = h.store.get_sync_state(id).await.unwrap().unwrap();
        assert_eq!(state.cursor, 10);
        assert_eq!(
            state.initial_sync_completed_at,
            first.initial_sync_completed_at
        );

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 2);
    }

    #[tokio::test]
    async fn test_poll_requires_connection() {
        let h = Harness::new();
        let mailbox = h.add_mailbox("idle@example.com").await;
        let mut manager = MailboxManager::new(mailbox, h.ctx.clone());
        manager.initialize().await.unwrap();

        assert!(manager.poll_once().await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_unknown_mailbox_fails() {
        let h = Harness::new();
        let mailbox = h.add_mailbox("ghost@example.com").await;
        h.store.delete_mailbox(mailbox.id).await.unwrap();

        let mut manager = MailboxManager::new(mailbox, h.ctx.clone());
        let err = manager.initialize().await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_incremental_fetch_in_order() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();

        h.server.deliver("alice@example.com", [103, 101, 102]);
        let report = manager.poll_once().await.unwrap();

        assert_eq!(report.searched, 3);
        assert_eq!(report.stored, 3);
        assert_eq!(report.notified, 3);
        assert_eq!(h.stored_uids(id).await, vec![101, 102, 103]);
        assert_eq!(h.cursor(id).await, 103);
        assert_eq!(h.notifier.uids(), vec![101, 102, 103]);

        let stored = h.store.list_messages(id, 1).await.unwrap();
        assert_eq!(stored[0].message.subject.as_deref(), Some("Message 103"));
        assert_eq!(
            stored[0].message.sender.as_deref(),
            Some("sender@example.com")
        );
    }

    #[tokio::test]
    async fn test_replay_after_cursor_failure_is_idempotent() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver("alice@example.com", 101..=103);

        h.store.fail_cursor_updates.store(true, Ordering::SeqCst);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.notified, 0);
        assert!(matches!(report.halted, Some(SyncError::Persistence(_))));
        assert_eq!(h.cursor(id).await, 100);

        h.store.fail_cursor_updates.store(false, Ordering::SeqCst);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.stored, 2);
        assert!(report.is_clean());

        assert_eq!(h.stored_uids(id).await, vec![101, 102, 103]);
        assert_eq!(h.cursor(id).await, 103);
        // The replayed message is not announced again
        assert_eq!(h.notifier.uids(), vec![102, 103]);
    }

    #[tokio::test]
    async fn test_redelivered_batch_is_not_stored_twice() {
        let h = Harness::new();
        let mut stale = h.baselined_manager("alice@example.com", 100).await;
        let id = stale.mailbox_id();
        h.server.deliver("alice@example.com", 101..=103);

        // A second manager for the same mailbox ingests the batch first
        let mut current = MailboxManager::new(
            h.store.get_mailbox(id).await.unwrap().unwrap(),
            h.ctx.clone(),
        );
        current.initialize().await.unwrap();
        current.connect().await.unwrap();
        let report = current.poll_once().await.unwrap();
        assert_eq!(report.stored, 3);
        assert_eq!(h.cursor(id).await, 103);

        // The stale manager still holds cursor 100 and sees 101..=103 again
        let report = stale.poll_once().await.unwrap();
        assert_eq!(report.searched, 3);
        assert_eq!(report.duplicates, 3);
        assert_eq!(report.stored, 0);
        assert_eq!(report.notified, 0);
        assert!(report.is_clean());

        assert_eq!(h.stored_uids(id).await, vec![101, 102, 103]);
        assert_eq!(h.cursor(id).await, 103);
        assert_eq!(h.notifier.uids(), vec![101, 102, 103]);
    }

    #[tokio::test]
    async fn test_insert_failure_holds_cursor() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver("alice@example.com", 101..=102);

        h.store.fail_inserts.store(true, Ordering::SeqCst);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 0);
        assert_eq!(report.halted.as_ref().map(|e| e.kind()), Some("persistence"));
        assert_eq!(h.cursor(id).await, 100);
        assert_eq!(manager.state(), ManagerState::Idle);

        h.store.fail_inserts.store(false, Ordering::SeqCst);
        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 2);
        assert_eq!(h.cursor(id).await, 102);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backwards() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver("alice@example.com", 101..=105);
        manager.poll_once().await.unwrap();

        let mut stale = h.store.get_sync_state(id).await.unwrap().unwrap();
        stale.cursor = 50;
        h.store.update_sync_state(&stale).await.unwrap();
        assert_eq!(h.cursor(id).await, 105);

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 0);
        assert_eq!(h.stored_uids(id).await.len(), 5);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_cursor() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver("alice@example.com", 101..=102);

        h.notifier.fail.store(true, Ordering::SeqCst);
        let report = manager.poll_once().await.unwrap();

        assert_eq!(report.stored, 2);
        assert_eq!(report.notify_failures, 2);
        assert!(report.is_clean());
        assert_eq!(h.cursor(id).await, 102);
    }

    #[tokio::test]
    async fn test_lost_connection_backs_off_at_last_safe_point() {
        let h = Harness::new();
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver("alice@example.com", 101..=103);
        h.server.fail_fetch("alice@example.com", 102);

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.stored, 1);
        assert!(report.connection_lost);
        assert_eq!(report.halted.as_ref().map(|e| e.kind()), Some("search_or_fetch"));
        assert_eq!(h.cursor(id).await, 101);

        assert!(!manager.is_connected());
        assert!(matches!(
            manager.state(),
            ManagerState::Backoff { attempt: 1, .. }
        ));
        assert!(manager.retry_at().is_some());
    }

    #[tokio::test]
    async fn test_poison_message_skipped_after_max_attempts() {
        let mut h = Harness::new();
        h.ctx = h.ctx.clone().with_max_parse_attempts(2);
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();

        h.server.deliver_raw("alice@example.com", 101, b"");
        h.server.deliver("alice@example.com", [102]);

        let report = manager.poll_once().await.unwrap();
        assert!(matches!(report.halted, Some(SyncError::Parse { uid: 101, .. })));
        assert_eq!(report.stored, 0);
        assert_eq!(h.cursor(id).await, 100);

        let report = manager.poll_once().await.unwrap();
        assert_eq!(report.skipped_poison, 1);
        assert_eq!(report.stored, 1);
        assert_eq!(h.cursor(id).await, 102);
        assert_eq!(h.stored_uids(id).await, vec![102]);

        let skipped = h.store.list_skipped(id).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].uid, 101);
        assert_eq!(skipped[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_parse_failure_halts_without_skip_policy() {
        let mut h = Harness::new();
        h.ctx = h.ctx.clone().with_max_parse_attempts(0);
        let mut manager = h.baselined_manager("alice@example.com", 100).await;
        let id = manager.mailbox_id();
        h.server.deliver_raw("alice@example.com", 101, b"");

        for _ in 0..5 {
            let report = manager.poll_once().await.unwrap();
            assert_eq!(report.halted.as_ref().map(|e| e.kind()), Some("parse"));
        }
        assert_eq!(h.cursor(id).await, 100);
        assert!(h.store.list_skipped(id).await.unwrap().is_empty());
    }
}

mod backoff_tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_grows_and_resets() {
        let h = Harness::new();
        let mailbox = h.add_mailbox("flaky@example.com").await;
        h.server.deliver("flaky@example.com", 1..=3);
        h.server.fail_connects("flaky@example.com", 3);

        let mut manager = MailboxManager::new(mailbox, h.ctx.clone());
        manager.initialize().await.unwrap();

        let mut delays = Vec::new();
        for _ in 0..3 {
            let err = manager.connect().await.unwrap_err();
            assert_eq!(err.kind(), "transient_connection");
            match manager.state() {
                ManagerState::Backoff { delay_ms, .. } => delays.push(delay_ms),
                other => panic!("expected backoff, got {}", other),
            }
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Authenticated);
        assert!(manager.retry_at().is_none());

        manager.disconnect().await;
        h.server.fail_connects("flaky@example.com", 1);
        manager.connect().await.unwrap_err();
        assert_eq!(
            manager.state(),
            ManagerState::Backoff {
                attempt: 1,
                delay_ms: 1000
            }
        );
    }

    #[tokio::test]
    async fn test_auth_failure_terminates_without_retry() {
        let h = Harness::new();
        let mailbox = h.add_mailbox("locked@example.com").await;
        h.server.reject("locked@example.com");

        let mut rx = h.events.subscribe();
        let mut manager = MailboxManager::new(mailbox, h.ctx.clone());
        manager.initialize().await.unwrap();

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err.kind(), "authentication");
        assert_eq!(manager.state(), ManagerState::Terminated);
        assert!(manager.retry_at().is_none());

        wait_for(&mut rx, |e| matches!(e, SyncEvent::Terminated { .. })).await;
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

mod reconcile_tests {
    use super::*;

    fn reconciler(h: &Harness) -> Reconciler {
        Reconciler::new(SHARD, h.ctx.clone())
            .with_poll_interval(Duration::from_secs(3600), Duration::ZERO)
            .with_stop_grace(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_reconcile_converges_on_active_mailboxes() {
        let h = Harness::new();
        let a = h.add_mailbox("a@example.com").await;
        let b = h.add_mailbox("b@example.com").await;
        let c = h.add_mailbox("c@example.com").await;
        h.store
            .create_mailbox(NewMailbox::new("d@example.com", "pw", "imap.example.com", "worker-2"))
            .await
            .unwrap();

        let mut reconciler = reconciler(&h);
        let registry = reconciler.registry();

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.started, vec![a.id, b.id, c.id]);
        assert_eq!(registry.len().await, 3);

        // Steady state is a no-op
        let report = reconciler.reconcile().await.unwrap();
        assert!(report.started.is_empty());
        assert!(report.stopped.is_empty());

        h.store.set_active(a.id, false).await.unwrap();
        h.store.assign_shard(b.id, "worker-2").await.unwrap();
        let report = reconciler.reconcile().await.unwrap();
        let mut stopped = report.stopped.clone();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![a.id, b.id]);
        assert!(registry.contains(c.id).await);
        assert_eq!(registry.len().await, 1);

        h.store.delete_mailbox(c.id).await.unwrap();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.stopped, vec![c.id]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_auth_failure_is_isolated() {
        let h = Harness::new();
        h.server.deliver("good@example.com", 1..=5);
        let good = h.add_mailbox("good@example.com").await;
        let bad = h.add_mailbox("bad@example.com").await;
        h.server.reject("bad@example.com");

        let mut stopped_rx = h.events.subscribe();
        let mut baselined_rx = h.events.subscribe();
        let mut reconciler = reconciler(&h);
        let registry = reconciler.registry();

        reconciler.reconcile().await.unwrap();
        wait_for(&mut stopped_rx, |e| {
            matches!(e, SyncEvent::ManagerStopped { mailbox_id } if *mailbox_id == bad.id)
        })
        .await;
        wait_for(&mut baselined_rx, |e| {
            matches!(e, SyncEvent::Baselined { mailbox_id, .. } if *mailbox_id == good.id)
        })
        .await;

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.terminated, vec![bad.id]);
        assert!(!registry.contains(bad.id).await);
        assert!(registry.contains(good.id).await);
        assert_eq!(h.cursor(good.id).await, 5);

        // The healthy mailbox keeps polling while the other is parked
        h.server.deliver("good@example.com", 6..=7);
        let mut poll_rx = h.events.subscribe();
        assert_eq!(PollScheduler::new(registry.clone()).poll_all().await, 1);
        let event = wait_for(&mut poll_rx, |e| {
            matches!(e, SyncEvent::PollCompleted { mailbox_id, .. } if *mailbox_id == good.id)
        })
        .await;
        let SyncEvent::PollCompleted { report, .. } = event else {
            unreachable!()
        };
        assert_eq!(report.stored, 2);
        assert_eq!(h.cursor(good.id).await, 7);
        assert_eq!(h.stored_uids(good.id).await, vec![6, 7]);

        // Parked until the mailbox changes
        let report = reconciler.reconcile().await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(h.server.connects("bad@example.com"), 1);

        h.store.set_active(bad.id, false).await.unwrap();
        reconciler.reconcile().await.unwrap();
        assert!(reconciler.parked().is_empty());

        h.server.accept("bad@example.com");
        h.store.set_active(bad.id, true).await.unwrap();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.started, vec![bad.id]);

        reconciler.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_managers_back_off_independently() {
        let h = Harness::new();
        h.server.deliver("steady@example.com", 1..=2);
        let steady = h.add_mailbox("steady@example.com").await;
        let flaky = h.add_mailbox("flaky@example.com").await;
        h.server.fail_connects("flaky@example.com", 100);

        let mut backoff_rx = h.events.subscribe();
        let mut baselined_rx = h.events.subscribe();
        let mut reconciler = reconciler(&h);
        let registry = reconciler.registry();
        reconciler.reconcile().await.unwrap();

        wait_for(&mut backoff_rx, |e| {
            matches!(e, SyncEvent::Backoff { mailbox_id, .. } if *mailbox_id == flaky.id)
        })
        .await;
        wait_for(&mut baselined_rx, |e| {
            matches!(e, SyncEvent::Baselined { mailbox_id, .. } if *mailbox_id == steady.id)
        })
        .await;

        assert!(matches!(
            registry.state_of(flaky.id).await,
            Some(ManagerState::Backoff { .. }) | Some(ManagerState::Connecting)
        ));
        assert!(matches!(
            registry.state_of(steady.id).await,
            Some(ManagerState::Authenticated) | Some(ManagerState::Idle)
        ));

        reconciler.shutdown(Duration::from_secs(2)).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_outage_keeps_registry() {
        let h = Harness::new();
        let a = h.add_mailbox("a@example.com").await;

        let mut reconciler = reconciler(&h);
        let registry = reconciler.registry();
        reconciler.reconcile().await.unwrap();
        assert!(registry.contains(a.id).await);

        h.store.fail_listing.store(true, Ordering::SeqCst);
        let err = reconciler.reconcile().await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert!(registry.contains(a.id).await);

        h.store.fail_listing.store(false, Ordering::SeqCst);
        let report = reconciler.reconcile().await.unwrap();
        assert!(report.started.is_empty());
        assert!(report.stopped.is_empty());

        reconciler.shutdown(Duration::from_secs(2)).await;
    }
}

// ============================================================================
// Poll scheduling
// ============================================================================

mod scheduler_tests {
    use super::*;

    async fn running_manager(
        h: &Harness,
        address: &str,
        interval: Duration,
    ) -> (Reconciler, MailboxId, broadcast::Receiver<SyncEvent>) {
        h.server.deliver(address, 1..=3);
        let mailbox = h.add_mailbox(address).await;
        let mut rx = h.events.subscribe();

        let mut reconciler = Reconciler::new(SHARD, h.ctx.clone())
            .with_poll_interval(interval, Duration::ZERO)
            .with_stop_grace(Duration::from_secs(2));
        reconciler.reconcile().await.unwrap();
        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::Baselined { mailbox_id, .. } if *mailbox_id == mailbox.id)
        })
        .await;

        (reconciler, mailbox.id, rx)
    }

    fn completed_polls(rx: &mut broadcast::Receiver<SyncEvent>, id: MailboxId) -> usize {
        let mut polls = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::PollCompleted { mailbox_id, .. } if mailbox_id == id) {
                polls += 1;
            }
        }
        polls
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_interval() {
        let h = Harness::new();
        let (mut reconciler, id, mut rx) =
            running_manager(&h, "tick@example.com", Duration::from_millis(300)).await;
        let scheduler = PollScheduler::new(reconciler.registry());

        assert_eq!(scheduler.dispatch_due().await, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.dispatch_due().await, 0);
        assert_eq!(completed_polls(&mut rx, id), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        h.server.deliver("tick@example.com", [4]);
        assert_eq!(scheduler.dispatch_due().await, 1);
        // The interval restarts from the dispatch
        assert_eq!(scheduler.dispatch_due().await, 0);

        let event = wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::PollCompleted { mailbox_id, .. } if *mailbox_id == id)
        })
        .await;
        let SyncEvent::PollCompleted { report, .. } = event else {
            unreachable!()
        };
        assert_eq!(report.stored, 1);
        assert_eq!(h.cursor(id).await, 4);

        reconciler.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_queued_trigger_absorbs_repeats() {
        let h = Harness::new();
        let (mut reconciler, id, mut rx) =
            running_manager(&h, "busy@example.com", Duration::from_secs(3600)).await;
        let scheduler = PollScheduler::new(reconciler.registry());
        h.server.deliver("busy@example.com", [4]);

        assert_eq!(scheduler.poll_all().await, 1);
        assert_eq!(scheduler.poll_all().await, 0);
        assert_eq!(scheduler.poll_all().await, 0);

        wait_for(&mut rx, |e| {
            matches!(e, SyncEvent::PollCompleted { mailbox_id, .. } if *mailbox_id == id)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(completed_polls(&mut rx, id), 0);
        assert_eq!(h.stored_uids(id).await, vec![4]);

        // Long interval: nothing is due
        assert_eq!(scheduler.dispatch_due().await, 0);

        reconciler.shutdown(Duration::from_secs(2)).await;
    }
}

// ============================================================================
// Daemon
// ============================================================================

mod daemon_tests {
    use super::*;

    #[tokio::test]
    async fn test_daemon_end_to_end() {
        let server = FakeServer::new();
        server.deliver("alice@example.com", 1..=50);
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let mailbox = store
            .create_mailbox(NewMailbox::new("alice@example.com", "pw", "imap.example.com", SHARD))
            .await
            .unwrap();

        let config = DaemonConfig::new(SHARD)
            .with_poll_interval(Duration::from_secs(3600), Duration::ZERO)
            .with_shutdown_grace(Duration::from_secs(2));
        let mut daemon = SyncDaemon::new(
            config,
            store.clone(),
            Arc::new(server.clone()),
            Arc::new(MailParser::new()),
            Some(notifier.clone()),
        );
        let mut rx = daemon.subscribe();

        let report = daemon.reconcile_once().await.unwrap();
        assert_eq!(report.started, vec![mailbox.id]);
        wait_for(&mut rx, |e| matches!(e, SyncEvent::Baselined { cursor: 50, .. })).await;

        server.deliver("alice@example.com", 51..=52);
        assert_eq!(daemon.poll_all_now().await, 1);

        let event = wait_for(&mut rx, |e| matches!(e, SyncEvent::PollCompleted { .. })).await;
        let SyncEvent::PollCompleted { report, .. } = event else {
            unreachable!()
        };
        assert_eq!(report.stored, 2);
        assert_eq!(notifier.uids(), vec![51, 52]);

        let stats = daemon.stats().await;
        assert_eq!(stats.managed, 1);
        assert_eq!(stats.reconcile_cycles, 1);
        assert!(stats.last_reconcile_at.is_some());

        let statuses = daemon.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].mailbox_id, mailbox.id);

        daemon.shutdown().await;
        assert!(daemon.registry().is_empty().await);
        let state = store.get_sync_state(mailbox.id).await.unwrap().unwrap();
        assert_eq!(state.cursor, 52);
    }

    #[tokio::test]
    async fn test_daemon_stops_on_command() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mut daemon = SyncDaemon::new(
            DaemonConfig::new(SHARD).with_shutdown_grace(Duration::from_secs(1)),
            store,
            Arc::new(FakeServer::new()),
            Arc::new(MailParser::new()),
            None,
        );

        let commands = daemon.command_sender();
        commands
            .send(mailsync::sync::DaemonCommand::Shutdown)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), daemon.run())
            .await
            .expect("daemon did not stop")
            .unwrap();

        // A daemon runs once
        assert!(daemon.run().await.is_err());
    }
}
