//! Per-mailbox sync cursor

use super::MailboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Incremental sync progress for one mailbox
///
/// `cursor` is the highest remote UID whose message is durably stored (or
/// confirmed already stored). It never decreases.
/// `initial_sync_completed_at` is set once on first successful connect and
/// never cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub mailbox_id: MailboxId,
    pub cursor: u32,
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Fresh state for a mailbox seen for the first time
    pub fn new(mailbox_id: MailboxId) -> Self {
        Self {
            mailbox_id,
            cursor: 0,
            initial_sync_completed_at: None,
            last_synced_at: None,
        }
    }

    /// Whether baseline-and-skip has already happened
    pub fn is_baselined(&self) -> bool {
        self.initial_sync_completed_at.is_some()
    }

    /// State after baseline-and-skip against a folder whose next UID is `uid_next`
    ///
    /// Everything below `uid_next` is treated as history and never fetched.
    pub fn baselined(&self, uid_next: u32, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.cursor = next.cursor.max(uid_next.saturating_sub(1));
        next.initial_sync_completed_at.get_or_insert(now);
        next
    }

    /// State with the cursor moved to `uid`; lower values leave it unchanged
    pub fn advanced_to(&self, uid: u32) -> Self {
        let mut next = self.clone();
        next.cursor = next.cursor.max(uid);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_not_baselined() {
        let state = SyncState::new(3);
        assert_eq!(state.cursor, 0);
        assert!(!state.is_baselined());
        assert!(state.last_synced_at.is_none());
    }

    #[test]
    fn test_baseline_skips_history() {
        let state = SyncState::new(3).baselined(101, Utc::now());
        assert_eq!(state.cursor, 100);
        assert!(state.is_baselined());
    }

    #[test]
    fn test_baseline_on_empty_folder() {
        let state = SyncState::new(3).baselined(1, Utc::now());
        assert_eq!(state.cursor, 0);
        assert!(state.is_baselined());

        let state = SyncState::new(3).baselined(0, Utc::now());
        assert_eq!(state.cursor, 0);
    }

    #[test]
    fn test_baseline_keeps_original_timestamp() {
        let first = Utc::now() - chrono::Duration::days(1);
        let state = SyncState::new(3).baselined(10, first);
        let again = state.baselined(50, Utc::now());
        assert_eq!(again.initial_sync_completed_at, Some(first));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let state = SyncState::new(3).advanced_to(40);
        assert_eq!(state.advanced_to(12).cursor, 40);
        assert_eq!(state.advanced_to(41).cursor, 41);
    }
}
