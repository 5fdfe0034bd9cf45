//! Fetch/persist pipeline
//!
//! One cycle walks the identifiers above the cursor in ascending order:
//! fetch, parse, insert, persist the cursor, notify. The cursor moves one
//! message at a time and only past messages that are durably recorded (or
//! already were), so a failure anywhere leaves it at the last safe point.

use super::{SyncContext, SyncError};
use crate::model::{MailboxId, NewMessage, SkippedMessage, SyncState};
use crate::notify::NotificationEvent;
use crate::protocol::MailSession;
use chrono::Utc;
use std::collections::HashMap;

use super::metrics;

/// Outcome of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Identifiers above the cursor returned by the search
    pub searched: usize,
    /// New messages inserted
    pub stored: usize,
    /// Messages already recorded
    pub duplicates: usize,
    pub notified: usize,
    pub notify_failures: usize,
    /// Messages stepped past after repeated parse failures
    pub skipped_poison: usize,
    /// Why the cycle ended early, if it did
    pub halted: Option<SyncError>,
    /// The session died during the cycle
    pub connection_lost: bool,
}

impl PollReport {
    pub fn is_clean(&self) -> bool {
        self.halted.is_none()
    }
}

/// Consecutive parse failures per identifier
#[derive(Debug, Default)]
pub struct PoisonTracker {
    failures: HashMap<u32, u32>,
}

impl PoisonTracker {
    /// Count a failure, returning the running total for `uid`
    pub fn record_failure(&mut self, uid: u32) -> u32 {
        let count = self.failures.entry(uid).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&mut self, uid: u32) {
        self.failures.remove(&uid);
    }

    pub fn failures(&self, uid: u32) -> u32 {
        self.failures.get(&uid).copied().unwrap_or(0)
    }
}

/// Persist `next`, then adopt it in memory
async fn commit_cursor(
    ctx: &SyncContext,
    state: &mut SyncState,
    uid: u32,
) -> Result<(), SyncError> {
    let next = state.advanced_to(uid);
    ctx.store
        .update_sync_state(&next)
        .await
        .map_err(|e| SyncError::Persistence(format!("cursor update to {}: {}", uid, e)))?;
    *state = next;
    Ok(())
}

/// Run one fetch/persist cycle against an open session
pub(crate) async fn run_cycle(
    ctx: &SyncContext,
    mailbox_id: MailboxId,
    session: &mut dyn MailSession,
    state: &mut SyncState,
    poison: &mut PoisonTracker,
) -> PollReport {
    let mut report = PollReport::default();

    let mut uids = match session.search_after(state.cursor).await {
        Ok(uids) => uids,
        Err(e) => {
            tracing::warn!(mailbox_id, cursor = state.cursor, error = %e, "Search failed");
            report.connection_lost = e.is_connection_lost();
            report.halted = Some(SyncError::SearchOrFetch(e.to_string()));
            return report;
        }
    };

    let cursor = state.cursor;
    uids.retain(|uid| *uid > cursor);
    uids.sort_unstable();
    uids.dedup();
    report.searched = uids.len();

    if uids.is_empty() {
        tracing::trace!(mailbox_id, cursor, "No new messages");
        return report;
    }

    tracing::debug!(mailbox_id, cursor, count = uids.len(), "New messages found");

    for uid in uids {
        let raw = match session.fetch(uid).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(mailbox_id, uid, error = %e, "Fetch failed");
                report.connection_lost = e.is_connection_lost();
                report.halted = Some(SyncError::SearchOrFetch(e.to_string()));
                return report;
            }
        };

        let parsed = match ctx.parser.parse(&raw) {
            Ok(parsed) => {
                poison.clear(uid);
                parsed
            }
            Err(e) => {
                let attempts = poison.record_failure(uid);
                if ctx.max_parse_attempts > 0 && attempts >= ctx.max_parse_attempts {
                    match skip_poison(ctx, mailbox_id, uid, attempts, &e.to_string(), state).await
                    {
                        Ok(()) => {
                            poison.clear(uid);
                            report.skipped_poison += 1;
                            continue;
                        }
                        Err(err) => {
                            report.halted = Some(err);
                            return report;
                        }
                    }
                }

                tracing::warn!(
                    mailbox_id,
                    uid,
                    attempts,
                    error = %e,
                    "Parse failed, cycle stops at this message"
                );
                report.halted = Some(SyncError::Parse {
                    uid,
                    reason: e.to_string(),
                });
                return report;
            }
        };

        let message = NewMessage::from_parsed(mailbox_id, uid, parsed, Utc::now());

        match ctx.store.insert_message(&message).await {
            Ok(row_id) => {
                if let Err(err) = commit_cursor(ctx, state, uid).await {
                    // Stored but cursor not persisted: the next cycle replays it as a duplicate
                    tracing::error!(mailbox_id, uid, error = %err, "Cursor update failed");
                    report.stored += 1;
                    metrics::record_message("stored");
                    report.halted = Some(err);
                    return report;
                }
                report.stored += 1;
                metrics::record_message("stored");
                tracing::debug!(mailbox_id, uid, row_id, "Message stored");

                if let Some(notifier) = &ctx.notifier {
                    let event = NotificationEvent::new(row_id, &message);
                    match notifier.deliver(&event).await {
                        Ok(()) => {
                            report.notified += 1;
                            metrics::record_notification("delivered");
                        }
                        Err(e) => {
                            report.notify_failures += 1;
                            metrics::record_notification("failed");
                            tracing::warn!(mailbox_id, uid, error = %e, "Notification failed");
                        }
                    }
                }
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(mailbox_id, uid, "Message already recorded");
                if let Err(err) = commit_cursor(ctx, state, uid).await {
                    tracing::error!(mailbox_id, uid, error = %err, "Cursor update failed");
                    report.halted = Some(err);
                    return report;
                }
                report.duplicates += 1;
                metrics::record_message("duplicate");
            }
            Err(e) => {
                tracing::error!(mailbox_id, uid, error = %e, "Insert failed");
                report.halted = Some(SyncError::Persistence(e.to_string()));
                return report;
            }
        }
    }

    report
}

/// Dead-letter a message and move the cursor past it
async fn skip_poison(
    ctx: &SyncContext,
    mailbox_id: MailboxId,
    uid: u32,
    attempts: u32,
    reason: &str,
    state: &mut SyncState,
) -> Result<(), SyncError> {
    let skipped = SkippedMessage {
        mailbox_id,
        uid,
        attempts,
        reason: reason.to_string(),
        skipped_at: Utc::now(),
    };
    ctx.store
        .record_skipped(&skipped)
        .await
        .map_err(|e| SyncError::Persistence(format!("dead-letter for uid {}: {}", uid, e)))?;
    commit_cursor(ctx, state, uid).await?;

    metrics::record_message("skipped");
    tracing::error!(
        mailbox_id,
        uid,
        attempts,
        reason,
        "Skipping unparseable message"
    );
    Ok(())
}
