//! Fleet reconciliation
//!
//! Matches the set of live managers to the active mailboxes assigned to this
//! instance. Each pass sweeps finished managers, stops managers whose mailbox
//! disappeared (or changed connection settings) and starts managers for new
//! mailboxes. Mailboxes whose manager terminated on rejected credentials stay
//! parked until their settings change or they are deactivated.

use super::handle::ManagerHandle;
use super::manager::MailboxManager;
use super::metrics;
use super::state::ManagerState;
use super::{SyncContext, SyncError, SyncEvent};
use crate::model::{Mailbox, MailboxId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Registry of live managers keyed by mailbox
///
/// Owned by the reconciler and shared with the poll scheduler.
#[derive(Clone, Default)]
pub struct ManagedMailboxes {
    inner: Arc<Mutex<HashMap<MailboxId, ManagerHandle>>>,
}

/// Snapshot of one managed mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub mailbox_id: MailboxId,
    #[serde(flatten)]
    pub state: ManagerState,
    pub poll_interval_ms: u64,
}

impl ManagedMailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, HashMap<MailboxId, ManagerHandle>> {
        self.inner.lock().await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn contains(&self, mailbox_id: MailboxId) -> bool {
        self.inner.lock().await.contains_key(&mailbox_id)
    }

    pub async fn state_of(&self, mailbox_id: MailboxId) -> Option<ManagerState> {
        self.inner.lock().await.get(&mailbox_id).map(|h| h.state())
    }

    /// Status of every managed mailbox, ordered by id
    pub async fn statuses(&self) -> Vec<ManagerStatus> {
        let registry = self.inner.lock().await;
        let mut statuses: Vec<ManagerStatus> = registry
            .values()
            .map(|h| ManagerStatus {
                mailbox_id: h.mailbox_id(),
                state: h.state(),
                poll_interval_ms: u64::try_from(h.poll_interval().as_millis()).unwrap_or(u64::MAX),
            })
            .collect();
        statuses.sort_by_key(|s| s.mailbox_id);
        statuses
    }

    /// Count of managers per state name
    pub async fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for handle in self.inner.lock().await.values() {
            *counts.entry(handle.state().name()).or_insert(0) += 1;
        }
        counts
    }
}

/// What one reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Active mailboxes assigned to this shard
    pub assigned: usize,
    pub started: Vec<MailboxId>,
    pub stopped: Vec<MailboxId>,
    /// Mailboxes whose manager failed to initialize; retried next pass
    pub failed: Vec<MailboxId>,
    /// Managers swept after terminating on rejected credentials
    pub terminated: Vec<MailboxId>,
    /// Managers still managed after the pass
    pub managed: usize,
}

/// Keeps the registry converged on the shard's active mailboxes
pub struct Reconciler {
    shard: String,
    ctx: SyncContext,
    registry: ManagedMailboxes,
    /// Mailboxes parked after an auth failure, with the fingerprint that failed
    parked: HashMap<MailboxId, u64>,
    poll_interval: Duration,
    poll_jitter: Duration,
    stop_grace: Duration,
    last_reconcile_at: Option<DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(shard: impl Into<String>, ctx: SyncContext) -> Self {
        Self {
            shard: shard.into(),
            ctx,
            registry: ManagedMailboxes::new(),
            parked: HashMap::new(),
            poll_interval: Duration::from_secs(60),
            poll_jitter: Duration::from_secs(5),
            stop_grace: Duration::from_secs(10),
            last_reconcile_at: None,
        }
    }

    /// Base poll interval and the bound of each manager's random offset
    pub fn with_poll_interval(mut self, interval: Duration, jitter: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_jitter = jitter;
        self
    }

    /// How long a stopped manager gets to log out before it is aborted
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Registry shared with the scheduler and the API
    pub fn registry(&self) -> ManagedMailboxes {
        self.registry.clone()
    }

    pub fn parked(&self) -> Vec<MailboxId> {
        let mut ids: Vec<MailboxId> = self.parked.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn last_reconcile_at(&self) -> Option<DateTime<Utc>> {
        self.last_reconcile_at
    }

    fn jittered_interval(&self) -> Duration {
        let jitter_ms = u64::try_from(self.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run one reconcile pass
    ///
    /// A failure to list mailboxes leaves the registry untouched.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport, SyncError> {
        let desired: HashMap<MailboxId, Mailbox> = match self
            .ctx
            .store
            .list_active_mailboxes(&self.shard)
            .await
        {
            Ok(mailboxes) => mailboxes.into_iter().map(|m| (m.id, m)).collect(),
            Err(e) => {
                metrics::record_reconcile_cycle("failed");
                tracing::warn!(shard = %self.shard, error = %e, "Could not list mailboxes");
                return Err(SyncError::Persistence(e.to_string()));
            }
        };

        let mut report = ReconcileReport {
            assigned: desired.len(),
            ..Default::default()
        };

        let (reaped, to_stop) = {
            let mut registry = self.registry.lock().await;

            let finished: Vec<MailboxId> = registry
                .iter()
                .filter(|(_, h)| h.is_finished() || h.state().is_terminal())
                .map(|(id, _)| *id)
                .collect();
            let mut reaped = Vec::with_capacity(finished.len());
            for id in finished {
                if let Some(handle) = registry.remove(&id) {
                    if handle.state().is_terminal() {
                        self.parked.insert(id, handle.fingerprint());
                        report.terminated.push(id);
                        tracing::info!(mailbox_id = id, "Parked mailbox after rejected credentials");
                    } else {
                        tracing::warn!(mailbox_id = id, "Manager exited unexpectedly, will restart");
                    }
                    reaped.push(handle);
                }
            }

            self.parked.retain(|id, fingerprint| {
                desired
                    .get(id)
                    .is_some_and(|m| m.connection_fingerprint() == *fingerprint)
            });

            let stale: Vec<MailboxId> = registry
                .iter()
                .filter(|(id, h)| desired.get(id).map_or(true, |m| !h.matches(m)))
                .map(|(id, _)| *id)
                .collect();
            let to_stop: Vec<ManagerHandle> = stale
                .into_iter()
                .filter_map(|id| registry.remove(&id))
                .collect();
            (reaped, to_stop)
        };

        for handle in &to_stop {
            report.stopped.push(handle.mailbox_id());
            tracing::info!(mailbox_id = handle.mailbox_id(), "Stopping manager");
        }
        let grace = self.stop_grace;
        join_all(
            reaped
                .into_iter()
                .chain(to_stop)
                .map(|h| h.stop(grace)),
        )
        .await;

        let mut to_start: Vec<&Mailbox> = {
            let registry = self.registry.lock().await;
            desired
                .values()
                .filter(|m| !registry.contains_key(&m.id) && !self.parked.contains_key(&m.id))
                .collect()
        };
        to_start.sort_by_key(|m| m.id);

        for mailbox in to_start {
            let mut manager = MailboxManager::new(mailbox.clone(), self.ctx.clone());
            if let Err(e) = manager.initialize().await {
                tracing::warn!(mailbox_id = mailbox.id, error = %e, "Manager failed to initialize");
                report.failed.push(mailbox.id);
                continue;
            }

            let handle = ManagerHandle::spawn(manager, self.jittered_interval());
            tracing::info!(
                mailbox_id = mailbox.id,
                address = %mailbox.address,
                poll_interval_ms = u64::try_from(handle.poll_interval().as_millis()).unwrap_or(u64::MAX),
                "Started manager"
            );
            self.registry.lock().await.insert(mailbox.id, handle);
            report.started.push(mailbox.id);
        }

        report.managed = self.registry.len().await;
        metrics::set_managed_mailboxes(report.managed);
        metrics::set_manager_states(self.registry.state_counts().await);
        metrics::record_reconcile_cycle("success");
        self.last_reconcile_at = Some(Utc::now());

        if !report.started.is_empty() || !report.stopped.is_empty() || !report.terminated.is_empty()
        {
            tracing::info!(
                shard = %self.shard,
                assigned = report.assigned,
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                managed = report.managed,
                "Reconcile completed"
            );
        }
        self.ctx.emit(SyncEvent::ReconcileCompleted(report.clone()));
        Ok(report)
    }

    /// Stop every manager, waiting up to `grace` before aborting stragglers
    pub async fn shutdown(&mut self, grace: Duration) {
        let handles: Vec<ManagerHandle> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return;
        }

        tracing::info!(count = handles.len(), "Stopping all managers");
        join_all(handles.into_iter().map(|h| h.stop(grace))).await;
        metrics::set_managed_mailboxes(0);
        metrics::set_manager_states(std::iter::empty::<(&str, usize)>());
    }
}
