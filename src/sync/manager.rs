//! Per-mailbox connection lifecycle

use super::backoff::Backoff;
use super::metrics;
use super::pipeline::{run_cycle, PoisonTracker, PollReport};
use super::state::ManagerState;
use super::{SyncContext, SyncError, SyncEvent};
use crate::model::{Mailbox, MailboxId, SyncState};
use crate::protocol::MailSession;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Owns one mailbox's connection, cursor and poll cycle
///
/// Every operation takes `&mut self`, so a manager is driven by exactly one
/// control loop (see [`super::ManagerHandle`]). The state enum is the only
/// record of where the manager is in its lifecycle; it is published on a
/// watch channel for the reconciler and the API.
pub struct MailboxManager {
    mailbox: Mailbox,
    ctx: SyncContext,
    state: ManagerState,
    state_tx: watch::Sender<ManagerState>,
    sync_state: Option<SyncState>,
    session: Option<Box<dyn MailSession>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    poison: PoisonTracker,
}

impl MailboxManager {
    pub fn new(mailbox: Mailbox, ctx: SyncContext) -> Self {
        let (state_tx, _) = watch::channel(ManagerState::Idle);
        let backoff = Backoff::new(ctx.backoff.clone());
        Self {
            mailbox,
            ctx,
            state: ManagerState::Idle,
            state_tx,
            sync_state: None,
            session: None,
            backoff,
            retry_at: None,
            poison: PoisonTracker::default(),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox.id
    }

    pub(crate) fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    pub fn sync_state(&self) -> Option<&SyncState> {
        self.sync_state.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// When the next connection attempt is due, while backing off
    pub fn retry_at(&self) -> Option<Instant> {
        match self.state {
            ManagerState::Backoff { .. } => self.retry_at,
            _ => None,
        }
    }

    fn transition(&mut self, next: ManagerState) -> bool {
        if !self.state.can_transition_to(&next) {
            tracing::warn!(
                mailbox_id = self.mailbox.id,
                from = %self.state,
                to = %next,
                "Ignoring illegal state transition"
            );
            return false;
        }

        tracing::trace!(mailbox_id = self.mailbox.id, from = %self.state, to = %next, "State change");
        self.state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// Load the sync state, creating it on first encounter
    pub async fn initialize(&mut self) -> Result<(), SyncError> {
        let state = self
            .ctx
            .store
            .get_or_create_sync_state(self.mailbox.id)
            .await
            .map_err(|e| SyncError::Persistence(format!("sync state unavailable: {}", e)))?;

        tracing::debug!(
            mailbox_id = self.mailbox.id,
            cursor = state.cursor,
            baselined = state.is_baselined(),
            "Manager initialized"
        );
        self.sync_state = Some(state);
        Ok(())
    }

    /// Connect, authenticate and open the folder
    ///
    /// The first successful connect of a mailbox performs baseline-and-skip:
    /// everything already in the folder is treated as history.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        if self.session.is_some() {
            return Ok(());
        }
        let Some(sync_state) = self.sync_state.clone() else {
            return Err(SyncError::Persistence(
                "connect before initialize".to_string(),
            ));
        };
        if !self.transition(ManagerState::Connecting) {
            return Err(SyncError::TransientConnection(format!(
                "cannot connect from state {}",
                self.state
            )));
        }

        let mut session = match self.ctx.client.connect(&self.mailbox).await {
            Ok(session) => session,
            Err(e) => return Err(self.connection_failed(e.into())),
        };

        let uid_next = match session.open(&self.mailbox.folder).await {
            Ok(uid_next) => uid_next,
            Err(e) => {
                let _ = session.logout().await;
                return Err(self.connection_failed(e.into()));
            }
        };

        self.transition(ManagerState::Authenticated);
        self.session = Some(session);
        tracing::info!(
            mailbox_id = self.mailbox.id,
            folder = %self.mailbox.folder,
            uid_next,
            "Connected"
        );
        self.ctx.emit(SyncEvent::Connected {
            mailbox_id: self.mailbox.id,
        });

        if !sync_state.is_baselined() {
            let baselined = sync_state.baselined(uid_next, Utc::now());
            if let Err(e) = self.ctx.store.update_sync_state(&baselined).await {
                self.drop_session().await;
                return Err(self.connection_failed(SyncError::Persistence(format!(
                    "baseline not persisted: {}",
                    e
                ))));
            }

            tracing::info!(
                mailbox_id = self.mailbox.id,
                cursor = baselined.cursor,
                "Baseline set, existing messages skipped"
            );
            self.ctx.emit(SyncEvent::Baselined {
                mailbox_id: self.mailbox.id,
                cursor: baselined.cursor,
            });
            self.sync_state = Some(baselined);
        }

        self.backoff.reset();
        self.retry_at = None;
        Ok(())
    }

    /// Dispatch a connection failure on its kind
    fn connection_failed(&mut self, err: SyncError) -> SyncError {
        if let SyncError::Authentication(ref reason) = err {
            metrics::record_connection_failure("auth");
            self.transition(ManagerState::Terminated);
            tracing::error!(
                mailbox_id = self.mailbox.id,
                reason = %reason,
                "Authentication rejected, manager terminated"
            );
            self.ctx.emit(SyncEvent::Terminated {
                mailbox_id: self.mailbox.id,
                reason: reason.clone(),
            });
            return err;
        }

        metrics::record_connection_failure("transient");
        self.enter_backoff(&err);
        err
    }

    fn enter_backoff(&mut self, cause: &SyncError) {
        let (attempt, delay) = self.backoff.next_delay();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        if self.transition(ManagerState::Backoff { attempt, delay_ms }) {
            self.retry_at = Some(Instant::now() + delay);
            tracing::warn!(
                mailbox_id = self.mailbox.id,
                attempt,
                delay_ms,
                error = %cause,
                "Connection failed, backing off"
            );
            self.ctx.emit(SyncEvent::Backoff {
                mailbox_id: self.mailbox.id,
                attempt,
                delay_ms,
            });
        }
    }

    /// Run one poll cycle
    ///
    /// Returns `None` without doing anything unless the manager is connected,
    /// baselined and not already polling.
    pub async fn poll_once(&mut self) -> Option<PollReport> {
        let ready = matches!(self.state, ManagerState::Idle | ManagerState::Authenticated)
            && self.session.is_some()
            && self
                .sync_state
                .as_ref()
                .is_some_and(SyncState::is_baselined);
        if !ready {
            tracing::debug!(mailbox_id = self.mailbox.id, state = %self.state, "Poll skipped");
            return None;
        }

        self.transition(ManagerState::Polling);
        let started = std::time::Instant::now();

        let (Some(session), Some(sync_state)) = (self.session.as_mut(), self.sync_state.as_mut())
        else {
            return None;
        };
        let report = run_cycle(
            &self.ctx,
            self.mailbox.id,
            session.as_mut(),
            sync_state,
            &mut self.poison,
        )
        .await;

        sync_state.last_synced_at = Some(Utc::now());
        if let Err(e) = self.ctx.store.update_sync_state(sync_state).await {
            tracing::warn!(mailbox_id = self.mailbox.id, error = %e, "Failed to record poll time");
        }

        let outcome = match &report.halted {
            None => "ok",
            Some(err) => {
                metrics::record_sync_error(err.kind());
                err.kind()
            }
        };
        metrics::record_poll_duration(outcome, started.elapsed().as_secs_f64());

        if report.stored > 0 || report.halted.is_some() {
            tracing::info!(
                mailbox_id = self.mailbox.id,
                stored = report.stored,
                duplicates = report.duplicates,
                skipped = report.skipped_poison,
                halted = ?report.halted,
                "Poll completed"
            );
        }

        if report.connection_lost {
            self.drop_session().await;
            let cause = report
                .halted
                .clone()
                .unwrap_or_else(|| SyncError::SearchOrFetch("connection lost".to_string()));
            metrics::record_connection_failure("transient");
            self.enter_backoff(&cause);
        } else {
            self.transition(ManagerState::Idle);
        }

        self.ctx.emit(SyncEvent::PollCompleted {
            mailbox_id: self.mailbox.id,
            report: report.clone(),
        });
        Some(report)
    }

    async fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                tracing::debug!(mailbox_id = self.mailbox.id, error = %e, "Logout failed");
            }
        }
    }

    /// Log out if connected and return to idle
    pub async fn disconnect(&mut self) {
        self.drop_session().await;
        self.retry_at = None;
        if !matches!(self.state, ManagerState::Idle | ManagerState::Terminated) {
            self.transition(ManagerState::Idle);
        }
        tracing::debug!(mailbox_id = self.mailbox.id, "Disconnected");
    }
}
