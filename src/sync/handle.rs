//! Task wrapper that drives one manager

use super::manager::MailboxManager;
use super::state::ManagerState;
use super::SyncEvent;
use crate::model::{Mailbox, MailboxId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A running manager as seen by the reconciler and scheduler
///
/// The manager itself lives inside its task; the handle holds the poll
/// trigger, a shutdown signal and a view of the manager's state.
pub struct ManagerHandle {
    mailbox_id: MailboxId,
    fingerprint: u64,
    poll_interval: Duration,
    last_dispatch: Instant,
    poll_tx: mpsc::Sender<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<ManagerState>,
    task: JoinHandle<()>,
}

impl ManagerHandle {
    /// Start the manager's control loop on the runtime
    ///
    /// `poll_interval` already includes this manager's jitter.
    pub fn spawn(manager: MailboxManager, poll_interval: Duration) -> Self {
        let mailbox_id = manager.mailbox_id();
        let fingerprint = manager.mailbox().connection_fingerprint();
        let state_rx = manager.subscribe_state();

        // One slot: a trigger that arrives while a poll is queued is redundant
        let (poll_tx, poll_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(run(manager, poll_rx, shutdown_rx));

        Self {
            mailbox_id,
            fingerprint,
            poll_interval,
            last_dispatch: Instant::now(),
            poll_tx,
            shutdown_tx: Some(shutdown_tx),
            state_rx,
            task,
        }
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox_id
    }

    /// Connection fingerprint of the mailbox this manager was built from
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn matches(&self, mailbox: &Mailbox) -> bool {
        self.fingerprint == mailbox.connection_fingerprint()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_dispatch) >= self.poll_interval
    }

    /// Ask the manager to poll; false if a poll is already queued or the task is gone
    pub fn trigger_poll(&mut self, now: Instant) -> bool {
        match self.poll_tx.try_send(()) {
            Ok(()) => {
                self.last_dispatch = now;
                true
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                self.last_dispatch = now;
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Signal the control loop to disconnect and exit
    pub fn request_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Signal shutdown and wait up to `grace` for the task, aborting it after
    pub async fn stop(mut self, grace: Duration) {
        self.request_shutdown();
        let abort = self.task.abort_handle();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(mailbox_id = self.mailbox_id, "Manager task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                tracing::warn!(
                    mailbox_id = self.mailbox_id,
                    grace_secs = grace.as_secs_f64(),
                    "Manager did not stop in time, aborting"
                );
                abort.abort();
            }
        }
    }
}

/// Control loop: reconnect when disconnected, poll when triggered
async fn run(
    mut manager: MailboxManager,
    mut poll_rx: mpsc::Receiver<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mailbox_id = manager.mailbox_id();
    let ctx = manager.context().clone();
    ctx.emit(SyncEvent::ManagerStarted { mailbox_id });
    tracing::debug!(mailbox_id, "Manager task started");

    loop {
        if !manager.is_connected() {
            if manager.state().is_terminal() {
                break;
            }

            if let Some(deadline) = manager.retry_at() {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut shutdown_rx => break,
                }
                // Triggers that piled up while waiting are stale
                while poll_rx.try_recv().is_ok() {}
            }

            if let Err(e) = manager.connect().await {
                if manager.retry_at().is_none() && !manager.state().is_terminal() {
                    tracing::error!(mailbox_id, error = %e, "Manager cannot connect, stopping");
                    break;
                }
            }
            continue;
        }

        tokio::select! {
            trigger = poll_rx.recv() => match trigger {
                Some(()) => {
                    manager.poll_once().await;
                }
                None => break,
            },
            _ = &mut shutdown_rx => break,
        }
    }

    manager.disconnect().await;
    tracing::debug!(mailbox_id, state = %manager.state(), "Manager task stopped");
    ctx.emit(SyncEvent::ManagerStopped { mailbox_id });
}
