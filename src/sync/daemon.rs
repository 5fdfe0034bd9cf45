//! Sync daemon
//!
//! Owns the reconciler and the poll scheduler and drives both from a single
//! tokio event loop: a reconcile interval, a dispatch tick, a command
//! channel and (on Unix) SIGTERM/SIGINT for graceful shutdown.

use super::backoff::BackoffConfig;
use super::metrics;
use super::reconciler::{ManagedMailboxes, ManagerStatus, ReconcileReport, Reconciler};
use super::scheduler::PollScheduler;
use super::{SyncContext, SyncError, SyncEvent};
use crate::config::MailsyncConfig;
use crate::notify::NotificationSink;
use crate::parser::MessageParser;
use crate::protocol::MailClient;
use crate::store::Store;
use crate::{MailsyncError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

/// Default event channel capacity (1000 events)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Shard this instance serves
    pub instance_id: String,

    /// How often the registry is matched against the store
    pub reconcile_interval: Duration,

    /// How often due managers are triggered
    pub dispatch_tick: Duration,

    /// Base poll interval per mailbox
    pub poll_interval: Duration,

    /// Upper bound of the random offset added to each mailbox's interval
    pub poll_jitter: Duration,

    pub backoff: BackoffConfig,

    /// Wait for managers to log out before aborting them
    pub shutdown_grace: Duration,

    pub max_parse_attempts: u32,

    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instance_id: "mailsync-0".to_string(),
            reconcile_interval: Duration::from_secs(30),
            dispatch_tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(60),
            poll_jitter: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            shutdown_grace: Duration::from_secs(10),
            max_parse_attempts: 5,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl DaemonConfig {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &MailsyncConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            reconcile_interval: config.reconcile_interval(),
            dispatch_tick: config.dispatch_tick(),
            poll_interval: config.poll_interval(),
            poll_jitter: config.poll_jitter(),
            backoff: BackoffConfig::from(&config.backoff),
            shutdown_grace: config.shutdown_grace(),
            max_parse_attempts: config.max_parse_attempts,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick = tick;
        self
    }

    /// Set the poll interval and its jitter bound
    pub fn with_poll_interval(mut self, interval: Duration, jitter: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_jitter = jitter;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_parse_attempts(mut self, attempts: u32) -> Self {
        self.max_parse_attempts = attempts;
        self
    }
}

/// Commands that can be sent to a running daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Reconcile immediately instead of waiting for the interval
    ReconcileNow,

    /// Trigger a poll on every manager
    PollAllNow,

    /// Stop all managers and exit the loop
    Shutdown,
}

enum CommandResult {
    Continue,
    Stop,
}

/// Daemon statistics
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStats {
    pub instance_id: String,

    /// Managers currently registered
    pub managed: usize,

    /// Managers per lifecycle state
    pub by_state: BTreeMap<String, usize>,

    /// Mailboxes parked after rejected credentials
    pub parked: usize,

    pub reconcile_cycles: u64,

    pub last_reconcile_at: Option<DateTime<Utc>>,
}

/// The mailbox synchronization daemon
pub struct SyncDaemon {
    config: DaemonConfig,
    reconciler: Reconciler,
    scheduler: PollScheduler,
    event_tx: broadcast::Sender<SyncEvent>,
    command_rx: Option<mpsc::Receiver<DaemonCommand>>,
    command_tx: mpsc::Sender<DaemonCommand>,
    reconcile_cycles: u64,
    running: bool,
}

impl SyncDaemon {
    pub fn new(
        config: DaemonConfig,
        store: Arc<dyn Store>,
        client: Arc<dyn MailClient>,
        parser: Arc<dyn MessageParser>,
        notifier: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(10);

        let mut ctx = SyncContext::new(store, client, parser, event_tx.clone())
            .with_backoff(config.backoff.clone())
            .with_max_parse_attempts(config.max_parse_attempts);
        if let Some(notifier) = notifier {
            ctx = ctx.with_notifier(notifier);
        }

        let reconciler = Reconciler::new(config.instance_id.clone(), ctx)
            .with_poll_interval(config.poll_interval, config.poll_jitter)
            .with_stop_grace(config.shutdown_grace);
        let scheduler = PollScheduler::new(reconciler.registry());

        Self {
            config,
            reconciler,
            scheduler,
            event_tx,
            command_rx: Some(command_rx),
            command_tx,
            reconcile_cycles: 0,
            running: false,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Get a command sender
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// Registry of live managers, for the API
    pub fn registry(&self) -> ManagedMailboxes {
        self.reconciler.registry()
    }

    pub async fn statuses(&self) -> Vec<ManagerStatus> {
        self.reconciler.registry().statuses().await
    }

    pub async fn stats(&self) -> DaemonStats {
        let registry = self.reconciler.registry();
        let by_state = registry
            .state_counts()
            .await
            .into_iter()
            .map(|(state, count)| (state.to_string(), count))
            .collect();

        DaemonStats {
            instance_id: self.config.instance_id.clone(),
            managed: registry.len().await,
            by_state,
            parked: self.reconciler.parked().len(),
            reconcile_cycles: self.reconcile_cycles,
            last_reconcile_at: self.reconciler.last_reconcile_at(),
        }
    }

    /// Run one reconcile pass outside the event loop
    pub async fn reconcile_once(&mut self) -> std::result::Result<ReconcileReport, SyncError> {
        self.reconcile_cycles += 1;
        self.reconciler.reconcile().await
    }

    /// Trigger every manager outside the event loop
    pub async fn poll_all_now(&self) -> usize {
        self.scheduler.poll_all().await
    }

    /// Stop all managers without running the event loop
    pub async fn shutdown(&mut self) {
        self.running = false;
        self.cleanup().await;
    }

    async fn reconcile(&mut self) {
        self.reconcile_cycles += 1;
        if let Err(e) = self.reconciler.reconcile().await {
            // Registry left as is; the next interval retries
            tracing::error!(error = %e, "Reconcile failed");
        }
    }

    /// Run the daemon event loop with graceful shutdown on SIGTERM/SIGINT
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| MailsyncError::Config("Daemon already running".to_string()))?;

        self.running = true;
        metrics::set_health_status(true);
        tracing::info!(
            instance_id = %self.config.instance_id,
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Sync daemon started"
        );

        let mut reconcile_interval = tokio::time::interval(self.config.reconcile_interval);
        reconcile_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dispatch_tick = tokio::time::interval(self.config.dispatch_tick);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        #[cfg(unix)]
        {
            self.run_with_signals(&mut reconcile_interval, &mut dispatch_tick, &mut command_rx)
                .await?;
        }

        #[cfg(not(unix))]
        {
            self.run_without_signals(&mut reconcile_interval, &mut dispatch_tick, &mut command_rx)
                .await?;
        }

        tracing::info!("Performing shutdown cleanup");
        self.cleanup().await;

        metrics::set_health_status(false);
        tracing::info!(instance_id = %self.config.instance_id, "Sync daemon stopped");
        Ok(())
    }

    /// Run event loop with Unix signal handling (SIGTERM/SIGINT)
    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        reconcile_interval: &mut tokio::time::Interval,
        dispatch_tick: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            MailsyncError::Other(format!("Failed to set up SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            MailsyncError::Other(format!("Failed to set up SIGINT handler: {}", e))
        })?;

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    if self.running {
                        self.reconcile().await;
                    }
                }
                _ = dispatch_tick.tick() => {
                    if self.running {
                        self.scheduler.dispatch_due().await;
                    }
                }
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match self.handle_command(cmd).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    self.running = false;
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    self.running = false;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run event loop without signal handling (non-Unix platforms)
    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        reconcile_interval: &mut tokio::time::Interval,
        dispatch_tick: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    if self.running {
                        self.reconcile().await;
                    }
                }
                _ = dispatch_tick.tick() => {
                    if self.running {
                        self.scheduler.dispatch_due().await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
                    self.running = false;
                    break;
                }
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match self.handle_command(cmd).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: DaemonCommand) -> CommandResult {
        tracing::debug!(command = ?cmd, "Daemon command received");
        match cmd {
            DaemonCommand::ReconcileNow => {
                self.reconcile().await;
                CommandResult::Continue
            }
            DaemonCommand::PollAllNow => {
                self.scheduler.poll_all().await;
                CommandResult::Continue
            }
            DaemonCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                self.running = false;
                CommandResult::Stop
            }
        }
    }

    /// Stop every manager within the grace period
    async fn cleanup(&mut self) {
        self.reconciler.shutdown(self.config.shutdown_grace).await;
    }
}
