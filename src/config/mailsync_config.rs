//! mailsync configuration file handling
//!
//! Loads and manages the ~/.config/mailsync/config.yaml file.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Poll cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Base interval between polls of one mailbox
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Upper bound of the random per-mailbox offset added to the interval
    #[serde(default = "default_poll_jitter")]
    pub jitter_secs: u64,

    /// How often the dispatcher checks which mailboxes are due
    #[serde(default = "default_dispatch_tick")]
    pub dispatch_tick_ms: u64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_poll_jitter() -> u64 {
    5
}

fn default_dispatch_tick() -> u64 {
    1000
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            jitter_secs: default_poll_jitter(),
            dispatch_tick_ms: default_dispatch_tick(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay. Off by default so delays
    /// follow base * 2^n exactly.
    #[serde(default)]
    pub jitter: bool,
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_max() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// New-message notifications
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook URL; notifications are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_notification_timeout")]
    pub timeout_secs: u64,
}

fn default_notification_timeout() -> u64 {
    10
}

/// Control-plane HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Serve the API alongside the sync daemon
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8086".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailsyncConfig {
    /// Shard identifier owned by this worker
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Folder used for mailboxes created without one
    #[serde(default = "default_folder")]
    pub folder: String,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub api: ApiConfig,

    /// How long shutdown waits for managers before aborting them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Consecutive parse failures before a message is skipped (0 never skips)
    #[serde(default = "default_max_parse_attempts")]
    pub max_parse_attempts: u32,

    /// Timeout for a single protocol command
    #[serde(default = "default_protocol_timeout")]
    pub protocol_timeout_secs: u64,
}

fn default_instance_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "mailsync-0".to_string())
}

fn default_database_path() -> PathBuf {
    let mut path = config_dir();
    path.push("mailsync.db");
    path
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_parse_attempts() -> u32 {
    5
}

fn default_protocol_timeout() -> u64 {
    60
}

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("mailsync");
    path
}

impl MailsyncConfig {
    /// Configuration with every field at its default
    pub fn new() -> Self {
        Self {
            instance_id: default_instance_id(),
            database_path: default_database_path(),
            folder: default_folder(),
            poll: PollConfig::default(),
            reconcile_interval_secs: default_reconcile_interval(),
            backoff: BackoffSettings::default(),
            notifications: NotificationConfig::default(),
            api: ApiConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
            max_parse_attempts: default_max_parse_attempts(),
            protocol_timeout_secs: default_protocol_timeout(),
        }
    }

    /// Load configuration from the default path (~/.config/mailsync/config.yaml)
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        Self::load(&path)
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::MailsyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading mailsync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            instance_id = %config.instance_id,
            poll_interval_secs = config.poll.interval_secs,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load from `path` if given, else the default path, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Self::default_path().exists() => Self::load_default(),
            None => Ok(Self::new()),
        }
    }

    /// Save configuration to the default path
    pub fn save_default(&self) -> Result<()> {
        let path = Self::default_path();
        self.save(&path)
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving mailsync configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/mailsync/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = config_dir();
        path.push("config.yaml");
        path
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_secs(self.poll.jitter_secs)
    }

    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.poll.dispatch_tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_secs(self.protocol_timeout_secs)
    }
}

impl Default for MailsyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
