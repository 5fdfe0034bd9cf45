//! Configuration system
//!
//! Loads ~/.config/mailsync/config.yaml with support for:
//! - Instance identity (the shard this worker owns)
//! - Poll cadence and reconnect backoff
//! - Notification endpoint
//! - Control-plane API listener

mod mailsync_config;
pub mod validation;

pub use mailsync_config::{
    ApiConfig, BackoffSettings, MailsyncConfig, NotificationConfig, PollConfig,
};
pub use validation::{validate_config, validate_config_result, ValidationError};
