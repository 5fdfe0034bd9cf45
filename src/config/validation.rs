//! Configuration validation
//!
//! Checks a mailsync configuration for values the daemon cannot run with:
//! - Empty instance id
//! - Zero intervals
//! - Backoff ceiling below its base
//! - Malformed notification endpoint or listen address

use super::mailsync_config::MailsyncConfig;
use crate::MailsyncError;

/// Validation error details
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validation result
pub type ValidationResult = std::result::Result<(), Vec<ValidationError>>;

/// Validate a mailsync configuration
pub fn validate_config(config: &MailsyncConfig) -> ValidationResult {
    let mut errors = Vec::new();

    if config.instance_id.trim().is_empty() {
        errors.push(ValidationError::new(
            "instance_id",
            "Instance id must not be empty",
        ));
    }

    if config.folder.trim().is_empty() {
        errors.push(ValidationError::new("folder", "Folder must not be empty"));
    }

    if config.poll.interval_secs == 0 {
        errors.push(ValidationError::new(
            "poll.interval_secs",
            "Poll interval must be greater than 0",
        ));
    }

    if config.poll.dispatch_tick_ms == 0 {
        errors.push(ValidationError::new(
            "poll.dispatch_tick_ms",
            "Dispatch tick must be greater than 0",
        ));
    } else if config.poll.dispatch_tick_ms > config.poll.interval_secs.saturating_mul(1000) {
        errors.push(ValidationError::new(
            "poll.dispatch_tick_ms",
            "Dispatch tick must not exceed the poll interval",
        ));
    }

    if config.reconcile_interval_secs == 0 {
        errors.push(ValidationError::new(
            "reconcile_interval_secs",
            "Reconcile interval must be greater than 0",
        ));
    }

    if config.backoff.base_secs == 0 {
        errors.push(ValidationError::new(
            "backoff.base_secs",
            "Backoff base must be greater than 0",
        ));
    }

    if config.backoff.max_secs < config.backoff.base_secs {
        errors.push(ValidationError::new(
            "backoff.max_secs",
            format!(
                "Backoff ceiling ({}) must be at least the base ({})",
                config.backoff.max_secs, config.backoff.base_secs
            ),
        ));
    }

    if config.backoff.multiplier.is_nan() || config.backoff.multiplier < 1.0 {
        errors.push(ValidationError::new(
            "backoff.multiplier",
            "Backoff multiplier must be at least 1.0",
        ));
    }

    if let Some(ref endpoint) = config.notifications.endpoint {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            errors.push(ValidationError::new(
                "notifications.endpoint",
                format!("Invalid URL '{}'. Must start with http:// or https://", endpoint),
            ));
        }
    }

    if config.notifications.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "notifications.timeout_secs",
            "Notification timeout must be greater than 0",
        ));
    }

    if config.api.listen.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "api.listen",
            format!("Invalid listen address '{}'", config.api.listen),
        ));
    }

    if config.protocol_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "protocol_timeout_secs",
            "Protocol timeout must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate configuration and return a crate error on failure
pub fn validate_config_result(config: &MailsyncConfig) -> crate::Result<()> {
    validate_config(config).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        MailsyncError::Config(format!(
            "Configuration validation failed:\n  - {}",
            messages.join("\n  - ")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&MailsyncConfig::new()).is_ok());
    }

    #[test]
    fn test_empty_instance_id() {
        let mut config = MailsyncConfig::new();
        config.instance_id = "  ".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "instance_id"));
    }

    #[test]
    fn test_backoff_ceiling_below_base() {
        let mut config = MailsyncConfig::new();
        config.backoff.base_secs = 30;
        config.backoff.max_secs = 10;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "backoff.max_secs"));
    }

    #[test]
    fn test_invalid_endpoint_and_listen() {
        let mut config = MailsyncConfig::new();
        config.notifications.endpoint = Some("hooks.example.com".to_string());
        config.api.listen = "localhost".to_string();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_dispatch_tick_longer_than_interval() {
        let mut config = MailsyncConfig::new();
        config.poll.interval_secs = 1;
        config.poll.dispatch_tick_ms = 5000;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "poll.dispatch_tick_ms"));
    }

    #[test]
    fn test_validate_config_result_message() {
        let mut config = MailsyncConfig::new();
        config.reconcile_interval_secs = 0;
        let err = validate_config_result(&config).unwrap_err();
        assert!(err
            .to_string()
            .contains("reconcile_interval_secs: Reconcile interval must be greater than 0"));
    }
}
