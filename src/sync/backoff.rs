//! Reconnect backoff
//!
//! Exponential delays with optional jitter, capped at a ceiling, plus the
//! retry classification used to decide whether a connection failure is worth
//! another attempt at all.

use crate::config::BackoffSettings;
use rand::Rng;
use std::time::Duration;

/// Configuration for backoff behavior
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base: Duration,

    /// Ceiling for any single delay
    pub max: Duration,

    /// Growth factor per consecutive failure (typically 2.0)
    pub multiplier: f64,

    /// Add up to 25% random jitter to prevent thundering herd (off by default)
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            base: Duration::from_secs(settings.base_secs),
            max: Duration::from_secs(settings.max_secs),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }
}

impl BackoffConfig {
    /// Deterministic config for tests and tight loops
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay for the given zero-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.max.as_secs_f64();
        let capped = raw.min(ceiling);

        let delayed = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..=0.25);
            (capped * jitter_factor).min(ceiling)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delayed).unwrap_or(self.max)
    }
}

/// Consecutive-failure counter for one connection
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return its attempt number (1-based) and delay
    pub fn next_delay(&mut self) -> (u32, Duration) {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        (self.attempt, delay)
    }

    /// Forget past failures after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}
