//! Mailbox manager lifecycle states

use serde::Serialize;

/// Lifecycle state of one mailbox manager
///
/// `Idle` covers both "not yet connected" and "connected, waiting for the
/// next poll"; the manager's session slot tells the two apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ManagerState {
    Idle,
    Connecting,
    Authenticated,
    Polling,
    Backoff { attempt: u32, delay_ms: u64 },
    Terminated,
}

impl ManagerState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: &ManagerState) -> bool {
        use ManagerState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Polling)
                | (Connecting, Authenticated)
                | (Connecting, Backoff { .. })
                | (Connecting, Terminated)
                | (Authenticated, Polling)
                | (Authenticated, Idle)
                | (Authenticated, Backoff { .. })
                | (Authenticated, Terminated)
                | (Polling, Idle)
                | (Polling, Backoff { .. })
                | (Backoff { .. }, Connecting)
                | (Backoff { .. }, Idle)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ManagerState::Terminated)
    }

    /// Short label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ManagerState::Idle => "idle",
            ManagerState::Connecting => "connecting",
            ManagerState::Authenticated => "authenticated",
            ManagerState::Polling => "polling",
            ManagerState::Backoff { .. } => "backoff",
            ManagerState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Backoff { attempt, delay_ms } => {
                write!(f, "backoff (attempt {}, {}ms)", attempt, delay_ms)
            }
            other => f.write_str(other.name()),
        }
    }
}
