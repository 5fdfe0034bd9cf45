//! Poll dispatch
//!
//! Managers do not run their own timers. The daemon ticks the scheduler,
//! which triggers every manager whose interval has elapsed. A trigger is a
//! single-slot channel send, so a manager that is still busy with the
//! previous poll simply absorbs it.

use super::reconciler::ManagedMailboxes;
use tokio::time::Instant;

pub struct PollScheduler {
    registry: ManagedMailboxes,
}

impl PollScheduler {
    pub fn new(registry: ManagedMailboxes) -> Self {
        Self { registry }
    }

    /// Trigger managers whose poll interval has elapsed
    ///
    /// Returns how many triggers were queued.
    pub async fn dispatch_due(&self) -> usize {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let mut dispatched = 0;
        for handle in registry.values_mut() {
            if handle.is_due(now) && handle.trigger_poll(now) {
                dispatched += 1;
            }
        }
        if dispatched > 0 {
            tracing::trace!(dispatched, "Dispatched polls");
        }
        dispatched
    }

    /// Trigger every manager regardless of its interval
    pub async fn poll_all(&self) -> usize {
        let now = Instant::now();
        let mut registry = self.registry.lock().await;
        let mut dispatched = 0;
        for handle in registry.values_mut() {
            if handle.trigger_poll(now) {
                dispatched += 1;
            }
        }
        tracing::debug!(dispatched, "Triggered poll on all managers");
        dispatched
    }
}
