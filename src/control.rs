//! Cooperative cancellation for long migration runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable handle shared between the orchestrator and whoever may stop it.
///
/// Cancelling never interrupts a record mid-transition; the orchestrator checks
/// the flag before each record and at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct MigrationControl {
    shared: Arc<Shared>,
}

impl MigrationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = notified => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn clones_share_cancellation() {
        let control = MigrationControl::new();
        let handle = control.clone();
        assert!(!control.is_cancelled());
        handle.cancel();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let control = MigrationControl::new();
        assert!(control.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let control = MigrationControl::new();
        let handle = control.clone();
        let started = Instant::now();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        assert!(!control.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn sleep_after_cancel_returns_immediately() {
        let control = MigrationControl::new();
        control.cancel();
        assert!(!control.sleep(Duration::from_secs(30)).await);
    }
}
