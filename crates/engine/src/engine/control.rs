//! Per-instance runtime control state: the in-memory half of pause/cancel
//! that complements the persisted `Instance.status`/`cancel_requested`
//! fields. A flag flip here is observed by the wave loop at its next
//! checkpoint and by any in-flight step via [`crate::resilience::run_cancellable`];
//! neither primitive kills a task outright (see DESIGN.md).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Control surface for one running instance, held by the [`super::Engine`]
/// for the lifetime of its `drive` task.
pub struct InstanceControl {
    pause_requested: AtomicBool,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
}

impl InstanceControl {
    pub fn new() -> Self {
        Self {
            pause_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// Flips the cancel flag and wakes every step currently racing
    /// [`crate::resilience::run_cancellable`] against `cancel_notify`.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn cancel_notify(&self) -> &Notify {
        &self.cancel_notify
    }
}

impl Default for InstanceControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pause_flag_round_trips() {
        let control = InstanceControl::new();
        assert!(!control.is_pause_requested());
        control.request_pause();
        assert!(control.is_pause_requested());
        control.clear_pause();
        assert!(!control.is_pause_requested());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let control = Arc::new(InstanceControl::new());
        let waiter = Arc::clone(&control);
        let handle = tokio::spawn(async move {
            waiter.cancel_notify().notified().await;
        });

        // Give the spawned task a chance to register as a waiter before
        // notify_waiters fires; notify_waiters only wakes futures already
        // polled at least once.
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.request_cancel();

        handle.await.unwrap();
        assert!(control.is_cancel_requested());
    }
}
