//! Per-step deadline enforcement.
//!
//! The source this crate's step-retry/timeout model is grounded on relies on
//! cancellable futures checked at I/O points; ported to a systems language
//! that becomes: flip a cancellation flag and stop polling the step's
//! future. `run_with_timeout` races the step body against a sleep. If the
//! sleep wins, it flips `cancelled` (so a well-behaved body that already
//! polled `ctx.is_cancelled()` at its next checkpoint observes it) and then
//! drops the body future — the engine's side of "no thread-killing
//! primitives" (see DESIGN.md).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Outcome of racing a step body against its deadline (and, for
/// [`run_cancellable`], an instance-level cancel signal).
pub enum TimeoutOutcome<T> {
    Completed(T),
    TimedOut,
    /// The instance was cancelled while this step was in flight.
    Cancelled,
}

pub async fn run_with_timeout<F, T>(
    timeout: Duration,
    cancelled: &AtomicBool,
    fut: F,
) -> TimeoutOutcome<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        result = fut => TimeoutOutcome::Completed(result),
        _ = tokio::time::sleep(timeout) => {
            cancelled.store(true, Ordering::Relaxed);
            TimeoutOutcome::TimedOut
        }
    }
}

/// Like [`run_with_timeout`], but also races the step body against an
/// instance-level `cancel_signal`, so `Engine::cancel` propagates into an
/// in-flight step without waiting for its deadline to elapse.
pub async fn run_cancellable<F, T>(
    timeout: Duration,
    cancelled: &AtomicBool,
    cancel_signal: &Notify,
    fut: F,
) -> TimeoutOutcome<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        result = fut => TimeoutOutcome::Completed(result),
        _ = cancel_signal.notified() => {
            cancelled.store(true, Ordering::Relaxed);
            TimeoutOutcome::Cancelled
        }
        _ = tokio::time::sleep(timeout) => {
            cancelled.store(true, Ordering::Relaxed);
            TimeoutOutcome::TimedOut
        }
    }
}
