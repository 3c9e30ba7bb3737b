//! Bounded in-process worker pool: semaphore-limited concurrency for step
//! dispatch, a single-process simplification of a `WorkerPool`/
//! `BackpressureState` pair (distributed claim/poll/heartbeat loops have no
//! counterpart in a single-process coordinator). Backpressure here is
//! "caller-runs": `submit` blocks on `Semaphore::acquire` rather than
//! rejecting or dropping work, matching the pool-exhaustion requirement.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Worker pool configuration. `pool_size` bounds concurrent step dispatch;
/// `backlog` bounds how many callers may be queued on the semaphore before
/// `submit` itself is considered backed up (tracked for `health_check`/
/// metrics, not enforced as a hard cap — the pool never sheds work).
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    pub backlog: usize,
}

impl WorkerPoolConfig {
    pub fn new(pool_size: usize, backlog: usize) -> Self {
        Self {
            pool_size: pool_size.max(1),
            backlog,
        }
    }
}

/// A semaphore-bounded dispatcher. Futures passed to [`WorkerPool::run`] are
/// awaited inline (never `tokio::spawn`ed) so step bodies may borrow from the
/// caller's stack, as `StepContext<'_>` does; concurrency is bounded purely
/// by how many permits are outstanding at once.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            config,
        }
    }

    pub fn config(&self) -> WorkerPoolConfig {
        self.config
    }

    /// Number of steps that could start immediately without blocking.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `fut` to completion under a pool permit, blocking the caller
    /// (not rejecting) if the pool is saturated.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("worker pool semaphore is never closed");
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_executes_future_and_releases_permit() {
        let pool = WorkerPool::new(WorkerPoolConfig::new(2, 0));
        let result = pool.run(async { 1 + 1 }).await;
        assert_eq!(result, 2);
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn bounds_concurrency_to_pool_size() {
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig::new(2, 0)));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(async {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
