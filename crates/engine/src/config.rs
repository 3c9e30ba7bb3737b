//! Engine configuration
//!
//! Constructed via chained builder methods, mirroring this workspace's
//! `WorkerPoolConfig`/`ExecutorConfig` convention of a `Default` impl plus
//! `with_*` setters rather than a constructor with a dozen positional args.

use std::time::Duration;

/// What happens to instances found `Running`/`Compensating` when the engine
/// is constructed (e.g. after a process restart recovers persisted state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Move any in-flight instance to `Paused` and require an explicit
    /// `resume` call. Safe default: no step body is assumed idempotent.
    #[default]
    PauseOnStartup,
    /// Re-drive in-flight instances immediately from their next ready wave.
    /// Only safe if every step body tolerates at-least-once execution.
    ResumeOnStartup,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded worker pool size. Typical default: `max(10, 2 * num_cpus)`.
    pub worker_pool_size: usize,
    /// Backlog depth before `submit` blocks the caller (caller-runs
    /// backpressure, not drop-on-exhaustion).
    pub worker_backlog: usize,
    /// Bounded retry count for optimistic-concurrency `save_instance`
    /// conflicts before the enclosing transition surfaces the conflict.
    pub persistence_retry_max: u32,
    pub recovery_policy: RecoveryPolicy,
    /// Multiplier applied to the longest in-flight step's timeout to decide
    /// instance staleness in `health_check`.
    pub default_staleness_multiplier: f64,
    /// Interval between wave-loop scheduling ticks when waiting on in-flight
    /// steps; bounds how promptly pause/cancel signals are observed.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_pool_size: (2 * cpus).max(10),
            worker_backlog: 256,
            persistence_retry_max: 3,
            recovery_policy: RecoveryPolicy::PauseOnStartup,
            default_staleness_multiplier: 2.0,
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    pub fn with_worker_backlog(mut self, backlog: usize) -> Self {
        self.worker_backlog = backlog;
        self
    }

    pub fn with_persistence_retry_max(mut self, max: u32) -> Self {
        self.persistence_retry_max = max.max(1);
        self
    }

    pub fn with_recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery_policy = policy;
        self
    }

    pub fn with_default_staleness_multiplier(mut self, multiplier: f64) -> Self {
        self.default_staleness_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert!(cfg.worker_pool_size >= 10);
        assert_eq!(cfg.persistence_retry_max, 3);
        assert_eq!(cfg.recovery_policy, RecoveryPolicy::PauseOnStartup);
        assert_eq!(cfg.default_staleness_multiplier, 2.0);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = EngineConfig::new()
            .with_worker_pool_size(4)
            .with_recovery_policy(RecoveryPolicy::ResumeOnStartup);
        assert_eq!(cfg.worker_pool_size, 4);
        assert_eq!(cfg.recovery_policy, RecoveryPolicy::ResumeOnStartup);
    }
}
