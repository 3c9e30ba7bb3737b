//! Circuit breaker: an optional, available-but-not-mandated per-step
//! resilience primitive (a step's `StepOptions.circuit_breaker` is
//! `Option<CircuitBreakerConfig>`). The stateful gate below is a
//! single-process simplification of a distributed circuit breaker that
//! would otherwise share state across workers via the store; this engine
//! runs in one process, so the state lives in memory behind a
//! `parking_lot::Mutex`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls allowed.
    Closed,
    /// Failure threshold exceeded, calls rejected until `reset_timeout` elapses.
    Open,
    /// Probing whether the dependency recovered; a limited number of calls
    /// are allowed through before deciding to close or re-open.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Circuit breaker configuration.
///
/// # Example
///
/// ```
/// use workflow_engine::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` required to close the circuit.
    pub success_threshold: u32,
    /// Time to wait before transitioning `Open` -> `HalfOpen`.
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker is open")]
    Open,
}

struct State {
    circuit: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// A single step's circuit breaker instance. The coordinator keeps one of
/// these per step id that declares a `circuit_breaker` option, reused across
/// attempts and across instances of the same definition.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

/// A permit acquired from [`CircuitBreaker::allow`]; the caller must report
/// the outcome of the guarded call through `success()` or `failure()`. Carries
/// the clock passed to `allow()` so the failure timestamp it may record stays
/// on the same clock the breaker uses to judge `reset_timeout` elapsing.
pub struct CircuitBreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    clock: &'a dyn Clock,
}

impl<'a> CircuitBreakerPermit<'a> {
    pub fn success(self) {
        self.breaker.record_success();
    }

    pub fn failure(self) {
        self.breaker.record_failure(self.clock);
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                circuit: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    /// Attempt to acquire a permit for a call. `Open` circuits reject the
    /// call unless `reset_timeout` has elapsed, in which case the breaker
    /// moves to `HalfOpen` and allows a single probing call through.
    pub fn allow<'a>(&'a self, clock: &'a dyn Clock) -> Result<CircuitBreakerPermit<'a>, CircuitBreakerError> {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => Ok(CircuitBreakerPermit { breaker: self, clock }),
            CircuitState::HalfOpen => Ok(CircuitBreakerPermit { breaker: self, clock }),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| clock.now().signed_duration_since(opened))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    state.circuit = CircuitState::HalfOpen;
                    state.successes = 0;
                    drop(state);
                    Ok(CircuitBreakerPermit { breaker: self, clock })
                } else {
                    Err(CircuitBreakerError::Open)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => {
                state.failures = 0;
            }
            CircuitState::HalfOpen => {
                state.successes += 1;
                if state.successes >= self.config.success_threshold {
                    state.circuit = CircuitState::Closed;
                    state.failures = 0;
                    state.successes = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, clock: &dyn Clock) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(clock.now());
                }
            }
            CircuitState::HalfOpen => {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(clock.now());
                state.successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
