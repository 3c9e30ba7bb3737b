//! Resilience patterns applied around a single step invocation.
//!
//! This module provides:
//! - [`RetryPolicy`] - configurable retry with exponential backoff and jitter
//! - [`run_with_timeout`] - per-step deadline enforcement over a cancellable
//!   future
//! - [`CircuitBreakerConfig`] / [`CircuitBreaker`] - fail-fast gate for a
//!   step's external dependency

mod circuit_breaker;
mod retry;
mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::{run_cancellable, run_with_timeout, TimeoutOutcome};
