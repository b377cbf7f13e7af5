//! Retry backoff and downstream health tracking.

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::{BackoffPolicy, RetryFamily, RetryPolicies};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
