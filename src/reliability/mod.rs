//! Reliability primitives shared across the gateway: circuit breaker,
//! bounded retry, task supervision and debounced reloading.

pub mod breaker;
pub mod debounce;
pub mod retry;
pub mod supervisor;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use debounce::{DebounceConfig, DebouncedReloader};
pub use retry::{with_retry, RetryPolicy};
pub use supervisor::{Supervisor, TaskOutcome};
