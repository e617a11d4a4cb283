//! Three-state circuit breaker gating calls to failing dependencies.
//!
//! State machine: Closed -> Open after `failure_threshold` consecutive
//! failures; Open -> HalfOpen once `recovery_timeout` has elapsed;
//! HalfOpen -> Closed after `half_open_max_attempts` consecutive probe
//! successes, or back to Open on any probe failure.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

/// Observable view of the breaker, taken under the lock.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_at: None,
                half_open_inflight: 0,
                half_open_successes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// when the recovery timeout has elapsed and counts half-open probes
    /// against the in-flight cap.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    debug!(breaker = %self.name, "recovery timeout elapsed, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_inflight = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.config.half_open_max_attempts {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    debug!(breaker = %self.name, "probes succeeded, closing");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.half_open_inflight = 0;
                    inner.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, err: &str) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        error = err,
                        "failure threshold reached, opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, error = err, "probe failed, re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_inflight = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
            last_failure_at: inner.last_failure_at,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.half_open_inflight = 0;
        inner.half_open_successes = 0;
    }
}
