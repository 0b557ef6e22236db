//! Circuit breaker for storage endpoints.
//!
//! Shields a failing endpoint from repeated traffic: after `threshold`
//! consecutive failures the circuit opens and calls are rejected without
//! touching the backend; after `cooldown` a single probe is let through
//! (half-open) and either closes the circuit again or re-opens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting requests until the cooldown elapses.
    Open,
    /// Cooldown elapsed, probing with live traffic.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Per-endpoint circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a request may be attempted right now. An open circuit whose
    /// cooldown has elapsed transitions to half-open and admits the call.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation, closing the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.failures = 0;
        inner.state = CircuitState::Closed;
    }

    /// Record a failed operation. Opens the circuit at the threshold, and
    /// immediately on a half-open probe failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen || inner.failures >= self.threshold {
            inner.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .state
    }

    pub fn failures(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .failures
    }

    /// Force the breaker back to closed. Used when an endpoint is promoted
    /// or re-enabled by an operator.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
    }
}
