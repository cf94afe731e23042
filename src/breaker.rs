//! Circuit breakers guarding the external services.
//!
//! One breaker per service, created at startup and shared process-wide.
//! `closed` passes calls through and counts consecutive failures; hitting
//! the threshold opens the breaker for a cooldown, during which calls fail
//! fast. After the cooldown a single probe is admitted; its outcome decides
//! between closing again and another full cooldown.

use std::sync::Mutex;
use std::time::Instant;

use crate::prelude::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// A single service's breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cooldown,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Ask permission to place a call. `Err` carries the remaining cooldown
    /// to surface as a `Retry-After` hint.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("lock poisoned");
        match *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    debug!(breaker = self.name, "breaker half-open, admitting probe");
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
            // A probe is already in flight; keep failing fast until it
            // reports back.
            State::HalfOpen => Err(self.cooldown),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        if !matches!(*state, State::Closed { consecutive_failures: 0 }) {
            debug!(breaker = self.name, "breaker closed");
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        breaker = self.name,
                        failures, "failure threshold reached, breaker open"
                    );
                    *state = State::Open {
                        until: Instant::now() + self.cooldown,
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            State::HalfOpen => {
                warn!(breaker = self.name, "probe failed, breaker open again");
                *state = State::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }

    /// Human-readable state, for the health probe.
    pub fn state_name(&self) -> &'static str {
        match *self.state.lock().expect("lock poisoned") {
            State::Closed { .. } => "closed",
            State::Open { .. } => "open",
            State::HalfOpen => "half_open",
        }
    }
}

/// The process-wide set of breakers, one per external service.
#[derive(Debug)]
pub struct BreakerRegistry {
    pub ocr: Arc<CircuitBreaker>,
    pub llm: Arc<CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            ocr: Arc::new(CircuitBreaker::new("ocr", failure_threshold, cooldown)),
            llm: Arc::new(CircuitBreaker::new("llm", failure_threshold, cooldown)),
        }
    }

    /// Snapshot of every breaker's state, for `/healthz`.
    pub fn snapshot(&self) -> Value {
        json!({
            "ocr": self.ocr.state_name(),
            "llm": self.llm.state_name(),
        })
    }
}
