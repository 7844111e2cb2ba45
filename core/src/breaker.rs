//! Circuit breaker guarding the verification provider.
//!
//! Explicit, injected state with a clock dependency — never a
//! process-wide singleton. Opens after a run of transient failures,
//! half-opens after a cooldown, closes on the first success.

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed. Moves Open -> HalfOpen once the
    /// cooldown has elapsed; the half-open probe call is allowed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = match self.opened_at {
                    Some(opened) => {
                        self.clock.now() - opened >= Duration::seconds(self.config.cooldown_secs)
                    }
                    None => true,
                };
                if cooled {
                    self.state = CircuitState::HalfOpen;
                }
                cooled
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.first_failure_at = None;
        self.opened_at = None;
    }

    /// Record a transient provider failure. Returns true when this
    /// failure tripped the breaker open.
    pub fn record_failure(&mut self) -> bool {
        let now = self.clock.now();

        // A half-open probe that fails re-opens immediately.
        if self.state == CircuitState::HalfOpen {
            self.open(now);
            return true;
        }

        // Failures outside the window start a fresh run.
        let window = Duration::seconds(self.config.failure_window_secs);
        match self.first_failure_at {
            Some(first) if now - first <= window => self.consecutive_failures += 1,
            _ => {
                self.first_failure_at = Some(now);
                self.consecutive_failures = 1;
            }
        }

        if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.config.failure_threshold
        {
            self.open(now);
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }
}
