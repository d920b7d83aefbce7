//! Per-destination circuit breaker.
//!
//! Tracks a rolling window of fetch outcomes and stops traffic to a
//! destination once it is clearly defending itself. The breaker is driven
//! under the owning destination's lock; it holds no locks of its own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::detector::FetchStatus;

/// How long callers should wait before re-polling while a half-open probe is
/// already in flight.
const HALF_OPEN_RETRY: Duration = Duration::from_secs(1);

/// State of a destination's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Traffic flows normally.
    Closed,
    /// Traffic is stopped until the cool-down elapses.
    Open,
    /// One probe request is admitted to test the destination.
    HalfOpen,
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of recent outcomes considered when computing the failure rate.
    pub window_size: usize,
    /// Fraction of the window that must fail before the circuit trips.
    pub failure_threshold: f64,
    /// Cool-down after the first trip; doubles with each consecutive trip.
    pub cooldown_base: Duration,
    /// Cap on the exponential cool-down.
    pub cooldown_max: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            failure_threshold: 0.5,
            cooldown_base: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(600),
        }
    }
}

/// Per-destination failure-rate tracker with exponential trip cool-down.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    /// Rolling window of outcomes, `true` = success.
    window: VecDeque<bool>,
    /// When the circuit last tripped. Only meaningful while not Closed.
    opened_at: Instant,
    /// Consecutive trips without an intervening close.
    trips: u32,
    probe_inflight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: Instant::now(),
            trips: 0,
            probe_inflight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn trips(&self) -> u32 {
        self.trips
    }

    /// Non-mutating admission check.
    ///
    /// Returns the remaining cool-down while the circuit is open, or the
    /// re-poll interval while another probe holds the half-open slot. An open
    /// circuit whose cool-down has elapsed reports available; the transition
    /// itself happens in [`CircuitBreaker::on_grant`].
    pub fn availability(&self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooldown = self.cooldown();
                let elapsed = now.duration_since(self.opened_at);
                if elapsed >= cooldown {
                    Ok(())
                } else {
                    Err(cooldown - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_inflight {
                    Err(HALF_OPEN_RETRY)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Commit a granted request. Moves an elapsed open circuit to half-open
    /// and claims the probe slot for the caller.
    pub fn on_grant(&mut self, now: Instant) {
        match self.state {
            CircuitState::Open => {
                if now.duration_since(self.opened_at) >= self.cooldown() {
                    self.state = CircuitState::HalfOpen;
                    self.probe_inflight = true;
                }
            }
            CircuitState::HalfOpen => {
                self.probe_inflight = true;
            }
            CircuitState::Closed => {}
        }
    }

    /// Feed a completed fetch outcome into the breaker.
    pub fn record(&mut self, status: FetchStatus, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                self.probe_inflight = false;
                if status.is_success() {
                    self.close();
                } else {
                    self.trip(now);
                }
            }
            CircuitState::Closed => {
                self.push_outcome(status.is_success());
                if status == FetchStatus::HardBlock || self.failure_rate_exceeded() {
                    self.trip(now);
                }
            }
            // A fetch that was in flight when the circuit tripped; window
            // bookkeeping only.
            CircuitState::Open => {
                self.push_outcome(status.is_success());
            }
        }
    }

    fn push_outcome(&mut self, success: bool) {
        if self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn failure_rate_exceeded(&self) -> bool {
        let failures = self.window.iter().filter(|s| !**s).count();
        failures as f64 >= self.config.failure_threshold * self.config.window_size as f64
    }

    fn trip(&mut self, now: Instant) {
        self.trips += 1;
        self.opened_at = now;
        self.state = CircuitState::Open;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.trips = 0;
        self.window.clear();
    }

    fn cooldown(&self) -> Duration {
        let shift = self.trips.saturating_sub(1).min(16);
        self.config
            .cooldown_base
            .saturating_mul(1u32 << shift)
            .min(self.config.cooldown_max)
    }
}
