//! Per-destination rate budgets.
//!
//! Each destination carries a token bucket for the soft per-minute ceiling
//! (with a burst allowance to absorb pagination), an exact sliding 60 s
//! window for the hard ceiling, and its circuit breaker. Destinations are
//! created on first reference and live for the process lifetime; calls for
//! different destinations never contend on one another's lock.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use crate::config::SearcherConfig;
use crate::detector::FetchStatus;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// The hard ceiling is enforced over this rolling window.
const HARD_WINDOW: Duration = Duration::from_secs(60);

/// Why a budget request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// Soft ceiling (or the global ceiling) reached; back off and retry.
    Soft(Duration),
    /// Hard ceiling reached; the caller should reschedule, not spin.
    Hard(Duration),
    /// The destination's circuit is open.
    CircuitOpen(Duration),
}

/// Observability snapshot of one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationSnapshot {
    /// Budget grants issued.
    pub requests: u64,
    /// Non-success outcomes recorded.
    pub blocks: u64,
    /// Current circuit state.
    pub circuit: CircuitState,
}

struct DestinationState {
    /// Grant timestamps inside the hard window, oldest first.
    window: VecDeque<Instant>,
    requests: u64,
    blocks: u64,
    circuit: CircuitBreaker,
}

/// One rate-limiting domain.
pub struct Destination {
    name: String,
    soft: DirectLimiter,
    hard_ceiling: usize,
    state: Mutex<DestinationState>,
}

impl Destination {
    fn new(name: &str, soft_quota: Quota, hard_ceiling: usize, circuit: CircuitConfig) -> Self {
        Self {
            name: name.to_string(),
            soft: RateLimiter::direct(soft_quota),
            hard_ceiling,
            state: Mutex::new(DestinationState {
                window: VecDeque::new(),
                requests: 0,
                blocks: 0,
                circuit: CircuitBreaker::new(circuit),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking budget check: circuit first, then the hard window, then
    /// the soft token bucket. A grant is committed before the lock drops, so
    /// the hard window bound holds under arbitrary concurrency.
    pub fn try_acquire(&self, clock: &DefaultClock) -> Result<(), Denied> {
        let now = Instant::now();
        let mut state = self.state.lock();

        state
            .circuit
            .availability(now)
            .map_err(Denied::CircuitOpen)?;

        while state
            .window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HARD_WINDOW)
        {
            state.window.pop_front();
        }
        if state.window.len() >= self.hard_ceiling {
            let retry_after = state
                .window
                .front()
                .map(|t| (*t + HARD_WINDOW).saturating_duration_since(now))
                .unwrap_or_default();
            return Err(Denied::Hard(retry_after));
        }

        if let Err(not_until) = self.soft.check() {
            return Err(Denied::Soft(not_until.wait_time_from(clock.now())));
        }

        state.circuit.on_grant(now);
        state.window.push_back(now);
        state.requests += 1;
        Ok(())
    }

    /// Record the outcome of a granted fetch.
    pub fn release(&self, status: FetchStatus) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if !status.is_success() {
            state.blocks += 1;
        }
        let before = state.circuit.state();
        state.circuit.record(status, now);
        match (before, state.circuit.state()) {
            (b, CircuitState::Open) if b != CircuitState::Open => {
                warn!("Circuit for {} opened after {}", self.name, status);
            }
            (b, CircuitState::Closed) if b != CircuitState::Closed => {
                info!("Circuit for {} closed", self.name);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> DestinationSnapshot {
        let state = self.state.lock();
        DestinationSnapshot {
            requests: state.requests,
            blocks: state.blocks,
            circuit: state.circuit.state(),
        }
    }

    pub(crate) fn set_counters(&self, requests: u64, blocks: u64) {
        let mut state = self.state.lock();
        state.requests = requests;
        state.blocks = blocks;
    }
}

/// Concurrent map of destinations plus the global ceiling shared by all of
/// them.
pub struct DestinationRegistry {
    destinations: RwLock<HashMap<String, Arc<Destination>>>,
    soft_quota: Quota,
    hard_ceiling: usize,
    circuit: CircuitConfig,
    global: Option<DirectLimiter>,
    clock: DefaultClock,
}

impl DestinationRegistry {
    pub fn new(config: &SearcherConfig) -> Self {
        let soft = NonZeroU32::new(config.soft_ceiling_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_allowance).unwrap_or(NonZeroU32::MIN);
        let soft_quota = Quota::per_minute(soft).allow_burst(burst);
        let global = NonZeroU32::new(config.global_ceiling_per_minute)
            .map(|ceiling| RateLimiter::direct(Quota::per_minute(ceiling)));

        Self {
            destinations: RwLock::new(HashMap::new()),
            soft_quota,
            hard_ceiling: config.hard_ceiling_per_minute.max(1) as usize,
            circuit: config.circuit.clone(),
            global,
            clock: DefaultClock::default(),
        }
    }

    /// Look up a destination, creating it on first reference.
    pub fn destination(&self, name: &str) -> Arc<Destination> {
        if let Some(dest) = self.destinations.read().get(name) {
            return Arc::clone(dest);
        }
        let mut map = self.destinations.write();
        Arc::clone(map.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Destination::new(
                name,
                self.soft_quota,
                self.hard_ceiling,
                self.circuit.clone(),
            ))
        }))
    }

    /// Acquire budget for one fetch: the global ceiling first, then the
    /// destination's own circuit/hard/soft checks.
    pub fn try_acquire(&self, dest: &Destination) -> Result<(), Denied> {
        if let Some(global) = &self.global {
            if let Err(not_until) = global.check() {
                return Err(Denied::Soft(not_until.wait_time_from(self.clock.now())));
            }
        }
        dest.try_acquire(&self.clock)
    }

    pub fn snapshot(&self) -> HashMap<String, DestinationSnapshot> {
        self.destinations
            .read()
            .iter()
            .map(|(name, dest)| (name.clone(), dest.snapshot()))
            .collect()
    }

    pub(crate) fn restore_counters(&self, name: &str, requests: u64, blocks: u64) {
        self.destination(name).set_counters(requests, blocks);
    }
}
