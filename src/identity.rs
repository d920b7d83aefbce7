//! Rotating browsing identities and the pool that leases them.
//!
//! An identity is one persona (user agent, locale, viewport, proxy
//! endpoint) used to make requests appear to come from a distinct client.
//! The pool leases the least-recently-used available identity so load
//! spreads evenly and no single persona accumulates a suspicious burst.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::detector::FetchStatus;
use crate::error::SearchError;
use crate::provision::Provisioner;

/// Viewport sizes drawn when constructing an identity.
const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1440, 900),
    (1536, 864),
    (2560, 1440),
];

/// Locale and matching timezone pairings drawn when constructing an identity.
const LOCALES: &[(&str, &str)] = &[
    ("en-US", "America/Chicago"),
    ("en-US", "America/New_York"),
    ("en-US", "America/Los_Angeles"),
    ("en-GB", "Europe/London"),
    ("en-CA", "America/Toronto"),
];

/// One rotating browsing persona.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Unique id, never reused within a process.
    pub id: u64,
    pub user_agent: String,
    pub locale: String,
    pub timezone: String,
    pub viewport: (u32, u32),
    /// Assigned proxy endpoint, e.g. `socks5://10.0.0.1:1080`.
    pub proxy: String,
    pub created_at: Instant,
    /// Cumulative requests made through this identity.
    pub request_count: u64,
    pub consecutive_failures: u32,
}

/// Pool sizing and rotation thresholds.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of identities kept alive.
    pub size: usize,
    /// Retire an identity after this many requests.
    pub max_requests_per_identity: u64,
    /// Retire an identity after this many consecutive failures.
    pub max_consecutive_failures: u32,
    /// Cool-down after the first failure; doubles per consecutive failure.
    pub cooldown_base: Duration,
    /// Cap on the exponential cool-down.
    pub cooldown_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 8,
            max_requests_per_identity: 50,
            max_consecutive_failures: 3,
            cooldown_base: Duration::from_secs(30),
            cooldown_max: Duration::from_secs(900),
        }
    }
}

#[derive(Debug)]
struct Slot {
    identity: Identity,
    leased: bool,
    cooldown_until: Option<Instant>,
    last_used: Instant,
}

impl Slot {
    fn available(&self, now: Instant) -> bool {
        !self.leased && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// Slot storage shared between the pool and outstanding leases.
#[derive(Debug)]
struct PoolCore {
    slots: Mutex<Vec<Slot>>,
    available: Notify,
}

/// A leased identity. Exactly one in-flight request may hold a given
/// identity; dropping the lease returns the slot without recording an
/// outcome (the cancelled-caller path).
pub struct IdentityLease {
    core: Arc<PoolCore>,
    /// Snapshot of the identity at lease time.
    pub identity: Identity,
    released: bool,
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        {
            let mut slots = self.core.slots.lock();
            if let Some(slot) = slots.iter_mut().find(|s| s.identity.id == self.identity.id) {
                slot.leased = false;
            }
        }
        self.core.available.notify_waiters();
    }
}

/// Pool of rotating identities with lease/release semantics.
pub struct IdentityPool {
    config: PoolConfig,
    provisioner: Arc<dyn Provisioner>,
    core: Arc<PoolCore>,
    next_id: AtomicU64,
}

impl IdentityPool {
    /// Create a pool and construct its initial identities through the
    /// provisioner.
    pub async fn new(
        config: PoolConfig,
        provisioner: Arc<dyn Provisioner>,
    ) -> anyhow::Result<Arc<Self>> {
        let pool = Arc::new(Self {
            config,
            provisioner,
            core: Arc::new(PoolCore {
                slots: Mutex::new(Vec::new()),
                available: Notify::new(),
            }),
            next_id: AtomicU64::new(1),
        });

        for _ in 0..pool.config.size {
            let identity = pool.build_identity().await?;
            pool.core.slots.lock().push(Slot {
                identity,
                leased: false,
                cooldown_until: None,
                last_used: Instant::now(),
            });
        }
        info!("Identity pool initialized with {} identities", pool.config.size);

        Ok(pool)
    }

    async fn build_identity(&self) -> anyhow::Result<Identity> {
        let proxy = self.provisioner.next_proxy().await?;
        let user_agent = self.provisioner.next_user_agent().await?;
        let (viewport, locale, timezone) = {
            let mut rng = rand::rng();
            let viewport = VIEWPORTS[rng.random_range(0..VIEWPORTS.len())];
            let (locale, timezone) = LOCALES[rng.random_range(0..LOCALES.len())];
            (viewport, locale.to_string(), timezone.to_string())
        };

        Ok(Identity {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_agent,
            locale,
            timezone,
            viewport,
            proxy,
            created_at: Instant::now(),
            request_count: 0,
            consecutive_failures: 0,
        })
    }

    /// Lease the least-recently-used available identity, waiting up to
    /// `max_wait` for one to free up or finish cooling down.
    pub async fn lease(&self, max_wait: Duration) -> Result<IdentityLease, SearchError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let next_wakeup = {
                let now = Instant::now();
                let mut slots = self.core.slots.lock();
                if let Some(slot) = slots
                    .iter_mut()
                    .filter(|s| s.available(now))
                    .min_by_key(|s| s.last_used)
                {
                    slot.leased = true;
                    slot.last_used = now;
                    slot.cooldown_until = None;
                    slot.identity.request_count += 1;
                    return Ok(IdentityLease {
                        core: Arc::clone(&self.core),
                        identity: slot.identity.clone(),
                        released: false,
                    });
                }
                slots
                    .iter()
                    .filter(|s| !s.leased)
                    .filter_map(|s| s.cooldown_until)
                    .min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(SearchError::NoIdentityAvailable);
            }
            let mut wait = deadline - now;
            if let Some(until) = next_wakeup {
                wait = wait
                    .min(until.saturating_duration_since(now))
                    .max(Duration::from_millis(1));
            }
            let _ = timeout(wait, self.core.available.notified()).await;
        }
    }

    /// Release a leased identity with the outcome of its fetch. Applies
    /// cool-down or retirement and constructs a replacement when needed.
    pub async fn release(&self, mut lease: IdentityLease, status: FetchStatus) {
        lease.released = true;
        let id = lease.identity.id;

        let retired = {
            let now = Instant::now();
            let mut slots = self.core.slots.lock();
            let Some(index) = slots.iter().position(|s| s.identity.id == id) else {
                return;
            };
            let slot = &mut slots[index];
            slot.leased = false;

            match status {
                FetchStatus::Success => {
                    slot.identity.consecutive_failures = 0;
                }
                FetchStatus::SoftBlock | FetchStatus::Challenge | FetchStatus::Transport => {
                    slot.identity.consecutive_failures += 1;
                    let cooldown = cooldown_for(
                        self.config.cooldown_base,
                        self.config.cooldown_max,
                        slot.identity.consecutive_failures,
                    );
                    slot.cooldown_until = Some(now + cooldown);
                    debug!(
                        "Identity {} cooling down for {:?} ({} consecutive failures)",
                        id, cooldown, slot.identity.consecutive_failures
                    );
                }
                FetchStatus::HardBlock => {}
            }

            let hard_blocked = status == FetchStatus::HardBlock;
            let failed_out =
                slot.identity.consecutive_failures >= self.config.max_consecutive_failures;
            let worn_out = slot.identity.request_count >= self.config.max_requests_per_identity;
            if hard_blocked || failed_out || worn_out {
                warn!(
                    "Identity {} retired after {} requests ({} consecutive failures, last outcome: {})",
                    id, slot.identity.request_count, slot.identity.consecutive_failures, status
                );
                slots.remove(index);
                true
            } else {
                false
            }
        };

        if retired {
            match self.build_identity().await {
                Ok(identity) => {
                    info!("Identity {} constructed to replace {}", identity.id, id);
                    self.core.slots.lock().push(Slot {
                        identity,
                        leased: false,
                        cooldown_until: None,
                        last_used: Instant::now(),
                    });
                }
                Err(err) => {
                    warn!("Failed to construct replacement identity: {err:#}");
                }
            }
        }
        self.core.available.notify_waiters();
    }

    /// Snapshot of every identity, leased or not.
    pub fn identities(&self) -> Vec<Identity> {
        self.core
            .slots
            .lock()
            .iter()
            .map(|s| s.identity.clone())
            .collect()
    }

    /// Put an identity into cool-down without recording an outcome. Used by
    /// preflight when a canary fetch fails.
    pub fn quarantine(&self, id: u64, cooldown: Duration) {
        let mut slots = self.core.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.identity.id == id) {
            slot.cooldown_until = Some(Instant::now() + cooldown);
        }
    }

    pub fn len(&self) -> usize {
        self.core.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cooldown_for(base: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    let shift = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}
