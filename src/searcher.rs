//! The retrieval orchestrator.
//!
//! `Searcher` ties the cache, rate budget, identity pool, block detector and
//! circuit breaker together around a caller-supplied browser driver. It is
//! safe for concurrent use; every shared structure carries its own lock and
//! all waits are bounded and deadline-checked.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::future;
use log::{debug, info, warn};
use serde::Serialize;
use url::Url;

use crate::budget::{Denied, Destination, DestinationRegistry, DestinationSnapshot};
use crate::cache::{cache_key, CacheStats, Claim, FlightGuard, ResultCache};
use crate::config::SearcherConfig;
use crate::detector::{self, FetchOutcome, FetchStatus};
use crate::driver::{BrowserDriver, FetchTarget, PageValidator};
use crate::error::SearchError;
use crate::identity::IdentityPool;
use crate::persist::{self, Checkpoint};
use crate::provision::Provisioner;

/// How a cached entry may be used for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve fresh cache hits; fetch and store on miss.
    Use,
    /// Ignore the cache entirely: no read, no store.
    Bypass,
    /// Fetch unconditionally and overwrite the cached entry.
    Refresh,
}

/// Where a returned page came from. Stale cache is always tagged so a
/// failure is never silently dressed up as a fresh success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Network,
    Cache,
    StaleCache,
}

/// Per-request options.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub cache_policy: CachePolicy,
    /// Serve an expired cache entry (tagged [`PageSource::StaleCache`]) if
    /// retrieval fails.
    pub stale_ok: bool,
    /// Absolute deadline; suspension points re-check it and fail with
    /// [`SearchError::DeadlineExceeded`] rather than sleeping past it.
    pub deadline: Option<Instant>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::Use,
            stale_ok: false,
            deadline: None,
        }
    }
}

impl FetchOptions {
    /// Set the deadline relative to now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// One retrieved result page.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub html: Arc<String>,
    pub page: u32,
    pub source: PageSource,
}

/// Result of a pagination run: every page that succeeded, plus the error
/// that interrupted the sequence, if any.
#[derive(Debug)]
pub struct PageRun {
    pub pages: Vec<SearchPage>,
    pub error: Option<SearchError>,
}

impl PageRun {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Observability snapshot, polled by external monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SearcherStats {
    pub destinations: HashMap<String, DestinationSnapshot>,
    pub cache: CacheStats,
}

enum FlightState {
    Leader(FlightGuard),
    Served(SearchPage),
}

/// Top-level retrieval API.
pub struct Searcher {
    config: SearcherConfig,
    base_url: Url,
    destination: String,
    registry: DestinationRegistry,
    pool: Arc<IdentityPool>,
    cache: Arc<ResultCache>,
    driver: Arc<dyn BrowserDriver>,
    validator: PageValidator,
}

impl Searcher {
    /// Create a searcher. Constructs the identity pool through the
    /// provisioner before returning.
    pub async fn new(
        config: SearcherConfig,
        driver: Arc<dyn BrowserDriver>,
        provisioner: Arc<dyn Provisioner>,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.search_url).context("invalid search_url")?;
        let destination = base_url
            .host_str()
            .context("search_url has no host")?
            .to_string();
        let pool = IdentityPool::new(config.pool.clone(), provisioner).await?;
        let registry = DestinationRegistry::new(&config);
        let cache = Arc::new(ResultCache::new(config.cache_ttl));

        Ok(Self {
            config,
            base_url,
            destination,
            registry,
            pool,
            cache,
            driver,
            validator: Arc::new(|_: &str| true),
        })
    }

    /// Replace the result-page validity predicate used by block detection.
    pub fn with_validator(mut self, validator: PageValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Retrieve one result page.
    pub async fn fetch(
        &self,
        query: &str,
        page: u32,
        options: &FetchOptions,
    ) -> Result<SearchPage, SearchError> {
        if deadline_passed(options.deadline) {
            return Err(SearchError::DeadlineExceeded);
        }
        let key = cache_key(query, page);

        // Hold a stale copy before lookups evict it, in case retrieval fails
        // and the caller opted into stale serving.
        let stale = if options.stale_ok {
            self.cache.peek(&key)
        } else {
            None
        };

        if options.cache_policy == CachePolicy::Use {
            if let Some(html) = self.cache.get(&key) {
                debug!("Cache hit for \"{query}\" page {page}");
                return Ok(SearchPage {
                    html,
                    page,
                    source: PageSource::Cache,
                });
            }
        }

        let _flight = if options.cache_policy == CachePolicy::Use {
            match self.join_flight(&key, page, options.deadline).await? {
                FlightState::Served(served) => return Ok(served),
                FlightState::Leader(guard) => Some(guard),
            }
        } else {
            None
        };

        match self.fetch_network(query, page, &key, options).await {
            Ok(fresh) => Ok(fresh),
            Err(err) => {
                if let Some(html) = stale {
                    warn!("Serving stale cache for \"{query}\" page {page}: {err}");
                    return Ok(SearchPage {
                        html,
                        page,
                        source: PageSource::StaleCache,
                    });
                }
                Err(err)
            }
        }
    }

    /// Retrieve pages 1..=`max_pages` sequentially. Stops at the first
    /// failure and returns the pages gathered so far alongside it.
    pub async fn fetch_pages(&self, query: &str, max_pages: u32, options: &FetchOptions) -> PageRun {
        let mut pages = Vec::new();
        for page in 1..=max_pages {
            match self.fetch(query, page, options).await {
                Ok(result) => pages.push(result),
                Err(err) => {
                    warn!(
                        "Pagination for \"{query}\" stopped at page {page} after {} pages: {err}",
                        pages.len()
                    );
                    return PageRun {
                        pages,
                        error: Some(err),
                    };
                }
            }
        }
        PageRun { pages, error: None }
    }

    /// Observability snapshot.
    pub fn stats(&self) -> SearcherStats {
        SearcherStats {
            destinations: self.registry.snapshot(),
            cache: self.cache.stats(),
        }
    }

    /// Drive a canary fetch through every identity concurrently, cooling
    /// down the ones that fail. Returns (healthy, total).
    pub async fn preflight(&self, canary_url: &str) -> anyhow::Result<(usize, usize)> {
        let url = Url::parse(canary_url).context("invalid canary URL")?;
        let identities = self.pool.identities();
        let total = identities.len();
        info!("Starting preflight over {total} identities");

        let checks = identities.into_iter().map(|identity| {
            let driver = Arc::clone(&self.driver);
            let target = FetchTarget {
                url: url.clone(),
                query: String::new(),
                page: 0,
            };
            async move {
                let healthy = match driver.fetch(&target, &identity).await {
                    Ok(response) => response.status < 400,
                    Err(err) => {
                        debug!("Preflight fetch failed via identity {}: {err:#}", identity.id);
                        false
                    }
                };
                (identity.id, healthy)
            }
        });

        let mut healthy = 0;
        for (id, ok) in future::join_all(checks).await {
            if ok {
                healthy += 1;
            } else {
                warn!("Identity {id} failed preflight, cooling down");
                self.pool.quarantine(id, self.config.pool.cooldown_base);
            }
        }
        info!("Preflight complete: {healthy}/{total} identities healthy");
        Ok((healthy, total))
    }

    /// Checkpoint cache entries and destination counters to disk.
    pub fn checkpoint_to(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let checkpoint = Checkpoint::capture(&self.cache, &self.registry);
        persist::save(path.as_ref(), &checkpoint)
    }

    /// Restore a checkpoint written by [`Searcher::checkpoint_to`]. Returns
    /// the number of cache entries restored.
    pub fn restore_from(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let checkpoint = persist::load(path.as_ref())?;
        Ok(checkpoint.apply(&self.cache, &self.registry))
    }

    /// Join the single-flight for a key: either take leadership of the fetch
    /// or wait for the current leader and serve its result from cache.
    async fn join_flight(
        &self,
        key: &str,
        page: u32,
        deadline: Option<Instant>,
    ) -> Result<FlightState, SearchError> {
        loop {
            match self.cache.claim(key) {
                Claim::Leader(guard) => return Ok(FlightState::Leader(guard)),
                Claim::Wait(notify) => {
                    // Bounded slices guard against a lost wakeup between the
                    // claim and the first poll of `notified`.
                    let wait = wait_slice(deadline, Duration::from_millis(250))?;
                    let _ = tokio::time::timeout(wait, notify.notified()).await;
                    if let Some(html) = self.cache.get(key) {
                        return Ok(FlightState::Served(SearchPage {
                            html,
                            page,
                            source: PageSource::Cache,
                        }));
                    }
                    // No result: the leader failed or is still running. Loop
                    // to re-claim (taking over the flight if it is free).
                }
            }
        }
    }

    /// The bounded retry loop around one physical page retrieval.
    async fn fetch_network(
        &self,
        query: &str,
        page: u32,
        key: &str,
        options: &FetchOptions,
    ) -> Result<SearchPage, SearchError> {
        let target = self.build_target(query, page);
        let dest = self.registry.destination(&self.destination);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;
        let mut hard_blocks: u32 = 0;

        loop {
            self.acquire_budget(&dest, hard_blocks > 0, options.deadline)
                .await?;

            let lease = match self.pool.lease(self.lease_wait(options.deadline)?).await {
                Ok(lease) => lease,
                Err(err) => {
                    return Err(if deadline_passed(options.deadline) {
                        SearchError::DeadlineExceeded
                    } else {
                        err
                    });
                }
            };
            let identity = lease.identity.clone();
            debug!(
                "Fetching \"{}\" page {} via identity {} (attempt {}/{})",
                query,
                page,
                identity.id,
                attempt + 1,
                max_attempts
            );

            let started = Instant::now();
            let (outcome, body) = match self.driver.fetch(&target, &identity).await {
                Ok(response) => {
                    let status = detector::classify(&response, self.validator.as_ref());
                    (
                        FetchOutcome {
                            status,
                            status_code: Some(response.status),
                            elapsed: response.elapsed,
                            identity_id: identity.id,
                        },
                        Some(response.body),
                    )
                }
                Err(err) => {
                    warn!("Transport failure via identity {}: {err:#}", identity.id);
                    (
                        FetchOutcome {
                            status: FetchStatus::Transport,
                            status_code: None,
                            elapsed: started.elapsed(),
                            identity_id: identity.id,
                        },
                        None,
                    )
                }
            };

            dest.release(outcome.status);
            self.pool.release(lease, outcome.status).await;
            attempt += 1;

            match outcome.status {
                FetchStatus::Success => {
                    let body = body.unwrap_or_default();
                    let html = if options.cache_policy == CachePolicy::Bypass {
                        Arc::new(body)
                    } else {
                        self.cache.put(key, body)
                    };
                    return Ok(SearchPage {
                        html,
                        page,
                        source: PageSource::Network,
                    });
                }
                FetchStatus::HardBlock => {
                    hard_blocks += 1;
                    if hard_blocks >= 2 || attempt >= max_attempts {
                        return Err(SearchError::RetrievalFailed {
                            destination: dest.name().to_string(),
                            attempts: attempt,
                            last: outcome,
                        });
                    }
                    // No extra backoff here: the circuit's own cool-down
                    // gates the retry in acquire_budget.
                }
                FetchStatus::SoftBlock | FetchStatus::Challenge | FetchStatus::Transport => {
                    if attempt >= max_attempts {
                        return Err(if outcome.status == FetchStatus::Transport {
                            SearchError::Transport {
                                destination: dest.name().to_string(),
                                attempts: attempt,
                                last: outcome,
                            }
                        } else {
                            SearchError::RetrievalFailed {
                                destination: dest.name().to_string(),
                                attempts: attempt,
                                last: outcome,
                            }
                        });
                    }
                    let delay = self.config.retry.delay_for(attempt - 1);
                    debug!("Backing off {delay:?} before attempt {}", attempt + 1);
                    sleep_within_deadline(delay, options.deadline).await?;
                }
            }
        }
    }

    /// Wait for rate budget, surfacing hard denials and open circuits
    /// immediately. After a hard block within this fetch, the circuit's
    /// cool-down is waited out instead so the one follow-up attempt can run.
    async fn acquire_budget(
        &self,
        dest: &Destination,
        after_hard_block: bool,
        deadline: Option<Instant>,
    ) -> Result<(), SearchError> {
        loop {
            match self.registry.try_acquire(dest) {
                Ok(()) => return Ok(()),
                Err(Denied::Soft(wait)) => {
                    debug!("Budget denied for {}, backing off {wait:?}", dest.name());
                    sleep_within_deadline(wait, deadline).await?;
                }
                Err(Denied::CircuitOpen(wait)) if after_hard_block => {
                    debug!(
                        "Waiting out circuit cool-down for {} ({wait:?}) before hard-block retry",
                        dest.name()
                    );
                    sleep_within_deadline(wait, deadline).await?;
                }
                Err(Denied::Hard(retry_after)) => {
                    return Err(SearchError::RateLimited {
                        destination: dest.name().to_string(),
                        retry_after,
                    });
                }
                Err(Denied::CircuitOpen(retry_after)) => {
                    return Err(SearchError::CircuitOpen {
                        destination: dest.name().to_string(),
                        retry_after,
                    });
                }
            }
        }
    }

    fn lease_wait(&self, deadline: Option<Instant>) -> Result<Duration, SearchError> {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SearchError::DeadlineExceeded);
                }
                Ok(self.config.lease_wait.min(deadline - now))
            }
            None => Ok(self.config.lease_wait),
        }
    }

    fn build_target(&self, query: &str, page: u32) -> FetchTarget {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(&self.config.query_param, query)
            .append_pair(&self.config.page_param, &page.to_string());
        FetchTarget {
            url,
            query: query.to_string(),
            page,
        }
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Sleep for `delay`, failing instead of sleeping past the deadline.
async fn sleep_within_deadline(
    delay: Duration,
    deadline: Option<Instant>,
) -> Result<(), SearchError> {
    if let Some(deadline) = deadline {
        if Instant::now() + delay >= deadline {
            return Err(SearchError::DeadlineExceeded);
        }
    }
    tokio::time::sleep(delay).await;
    Ok(())
}

/// Bound one wait slice by the deadline, failing once it has passed.
fn wait_slice(deadline: Option<Instant>, default: Duration) -> Result<Duration, SearchError> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(SearchError::DeadlineExceeded);
            }
            Ok(default.min(deadline - now))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_carry_query_and_page_parameters() {
        let config = SearcherConfig::builder()
            .search_url("https://search.example.com/serp")
            .build();
        let base_url = Url::parse(&config.search_url).unwrap();
        let mut url = base_url.clone();
        url.query_pairs_mut()
            .append_pair(&config.query_param, "dentists chicago")
            .append_pair(&config.page_param, "2");
        assert_eq!(
            url.as_str(),
            "https://search.example.com/serp?q=dentists+chicago&page=2"
        );
    }

    #[test]
    fn wait_slice_respects_deadline() {
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let slice = wait_slice(deadline, Duration::from_millis(250)).unwrap();
        assert!(slice <= Duration::from_millis(50));

        let expired = Some(Instant::now() - Duration::from_millis(1));
        assert!(wait_slice(expired, Duration::from_millis(250)).is_err());
    }
}
