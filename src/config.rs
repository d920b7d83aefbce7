//! Configuration for the searcher.

use std::time::Duration;

use crate::circuit::CircuitConfig;
use crate::identity::PoolConfig;
use crate::retry::RetryPolicy;

/// Configuration for the searcher.
#[derive(Debug, Clone)]
pub struct SearcherConfig {
    /// Base SERP URL; query and page parameters are appended per request.
    pub search_url: String,
    /// Query-string parameter carrying the query text.
    pub query_param: String,
    /// Query-string parameter carrying the page index.
    pub page_param: String,
    /// Soft requests-per-minute ceiling per destination.
    pub soft_ceiling_per_minute: u32,
    /// Hard requests-per-minute ceiling per destination; never exceeded.
    pub hard_ceiling_per_minute: u32,
    /// Requests allowed above the steady soft rate, to absorb pagination.
    pub burst_allowance: u32,
    /// Requests-per-minute ceiling across all destinations. 0 disables it.
    pub global_ceiling_per_minute: u32,
    /// Identity pool sizing and rotation thresholds.
    pub pool: PoolConfig,
    /// Bounded wait for an identity to become available.
    pub lease_wait: Duration,
    /// Retry policy between fetch attempts.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
    /// TTL for cached result pages.
    pub cache_ttl: Duration,
}

impl SearcherConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SearcherConfigBuilder {
        SearcherConfigBuilder::new()
    }
}

impl Default for SearcherConfig {
    fn default() -> Self {
        SearcherConfigBuilder::new().build()
    }
}

/// Builder for `SearcherConfig`.
pub struct SearcherConfigBuilder {
    search_url: Option<String>,
    query_param: Option<String>,
    page_param: Option<String>,
    soft_ceiling_per_minute: Option<u32>,
    hard_ceiling_per_minute: Option<u32>,
    burst_allowance: Option<u32>,
    global_ceiling_per_minute: Option<u32>,
    pool_size: Option<usize>,
    max_requests_per_identity: Option<u64>,
    max_consecutive_failures: Option<u32>,
    identity_cooldown_base: Option<Duration>,
    identity_cooldown_max: Option<Duration>,
    lease_wait: Option<Duration>,
    retry: Option<RetryPolicy>,
    circuit: Option<CircuitConfig>,
    cache_ttl: Option<Duration>,
}

impl SearcherConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            search_url: None,
            query_param: None,
            page_param: None,
            soft_ceiling_per_minute: None,
            hard_ceiling_per_minute: None,
            burst_allowance: None,
            global_ceiling_per_minute: None,
            pool_size: None,
            max_requests_per_identity: None,
            max_consecutive_failures: None,
            identity_cooldown_base: None,
            identity_cooldown_max: None,
            lease_wait: None,
            retry: None,
            circuit: None,
            cache_ttl: None,
        }
    }

    /// Set the base SERP URL.
    pub fn search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = Some(url.into());
        self
    }

    /// Set the query-string parameter carrying the query text.
    pub fn query_param(mut self, param: impl Into<String>) -> Self {
        self.query_param = Some(param.into());
        self
    }

    /// Set the query-string parameter carrying the page index.
    pub fn page_param(mut self, param: impl Into<String>) -> Self {
        self.page_param = Some(param.into());
        self
    }

    /// Set the soft per-destination ceiling, in requests per minute.
    pub fn soft_ceiling_per_minute(mut self, ceiling: u32) -> Self {
        self.soft_ceiling_per_minute = Some(ceiling);
        self
    }

    /// Set the hard per-destination ceiling, in requests per minute.
    pub fn hard_ceiling_per_minute(mut self, ceiling: u32) -> Self {
        self.hard_ceiling_per_minute = Some(ceiling);
        self
    }

    /// Set the burst allowance above the steady soft rate.
    pub fn burst_allowance(mut self, burst: u32) -> Self {
        self.burst_allowance = Some(burst);
        self
    }

    /// Set the global ceiling across all destinations; 0 disables it.
    pub fn global_ceiling_per_minute(mut self, ceiling: u32) -> Self {
        self.global_ceiling_per_minute = Some(ceiling);
        self
    }

    /// Set the number of identities kept in the pool.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Set the per-identity request cap before retirement.
    pub fn max_requests_per_identity(mut self, max: u64) -> Self {
        self.max_requests_per_identity = Some(max);
        self
    }

    /// Set the consecutive-failure cap before retirement.
    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    /// Set the base identity cool-down after a failure.
    pub fn identity_cooldown_base(mut self, cooldown: Duration) -> Self {
        self.identity_cooldown_base = Some(cooldown);
        self
    }

    /// Set the cap on the exponential identity cool-down.
    pub fn identity_cooldown_max(mut self, cooldown: Duration) -> Self {
        self.identity_cooldown_max = Some(cooldown);
        self
    }

    /// Set the bounded wait for an identity lease.
    pub fn lease_wait(mut self, wait: Duration) -> Self {
        self.lease_wait = Some(wait);
        self
    }

    /// Set the retry policy between attempts.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the circuit breaker thresholds.
    pub fn circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = Some(config);
        self
    }

    /// Set the TTL for cached result pages.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SearcherConfig {
        let pool_defaults = PoolConfig::default();
        SearcherConfig {
            search_url: self
                .search_url
                .unwrap_or_else(|| "https://duckduckgo.com/html/".to_string()),
            query_param: self.query_param.unwrap_or_else(|| "q".to_string()),
            page_param: self.page_param.unwrap_or_else(|| "page".to_string()),
            soft_ceiling_per_minute: self.soft_ceiling_per_minute.unwrap_or(10),
            hard_ceiling_per_minute: self.hard_ceiling_per_minute.unwrap_or(20),
            burst_allowance: self.burst_allowance.unwrap_or(3),
            global_ceiling_per_minute: self.global_ceiling_per_minute.unwrap_or(120),
            pool: PoolConfig {
                size: self.pool_size.unwrap_or(pool_defaults.size),
                max_requests_per_identity: self
                    .max_requests_per_identity
                    .unwrap_or(pool_defaults.max_requests_per_identity),
                max_consecutive_failures: self
                    .max_consecutive_failures
                    .unwrap_or(pool_defaults.max_consecutive_failures),
                cooldown_base: self
                    .identity_cooldown_base
                    .unwrap_or(pool_defaults.cooldown_base),
                cooldown_max: self
                    .identity_cooldown_max
                    .unwrap_or(pool_defaults.cooldown_max),
            },
            lease_wait: self.lease_wait.unwrap_or(Duration::from_secs(10)),
            retry: self.retry.unwrap_or_default(),
            circuit: self.circuit.unwrap_or_default(),
            cache_ttl: self.cache_ttl.unwrap_or(Duration::from_secs(900)),
        }
    }
}

impl Default for SearcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
