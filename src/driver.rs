//! Collaborator seams: the browser driver that performs physical fetches and
//! the validity predicate callers supply for result pages.
//!
//! The core never manages a browser or HTTP stack itself; it hands an
//! [`Identity`] to a [`BrowserDriver`] and classifies whatever comes back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use url::Url;

use crate::identity::Identity;

/// One resolved fetch: the URL to retrieve plus the query/page it stands for.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    /// Fully built SERP URL.
    pub url: Url,
    /// Query text the URL was built from.
    pub query: String,
    /// Requested page index.
    pub page: u32,
}

/// Raw result of one physical fetch attempt.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP-like status code.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Time the fetch took.
    pub elapsed: Duration,
}

/// Caller-supplied predicate deciding whether a body looks like a genuine
/// result page. Used by the detector's content heuristic; page parsing itself
/// stays outside this crate.
pub type PageValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Performs one physical fetch using the given identity's proxy, user agent
/// and locale. Transport-level failures are reported as errors; any response
/// that arrived, whatever its status code, is returned as [`RawResponse`].
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn fetch(&self, target: &FetchTarget, identity: &Identity) -> anyhow::Result<RawResponse>;
}

/// Default driver: a plain HTTP client built per identity.
///
/// Builds a fresh `reqwest::Client` for every fetch so the proxy endpoint,
/// user agent and locale always match the leased identity. Headless-browser
/// drivers can replace this by implementing [`BrowserDriver`] themselves.
pub struct HttpDriver {
    timeout: Duration,
}

impl HttpDriver {
    /// Create a driver with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl BrowserDriver for HttpDriver {
    async fn fetch(&self, target: &FetchTarget, identity: &Identity) -> anyhow::Result<RawResponse> {
        let started = Instant::now();

        let proxy = reqwest::Proxy::all(&identity.proxy)
            .with_context(|| format!("invalid proxy endpoint {}", identity.proxy))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(&identity.user_agent)
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")?;

        let response = client
            .get(target.url.clone())
            .header("Accept-Language", format!("{},en;q=0.9", identity.locale))
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}
