//! Provisioning collaborators for identity construction.
//!
//! The pool draws proxy endpoints and user agents from a [`Provisioner`]
//! whenever it builds a fresh identity. [`StaticProvisioner`] serves
//! already-provisioned inventories round-robin; deployments with a dynamic
//! proxy vendor implement the trait themselves.

use async_trait::async_trait;
use parking_lot::Mutex;

/// Real browser user agents used when no custom inventory is supplied.
pub const BROWSER_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:132.0) Gecko/20100101 Firefox/132.0",
    // Firefox on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

/// Source of proxy endpoints and user agents for new identities.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn next_proxy(&self) -> anyhow::Result<String>;
    async fn next_user_agent(&self) -> anyhow::Result<String>;
}

/// Round-robin provisioner over fixed inventories.
pub struct StaticProvisioner {
    proxies: Vec<String>,
    user_agents: Vec<String>,
    cursors: Mutex<(usize, usize)>,
}

impl StaticProvisioner {
    /// Create a provisioner over the given proxy endpoints, using the
    /// built-in browser user-agent inventory.
    pub fn new(proxies: Vec<impl Into<String>>) -> Self {
        Self {
            proxies: proxies.into_iter().map(Into::into).collect(),
            user_agents: BROWSER_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            cursors: Mutex::new((0, 0)),
        }
    }

    /// Replace the user-agent inventory.
    pub fn with_user_agents(mut self, user_agents: Vec<impl Into<String>>) -> Self {
        self.user_agents = user_agents.into_iter().map(Into::into).collect();
        self
    }

    /// Build a provisioner from proxy-list text, one endpoint per line.
    pub fn from_proxy_list(content: &str) -> Self {
        Self::new(parse_proxy_list(content))
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn next_proxy(&self) -> anyhow::Result<String> {
        if self.proxies.is_empty() {
            anyhow::bail!("proxy inventory is empty");
        }
        let mut cursors = self.cursors.lock();
        let proxy = self.proxies[cursors.0 % self.proxies.len()].clone();
        cursors.0 += 1;
        Ok(proxy)
    }

    async fn next_user_agent(&self) -> anyhow::Result<String> {
        if self.user_agents.is_empty() {
            anyhow::bail!("user-agent inventory is empty");
        }
        let mut cursors = self.cursors.lock();
        let ua = self.user_agents[cursors.1 % self.user_agents.len()].clone();
        cursors.1 += 1;
        Ok(ua)
    }
}

/// Parse proxy-list text into endpoint URLs.
///
/// Accepts scheme-prefixed endpoints as-is and bare `host:port` lines as
/// SOCKS5; comments and blank lines are skipped.
pub fn parse_proxy_list(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                None
            } else if line.contains("://") {
                Some(line.to_string())
            } else if line.contains(':') {
                Some(format!("socks5://{line}"))
            } else {
                None
            }
        })
        .collect()
}
