//! Simple example of using serp-retriever.
//!
//! Runs the full control plane (budgeting, identity rotation, caching)
//! over a canned driver so it works offline. Swap in `HttpDriver` (or a
//! headless-browser driver) and real proxy endpoints for live retrieval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serp_retriever::{
    BrowserDriver, FetchOptions, FetchTarget, Identity, RawResponse, Searcher, SearcherConfig,
    StaticProvisioner,
};

/// Driver returning a canned result page after a short simulated round trip.
struct CannedDriver;

#[async_trait]
impl BrowserDriver for CannedDriver {
    async fn fetch(&self, target: &FetchTarget, identity: &Identity) -> anyhow::Result<RawResponse> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let body = format!(
            "<html><div id=\"results\">results for {} (page {}) via {}</div></html>",
            target.query, target.page, identity.user_agent
        );
        Ok(RawResponse {
            status: 200,
            body,
            elapsed: Duration::from_millis(50),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Initializing searcher...");

    let config = SearcherConfig::builder()
        .search_url("https://duckduckgo.com/html/")
        .soft_ceiling_per_minute(10)
        .hard_ceiling_per_minute(20)
        .pool_size(4)
        .cache_ttl(Duration::from_secs(300))
        .build();

    let provisioner = Arc::new(StaticProvisioner::new(vec![
        "socks5://10.0.0.1:1080",
        "socks5://10.0.0.2:1080",
        "socks5://10.0.0.3:1080",
    ]));

    let searcher = Searcher::new(config, Arc::new(CannedDriver), provisioner)
        .await?
        .with_validator(Arc::new(|body: &str| body.contains("id=\"results\"")));

    println!("Fetching...");
    let options = FetchOptions::default();
    let page = searcher.fetch("dentists chicago", 1, &options).await?;
    println!("Got {} bytes from {:?}", page.html.len(), page.source);

    // Second fetch is served from cache without touching the driver.
    let page = searcher.fetch("dentists chicago", 1, &options).await?;
    println!("Got {} bytes from {:?}", page.html.len(), page.source);

    println!(
        "Stats: {}",
        serde_json::to_string_pretty(&searcher.stats())?
    );

    Ok(())
}
