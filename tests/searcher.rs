//! End-to-end tests for the searcher over a scripted driver.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_test::assert_ok;
use serp_retriever::{
    BrowserDriver, CachePolicy, CircuitConfig, CircuitState, FetchOptions, FetchTarget, Identity,
    PageSource, RawResponse, RetryPolicy, SearchError, Searcher, SearcherConfig, StaticProvisioner,
};

const RESULT_BODY: &str = "<html><div id=\"results\"><a href=\"#\">hit</a></div></html>";

/// One scripted driver step.
enum Step {
    Respond {
        delay: Duration,
        status: u16,
        body: String,
    },
    Fail,
}

fn respond(status: u16) -> Step {
    Step::Respond {
        delay: Duration::ZERO,
        status,
        body: RESULT_BODY.to_string(),
    }
}

fn respond_slow(status: u16, delay: Duration) -> Step {
    Step::Respond {
        delay,
        status,
        body: RESULT_BODY.to_string(),
    }
}

fn respond_body(status: u16, body: &str) -> Step {
    Step::Respond {
        delay: Duration::ZERO,
        status,
        body: body.to_string(),
    }
}

/// Driver that plays back a script, then answers 200 with a valid page.
struct ScriptedDriver {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedDriver {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn fetch(&self, _target: &FetchTarget, _identity: &Identity) -> anyhow::Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Respond { delay, status, body }) => {
                tokio::time::sleep(delay).await;
                Ok(RawResponse {
                    status,
                    body,
                    elapsed: delay,
                })
            }
            Some(Step::Fail) => anyhow::bail!("connection reset by peer"),
            None => Ok(RawResponse {
                status: 200,
                body: RESULT_BODY.to_string(),
                elapsed: Duration::ZERO,
            }),
        }
    }
}

fn fast_config() -> SearcherConfig {
    SearcherConfig::builder()
        .search_url("https://search.example.com/serp")
        .soft_ceiling_per_minute(600)
        .hard_ceiling_per_minute(1000)
        .burst_allowance(600)
        .global_ceiling_per_minute(0)
        .pool_size(4)
        .identity_cooldown_base(Duration::from_millis(5))
        .identity_cooldown_max(Duration::from_millis(50))
        .lease_wait(Duration::from_millis(200))
        .retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            jitter: Duration::ZERO,
        })
        .circuit(CircuitConfig {
            window_size: 10,
            failure_threshold: 0.5,
            cooldown_base: Duration::from_millis(50),
            cooldown_max: Duration::from_millis(400),
        })
        .cache_ttl(Duration::from_secs(60))
        .build()
}

async fn searcher_with(config: SearcherConfig, driver: Arc<ScriptedDriver>) -> Searcher {
    let provisioner = Arc::new(StaticProvisioner::new(vec![
        "socks5://10.0.0.1:1080",
        "socks5://10.0.0.2:1080",
        "socks5://10.0.0.3:1080",
        "socks5://10.0.0.4:1080",
        "socks5://10.0.0.5:1080",
    ]));
    Searcher::new(config, driver, provisioner)
        .await
        .unwrap()
        .with_validator(Arc::new(|body: &str| body.contains("id=\"results\"")))
}

async fn searcher(driver: Arc<ScriptedDriver>) -> Searcher {
    searcher_with(fast_config(), driver).await
}

#[tokio::test]
async fn first_attempt_success_comes_from_the_network() {
    let driver = ScriptedDriver::new(vec![respond(200)]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let page = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(page.source, PageSource::Network);
    assert!(page.html.contains("id=\"results\""));
    assert_eq!(driver.calls(), 1);

    let stats = searcher.stats();
    let dest = &stats.destinations["search.example.com"];
    assert_eq!(dest.requests, 1);
    assert_eq!(dest.blocks, 0);
}

#[tokio::test]
async fn soft_blocks_are_retried_with_backoff() {
    let driver = ScriptedDriver::new(vec![respond(429), respond(429), respond(200)]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let started = Instant::now();
    let page = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(page.source, PageSource::Network);
    assert_eq!(driver.calls(), 3);
    // Two backoff sleeps: 20ms + 40ms.
    assert!(elapsed >= Duration::from_millis(60), "elapsed {elapsed:?}");

    let stats = searcher.stats();
    let dest = &stats.destinations["search.example.com"];
    assert_eq!(dest.requests, 3);
    assert_eq!(dest.blocks, 2);
}

#[tokio::test]
async fn concurrent_fetches_for_one_page_share_a_single_network_fetch() {
    let driver = ScriptedDriver::new(vec![respond_slow(200, Duration::from_millis(80))]);
    let searcher = Arc::new(searcher(Arc::clone(&driver)).await);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let searcher = Arc::clone(&searcher);
        handles.push(tokio::spawn(async move {
            searcher
                .fetch("dentists chicago", 1, &FetchOptions::default())
                .await
        }));
    }

    let mut bodies = Vec::new();
    for handle in handles {
        let page = handle.await.unwrap().unwrap();
        bodies.push(page.html);
    }

    assert_eq!(driver.calls(), 1);
    assert!(bodies.iter().all(|b| b.as_str() == bodies[0].as_str()));
    assert_eq!(searcher.stats().cache.hits, 2);
}

#[tokio::test]
async fn recurring_hard_block_surfaces_and_opens_the_circuit() {
    let driver = ScriptedDriver::new(vec![respond_body(403, "no"), respond_body(403, "no")]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let err = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    match err {
        SearchError::RetrievalFailed { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected RetrievalFailed, got {other}"),
    }
    assert_eq!(driver.calls(), 2);
    assert_eq!(
        searcher.stats().destinations["search.example.com"].circuit,
        CircuitState::Open
    );

    // While the circuit is open, new requests are refused immediately.
    let err = searcher
        .fetch("plumbers detroit", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::CircuitOpen { .. }), "got {err}");
    assert_eq!(driver.calls(), 2);
}

#[tokio::test]
async fn hard_ceiling_denial_is_surfaced_immediately() {
    let config = SearcherConfig::builder()
        .search_url("https://search.example.com/serp")
        .soft_ceiling_per_minute(600)
        .hard_ceiling_per_minute(2)
        .burst_allowance(600)
        .global_ceiling_per_minute(0)
        .pool_size(2)
        .lease_wait(Duration::from_millis(100))
        .retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        })
        .build();
    let driver = ScriptedDriver::new(Vec::new());
    let searcher = searcher_with(config, Arc::clone(&driver)).await;

    searcher
        .fetch("query one", 1, &FetchOptions::default())
        .await
        .unwrap();
    searcher
        .fetch("query two", 1, &FetchOptions::default())
        .await
        .unwrap();

    let err = searcher
        .fetch("query three", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    match err {
        SearchError::RateLimited { retry_after, .. } => {
            assert!(retry_after > Duration::ZERO);
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected RateLimited, got {other}"),
    }
    assert_eq!(driver.calls(), 2);
}

#[tokio::test]
async fn deadline_is_not_extended_by_backoff() {
    let driver = ScriptedDriver::new(vec![respond(429), respond(429), respond(429)]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let options = FetchOptions::default().with_timeout(Duration::from_millis(50));
    let err = searcher
        .fetch("dentists chicago", 1, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::DeadlineExceeded), "got {err}");
    // The third attempt's 40ms backoff would cross the deadline.
    assert!(driver.calls() < 3);
}

#[tokio::test]
async fn transport_failures_surface_after_retries() {
    let driver = ScriptedDriver::new(vec![Step::Fail, Step::Fail, Step::Fail]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let err = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    match err {
        SearchError::Transport { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(last.status_code.is_none());
        }
        other => panic!("expected Transport, got {other}"),
    }
    assert_eq!(driver.calls(), 3);
}

#[tokio::test]
async fn stale_cache_is_served_and_tagged_on_failure() {
    let mut config = fast_config();
    config.cache_ttl = Duration::from_millis(30);
    let driver = ScriptedDriver::new(vec![
        respond(200),
        respond_body(403, "no"),
        respond_body(403, "no"),
    ]);
    let searcher = searcher_with(config, Arc::clone(&driver)).await;

    let fresh = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(fresh.source, PageSource::Network);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let options = FetchOptions {
        stale_ok: true,
        ..FetchOptions::default()
    };
    let page = searcher.fetch("dentists chicago", 1, &options).await.unwrap();
    assert_eq!(page.source, PageSource::StaleCache);
    assert_eq!(page.html.as_str(), fresh.html.as_str());

    // Without stale_ok the same failure surfaces.
    let err = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::CircuitOpen { .. }), "got {err}");
}

#[tokio::test]
async fn pagination_returns_partial_results_with_the_first_failure() {
    let driver = ScriptedDriver::new(vec![
        respond(200),
        respond(429),
        respond(429),
        respond(429),
    ]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let run = searcher
        .fetch_pages("dentists chicago", 3, &FetchOptions::default())
        .await;
    assert_eq!(run.pages.len(), 1);
    assert_eq!(run.pages[0].page, 1);
    assert!(!run.is_complete());
    assert!(matches!(
        run.error,
        Some(SearchError::RetrievalFailed { attempts: 3, .. })
    ));
    assert_eq!(driver.calls(), 4);
}

#[tokio::test]
async fn bypass_policy_skips_reads_and_writes() {
    let driver = ScriptedDriver::new(Vec::new());
    let searcher = searcher(Arc::clone(&driver)).await;

    let options = FetchOptions {
        cache_policy: CachePolicy::Bypass,
        ..FetchOptions::default()
    };
    searcher.fetch("dentists chicago", 1, &options).await.unwrap();
    searcher.fetch("dentists chicago", 1, &options).await.unwrap();
    assert_eq!(driver.calls(), 2);
    assert_eq!(searcher.stats().cache.hits, 0);
    assert_eq!(searcher.stats().cache.size, 0);
}

#[tokio::test]
async fn refresh_policy_overwrites_the_cached_entry() {
    let v1 = "<html><div id=\"results\">version one</div></html>";
    let v2 = "<html><div id=\"results\">version two</div></html>";
    let driver = ScriptedDriver::new(vec![respond_body(200, v1), respond_body(200, v2)]);
    let searcher = searcher(Arc::clone(&driver)).await;

    let first = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(first.html.as_str(), v1);

    let refreshed = searcher
        .fetch(
            "dentists chicago",
            1,
            &FetchOptions {
                cache_policy: CachePolicy::Refresh,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(refreshed.html.as_str(), v2);

    let cached = searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(cached.source, PageSource::Cache);
    assert_eq!(cached.html.as_str(), v2);
    assert_eq!(driver.calls(), 2);
}

#[tokio::test]
async fn exhausted_pool_fails_with_no_identity_available() {
    let config = SearcherConfig::builder()
        .search_url("https://search.example.com/serp")
        .soft_ceiling_per_minute(600)
        .hard_ceiling_per_minute(1000)
        .burst_allowance(600)
        .global_ceiling_per_minute(0)
        .pool_size(1)
        .lease_wait(Duration::from_millis(30))
        .retry(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: Duration::ZERO,
        })
        .build();
    let driver = ScriptedDriver::new(vec![
        respond_slow(200, Duration::from_millis(120)),
        respond_slow(200, Duration::from_millis(120)),
    ]);
    let searcher = Arc::new(searcher_with(config, Arc::clone(&driver)).await);

    let slow = {
        let searcher = Arc::clone(&searcher);
        tokio::spawn(async move {
            searcher
                .fetch("query one", 1, &FetchOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The only identity is leased to the in-flight fetch; this one times out.
    let err = searcher
        .fetch("query two", 1, &FetchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::NoIdentityAvailable), "got {err}");

    assert!(slow.await.unwrap().is_ok());
}

#[tokio::test]
async fn preflight_reports_healthy_identities() {
    let driver = ScriptedDriver::new(Vec::new());
    let searcher = searcher(Arc::clone(&driver)).await;

    let (healthy, total) =
        tokio_test::assert_ok!(searcher.preflight("https://search.example.com/").await);
    assert_eq!(healthy, 4);
    assert_eq!(total, 4);
    assert_eq!(driver.calls(), 4);
}

#[tokio::test]
async fn checkpoint_survives_a_process_restart() {
    let driver = ScriptedDriver::new(vec![respond(200)]);
    let searcher = searcher(Arc::clone(&driver)).await;
    searcher
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("searcher.json");
    searcher.checkpoint_to(&path).unwrap();

    // "Restart": a fresh searcher restores cache and counters from disk.
    let driver2 = ScriptedDriver::new(Vec::new());
    let restored = searcher_with(fast_config(), Arc::clone(&driver2)).await;
    assert_eq!(restored.restore_from(&path).unwrap(), 1);

    let page = restored
        .fetch("dentists chicago", 1, &FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(page.source, PageSource::Cache);
    assert_eq!(driver2.calls(), 0);

    let stats = restored.stats();
    assert_eq!(stats.destinations["search.example.com"].requests, 1);
}
