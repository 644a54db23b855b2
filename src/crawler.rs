//! The crawl runtime: a worker pool draining the frontier and streaming
//! typed results to the consumer.
//!
//! A run moves `Idle → Running → Stopping → Stopped`. The result stream is a
//! bounded channel; a slow consumer applies backpressure to the workers, and
//! the stream closes exactly once, when the run reaches `Stopped`.

use crate::config::EngineConfigSpec;
use crate::error::{Error, Result};
use crate::fetcher::{FetchPolicy, FetchResult, Fetcher};
use crate::frontier::{Frontier, FrontierItem, FrontierLimits, ItemKind};
use crate::lock_ignoring_poison;
use crate::robots::RobotsCache;
use crate::stats::CrawlStats;
use futures::future::join_all;
use mime::Mime;
use reqwest::Url;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

// Default configuration constants.
const MAX_DEPTH: usize = 5;
const MAX_PAGES: usize = 15;
const MAX_CONCURRENCY: usize = 8;
const RESULT_BUFFER: usize = 64;

/// Run-level configuration for one crawl.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub start_url: String,
    pub allowed_domains: Vec<String>,
    pub max_pages: usize,
    pub max_depth: usize,
    pub max_assets: Option<usize>,
    pub max_concurrency: usize,
    pub request_delay: Duration,
    pub timeout: Duration,
    pub respect_robots: bool,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        let policy = FetchPolicy::default();

        Self {
            start_url: String::new(),
            allowed_domains: Vec::new(),
            max_pages: MAX_PAGES,
            max_depth: MAX_DEPTH,
            max_assets: None,
            max_concurrency: MAX_CONCURRENCY,
            request_delay: policy.request_delay,
            timeout: policy.timeout,
            respect_robots: policy.respect_robots,
        }
    }
}

/// Which processing path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// HTML page fetch + link discovery.
    Crawl,
    /// Embedded asset retrieval.
    Asset,
}

/// One emitted result; per-URL failures appear here instead of aborting the run.
#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub url: Url,
    pub stage: Stage,
    pub success: bool,
    pub status_code: Option<u16>,
    pub page: Option<FetchResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Builder pattern for `Crawler`. Allows for customizable configurations.
pub struct CrawlerBuilder {
    config: ScraperConfig,
    policy: FetchPolicy,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerBuilder {
    /// Initializes a new builder with default configuration.
    pub fn new() -> Self {
        CrawlerBuilder {
            config: ScraperConfig::default(),
            policy: FetchPolicy::default(),
        }
    }

    /// Seed URL handed to the frontier on start.
    pub fn with_start_url<S: AsRef<str>>(mut self, url: S) -> Self {
        self.config.start_url = url.as_ref().into();
        self
    }

    /// Restrict the crawl to these domains and their subdomains.
    pub fn with_allowed_domains<S: AsRef<str>>(mut self, domains: Vec<S>) -> Self {
        self.config.allowed_domains = domains
            .into_iter()
            .map(|domain| domain.as_ref().into())
            .collect();
        self
    }

    /// Set a specific maximum depth for the crawl.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Set a specific maximum number of pages to fetch.
    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.config.max_pages = pages;
        self
    }

    /// Cap embedded asset fetches separately from pages.
    pub fn with_max_assets(mut self, assets: usize) -> Self {
        self.config.max_assets = Some(assets);
        self
    }

    /// Upper bound on concurrent workers.
    pub fn with_max_concurrency(mut self, workers: usize) -> Self {
        self.config.max_concurrency = workers;
        self
    }

    /// Minimum spacing between requests to the same host.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.config.request_delay = delay;
        self
    }

    /// Per-request network timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enable or disable `robots.txt` handling
    pub fn with_robots(mut self, robots: bool) -> Self {
        self.config.respect_robots = robots;
        self
    }

    /// Set a custom user agent
    pub fn with_user_agent<S: AsRef<str>>(mut self, user_agent: S) -> Self {
        self.policy.user_agent = user_agent.as_ref().into();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.policy.follow_redirects = follow;
        self
    }

    /// Allow only a set of MIMEs for asset payloads
    pub fn with_allowed_mimes(mut self, mime_types: Vec<Mime>) -> Self {
        self.policy.allowed_mimes = mime_types;
        self
    }

    /// Apply the crawl-relevant sections of a resolved engine configuration:
    /// `global.max_concurrency`, `global.timeout`, `crawling.link_rules.max_depth`,
    /// and the rate rules (default delay plus per-site overrides).
    pub fn with_engine_spec(mut self, spec: &EngineConfigSpec) -> Self {
        if let Some(global) = &spec.global {
            if let Some(workers) = global.max_concurrency {
                self.config.max_concurrency = workers;
            }
            if let Some(timeout) = global.timeout {
                self.config.timeout = timeout;
            }
        }

        if let Some(crawling) = &spec.crawling {
            if let Some(link_rules) = &crawling.link_rules {
                if let Some(depth) = link_rules.max_depth {
                    self.config.max_depth = depth as usize;
                }
            }

            if let Some(rate_rules) = &crawling.rate_rules {
                if let Some(delay) = rate_rules.default_delay {
                    self.config.request_delay = delay;
                }
                if let Some(site_delays) = &rate_rules.site_delays {
                    self.policy.site_delays = site_delays.clone();
                }
            }
        }

        self
    }

    /// Consumes the builder and returns a configured `Crawler` instance.
    pub fn build(self) -> Result<Crawler> {
        Crawler::from_parts(self.config, self.policy)
    }
}

struct RunHandles {
    frontier: Arc<Frontier>,
    supervisor: JoinHandle<()>,
    workers: Vec<AbortHandle>,
    grace: Duration,
}

/// Main structure for the crawl runtime.
pub struct Crawler {
    config: ScraperConfig,
    fetcher: Arc<Fetcher>,
    state: Arc<Mutex<RunState>>,
    shutdown: watch::Sender<bool>,
    run: Mutex<Option<RunHandles>>,
    processed_pages: Arc<AtomicU64>,
}

impl Crawler {
    /// Initializes a new `Crawler` instance with the default configuration.
    pub fn new() -> Result<Self> {
        CrawlerBuilder::new().build()
    }

    /// Initializes the crawler from a run configuration, with default
    /// fetch-policy extras (user agent, retries, redirects).
    pub fn from_config(config: ScraperConfig) -> Result<Self> {
        Self::from_parts(config, FetchPolicy::default())
    }

    fn from_parts(config: ScraperConfig, mut policy: FetchPolicy) -> Result<Self> {
        policy.request_delay = config.request_delay;
        policy.timeout = config.timeout;
        policy.respect_robots = config.respect_robots;
        policy.allowed_domains = config.allowed_domains.clone();
        policy.max_depth = config.max_depth;

        let fetcher = Arc::new(Fetcher::new(policy)?);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            fetcher,
            state: Arc::new(Mutex::new(RunState::Idle)),
            shutdown,
            run: Mutex::new(None),
            processed_pages: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn state(&self) -> RunState {
        *lock_ignoring_poison(&self.state)
    }

    /// Counters snapshot; callable at any time, including mid-run.
    pub fn stats(&self) -> CrawlStats {
        self.fetcher
            .counters()
            .snapshot(self.processed_pages.load(Ordering::Relaxed))
    }

    /// Seeds the frontier and spawns the worker pool. Valid only from
    /// `Idle`; initialization problems (unparseable seed, empty allow-list,
    /// seed outside the allow-list) are fatal and leave the state at `Idle`.
    ///
    /// Returns the result stream; it is closed exactly once, when the run
    /// reaches `Stopped`.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<mpsc::Receiver<CrawlResult>> {
        let seed = {
            let mut state = lock_ignoring_poison(&self.state);
            if *state != RunState::Idle {
                return Err(Error::InvalidInput(format!(
                    "start is only valid from Idle (state: {:?})",
                    *state
                )));
            }

            let seed = Url::parse(&self.config.start_url).map_err(|error| {
                Error::Fatal(format!(
                    "invalid start URL {:?}: {error}",
                    self.config.start_url
                ))
            })?;

            if self.config.allowed_domains.is_empty() {
                return Err(Error::Fatal("allowed_domains must not be empty".into()));
            }

            let seed_allowed = seed
                .host_str()
                .map(|host| {
                    crate::fetcher::host_in_domains(host, &self.config.allowed_domains)
                })
                .unwrap_or(false);
            if !seed_allowed {
                return Err(Error::Fatal(format!(
                    "start URL host is not in allowed_domains: {seed}"
                )));
            }

            *state = RunState::Running;

            seed
        };

        // Robots cache and frontier are scoped to this run.
        let robots = Arc::new(RobotsCache::new(
            self.fetcher.client().await,
            self.config.respect_robots,
        ));
        let frontier = Arc::new(Frontier::new(
            FrontierLimits {
                allowed_domains: self.config.allowed_domains.clone(),
                max_depth: self.config.max_depth,
                max_pages: self.config.max_pages,
                max_assets: self.config.max_assets,
            },
            robots,
        ));

        if !frontier
            .admit(FrontierItem::page(seed.clone(), 0, None))
            .await
        {
            // A robots-denied seed is not fatal: the run simply has nothing
            // to do and the stream closes after the workers drain.
            tracing::debug!("Seed was not admitted {{ seed: {seed} }}");

            frontier.close();
        }

        let worker_count = self
            .config
            .max_concurrency
            .min(self.config.allowed_domains.len() * 2)
            .max(1);

        let (results, receiver) = mpsc::channel(RESULT_BUFFER);
        let mut handles = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.fetcher),
                Arc::clone(&frontier),
                results.clone(),
                self.shutdown.subscribe(),
                Arc::clone(&self.processed_pages),
            )));
        }
        drop(results);

        let workers: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let supervisor = tokio::spawn({
            let state = Arc::clone(&self.state);
            async move {
                join_all(handles).await;

                *lock_ignoring_poison(&state) = RunState::Stopped;

                tracing::debug!("Crawl run finished");
            }
        });

        *lock_ignoring_poison(&self.run) = Some(RunHandles {
            frontier: Arc::clone(&frontier),
            supervisor,
            workers,
            grace: self.config.timeout * 2,
        });

        // A stop that raced this start has already flipped the state; make
        // sure the freshly spawned workers wind down.
        if self.state() != RunState::Running {
            frontier.close();
        }

        Ok(receiver)
    }

    /// Cancels the run: workers observe the signal at their next suspension
    /// point, in-flight fetches get a bounded grace period, stragglers are
    /// aborted. Idempotent once the run has started.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock_ignoring_poison(&self.state);
            match *state {
                RunState::Idle => {
                    return Err(Error::InvalidInput("crawler has not been started".into()))
                }
                RunState::Stopped => return Ok(()),
                RunState::Running => *state = RunState::Stopping,
                RunState::Stopping => {}
            }
        }

        let _ = self.shutdown.send(true);

        let run = lock_ignoring_poison(&self.run).take();
        if let Some(run) = run {
            run.frontier.close();

            if timeout(run.grace, run.supervisor).await.is_err() {
                tracing::debug!("Grace period expired, aborting workers");

                for worker in &run.workers {
                    worker.abort();
                }
            }
        }

        *lock_ignoring_poison(&self.state) = RunState::Stopped;

        Ok(())
    }
}

/// Worker loop: pull, fetch, admit discoveries, emit. Every arm of the loop
/// is cancellable via the shutdown channel.
#[tracing::instrument(skip(fetcher, frontier, results, shutdown, processed_pages))]
async fn run_worker(
    worker_id: usize,
    fetcher: Arc<Fetcher>,
    frontier: Arc<Frontier>,
    results: mpsc::Sender<CrawlResult>,
    mut shutdown: watch::Receiver<bool>,
    processed_pages: Arc<AtomicU64>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = frontier.next() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                frontier.task_done();
                break;
            }
            outcome = process_item(&fetcher, &frontier, &processed_pages, &item) => outcome,
        };

        if let Some(result) = outcome {
            let delivered = tokio::select! {
                _ = shutdown.changed() => false,
                sent = results.send(result) => sent.is_ok(),
            };

            if !delivered {
                frontier.task_done();
                break;
            }
        }

        frontier.task_done();
    }

    tracing::debug!("Worker exiting {{ worker_id: {worker_id} }}");
}

/// Fetch one item and feed discoveries back through admission. Returns
/// `None` for silent policy drops; fetch failures become unsuccessful
/// results rather than aborting the run.
async fn process_item(
    fetcher: &Fetcher,
    frontier: &Frontier,
    processed_pages: &AtomicU64,
    item: &FrontierItem,
) -> Option<CrawlResult> {
    let stage = match item.kind {
        ItemKind::Page => Stage::Crawl,
        ItemKind::Asset => Stage::Asset,
    };

    match fetcher.fetch(&item.url).await {
        Ok(page) => {
            if item.kind == ItemKind::Page {
                for link in &page.links {
                    frontier
                        .admit(FrontierItem::page(
                            link.clone(),
                            item.depth + 1,
                            Some(item.url.clone()),
                        ))
                        .await;
                }

                // Assets inherit the page's depth instead of incrementing it.
                for asset in &page.assets {
                    frontier
                        .admit(FrontierItem::asset(
                            asset.clone(),
                            item.depth,
                            Some(item.url.clone()),
                        ))
                        .await;
                }

                processed_pages.fetch_add(1, Ordering::Relaxed);
            }

            Some(CrawlResult {
                url: item.url.clone(),
                stage,
                success: true,
                status_code: Some(page.status),
                page: Some(page),
                error: None,
            })
        }
        Err(error) if error.is_policy_reject() => {
            tracing::debug!("Dropped by policy {{ url: {}, reason: {error} }}", item.url);

            None
        }
        Err(Error::HttpStatus { status, .. }) => Some(CrawlResult {
            url: item.url.clone(),
            stage,
            success: false,
            status_code: Some(status),
            page: None,
            error: Some(format!("http status {status}")),
        }),
        Err(error) => Some(CrawlResult {
            url: item.url.clone(),
            stage,
            success: false,
            status_code: None,
            page: None,
            error: Some(error.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
            .with_start_url("http://example.com/")
            .with_allowed_domains(vec!["example.com"])
    }

    #[tokio::test]
    async fn start_requires_allowed_domains() {
        let crawler = CrawlerBuilder::new()
            .with_start_url("http://example.com/")
            .build()
            .unwrap();

        assert!(matches!(crawler.start().await, Err(Error::Fatal(_))));
        assert_eq!(crawler.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn start_requires_parseable_seed() {
        let crawler = CrawlerBuilder::new()
            .with_start_url("not a url")
            .with_allowed_domains(vec!["example.com"])
            .build()
            .unwrap();

        assert!(matches!(crawler.start().await, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn start_rejects_seed_outside_allow_list() {
        let crawler = builder()
            .with_start_url("http://other.org/")
            .build()
            .unwrap();

        assert!(matches!(crawler.start().await, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn stop_before_start_is_invalid() {
        let crawler = builder().build().unwrap();

        assert!(matches!(crawler.stop().await, Err(Error::InvalidInput(_))));
    }

    /// Seed on a closed local port: the run starts, fails fast, and never
    /// leaves the machine.
    fn local_builder() -> CrawlerBuilder {
        CrawlerBuilder::new()
            .with_start_url("http://127.0.0.1:1/")
            .with_allowed_domains(vec!["127.0.0.1"])
            .with_request_delay(Duration::ZERO)
            .with_max_retries(0)
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let crawler = local_builder().build().unwrap();

        let _results = crawler.start().await.unwrap();
        assert!(matches!(
            crawler.start().await,
            Err(Error::InvalidInput(_))
        ));

        crawler.stop().await.unwrap();
        assert_eq!(crawler.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent_after_start() {
        let crawler = local_builder().build().unwrap();

        let _results = crawler.start().await.unwrap();
        crawler.stop().await.unwrap();
        crawler.stop().await.unwrap();
        assert_eq!(crawler.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn from_config_carries_the_run_parameters() {
        let crawler = Crawler::from_config(ScraperConfig {
            start_url: "http://example.com/".into(),
            allowed_domains: vec!["example.com".into()],
            max_pages: 3,
            ..ScraperConfig::default()
        })
        .unwrap();

        assert_eq!(crawler.config.max_pages, 3);
        assert_eq!(crawler.state(), RunState::Idle);
    }

    #[test]
    fn engine_spec_overrides_run_parameters() {
        let spec: EngineConfigSpec = serde_json::from_str(
            r#"{
                "global": { "max_concurrency": 3, "timeout": "5s" },
                "crawling": {
                    "link_rules": { "max_depth": 2 },
                    "rate_rules": { "default_delay": "50ms", "site_delays": { "slow.example.com": "2s" } }
                }
            }"#,
        )
        .unwrap();

        let builder = builder().with_engine_spec(&spec);
        assert_eq!(builder.config.max_concurrency, 3);
        assert_eq!(builder.config.timeout, Duration::from_secs(5));
        assert_eq!(builder.config.max_depth, 2);
        assert_eq!(builder.config.request_delay, Duration::from_millis(50));
        assert_eq!(
            builder.policy.site_delays.get("slow.example.com"),
            Some(&Duration::from_secs(2))
        );
    }
}
