//! Single-request HTTP fetching under a reconfigurable policy.
//!
//! The fetcher owns the politeness gate (per-host request spacing), the
//! domain allow-list, retries on transport errors, and link/asset discovery
//! from HTML payloads.

use crate::error::{Error, Result};
use crate::stats::{CrawlStats, FetchCounters};
use indexmap::IndexMap;
use mime::Mime;
use reqwest::redirect;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, sleep_until, Instant};

const USER_AGENT: &str = "TrawlerRustCrawler";

// Default policy constants.
const REQUEST_DELAY_MS: u64 = 250;
const TIMEOUT_SECONDS: u64 = 30;
const MAX_RETRIES: u32 = 2;
const MAX_REDIRECTS: usize = 10;
const RETRY_BACKOFF_MS: u64 = 250;
const MAX_DEPTH: usize = 5;

/// Schemes a discovered link may carry.
const ACCEPTED_SCHEMES: [&str; 2] = ["http", "https"];

/// Link prefixes that are never crawlable.
const SKIPPED_HREF_PREFIXES: [&str; 3] = ["mailto:", "javascript:", "tel:"];

/// Parameters bounding every request of a crawl run.
///
/// Immutable per run; swap a new policy in with [`Fetcher::configure`]
/// between runs.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub user_agent: String,
    pub request_delay: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub respect_robots: bool,
    pub follow_redirects: bool,
    pub allowed_domains: Vec<String>,
    pub max_depth: usize,
    /// Per-host overrides of `request_delay`.
    pub site_delays: IndexMap<String, Duration>,
    /// When non-empty, asset payloads outside this list are dropped.
    pub allowed_mimes: Vec<Mime>,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT.into(),
            request_delay: Duration::from_millis(REQUEST_DELAY_MS),
            timeout: Duration::from_secs(TIMEOUT_SECONDS),
            max_retries: MAX_RETRIES,
            respect_robots: true,
            follow_redirects: true,
            allowed_domains: Vec::new(),
            max_depth: MAX_DEPTH,
            site_delays: IndexMap::new(),
            allowed_mimes: Vec::new(),
        }
    }
}

impl FetchPolicy {
    /// Structural checks every policy must pass before a run.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidInput("timeout must be positive".into()));
        }

        if self.user_agent.trim().is_empty() {
            return Err(Error::InvalidInput("user agent must not be empty".into()));
        }

        Ok(())
    }

    /// A host is allowed when it equals an allow-list entry or is a
    /// subdomain of one.
    pub fn domain_allowed(&self, host: &str) -> bool {
        host_in_domains(host, &self.allowed_domains)
    }

    fn delay_for(&self, host: &str) -> Duration {
        self.site_delays
            .get(host)
            .copied()
            .unwrap_or(self.request_delay)
    }
}

/// Everything retrieved for one URL.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: Url,
    pub content: Vec<u8>,
    pub headers: IndexMap<String, String>,
    pub status: u16,
    pub links: Vec<Url>,
    pub assets: Vec<Url>,
    pub metadata: IndexMap<String, String>,
}

struct FetcherState {
    policy: FetchPolicy,
    client: Client,
}

/// Performs HTTP requests under the configured [`FetchPolicy`].
pub struct Fetcher {
    state: RwLock<FetcherState>,
    last_hit: Mutex<HashMap<String, Instant>>, // per-host politeness reservations
    counters: FetchCounters,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self> {
        policy.validate()?;
        let client = build_client(&policy)?;

        Ok(Self {
            state: RwLock::new(FetcherState { policy, client }),
            last_hit: Mutex::new(HashMap::new()),
            counters: FetchCounters::default(),
        })
    }

    /// Validates and hot-swaps the policy, rebuilding the HTTP client.
    pub async fn configure(&self, policy: FetchPolicy) -> Result<()> {
        policy.validate()?;
        let client = build_client(&policy)?;

        *self.state.write().await = FetcherState { policy, client };

        Ok(())
    }

    pub async fn policy(&self) -> FetchPolicy {
        self.state.read().await.policy.clone()
    }

    /// A handle to the underlying HTTP client, shared with the robots cache.
    pub async fn client(&self) -> Client {
        self.state.read().await.client.clone()
    }

    /// Lock-free snapshot of the request counters.
    pub fn stats(&self) -> CrawlStats {
        self.counters.snapshot(0)
    }

    pub(crate) fn counters(&self) -> &FetchCounters {
        &self.counters
    }

    /// Performs one GET under the policy: allow-list gate, per-host delay,
    /// retries on transport errors, then payload capture. HTML payloads get
    /// title/description metadata plus link and asset discovery.
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, url: &Url) -> Result<FetchResult> {
        let (client, policy) = {
            let state = self.state.read().await;
            (state.client.clone(), state.policy.clone())
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("URL has no host: {url}")))?
            .to_string();

        if !policy.domain_allowed(&host) {
            return Err(Error::PolicyReject(format!("domain not allowed: {host}")));
        }

        self.honor_delay(&host, policy.delay_for(&host)).await;

        let started = Instant::now();
        let response = self.send_with_retries(&client, url, policy.max_retries).await?;
        let status = response.status().as_u16();

        self.counters.record_response(started.elapsed());

        let headers: IndexMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();

        if status >= 400 {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status,
            });
        }

        let content = match response.bytes().await {
            Ok(content) => content.to_vec(),
            Err(source) => {
                self.counters.record_failure();

                return Err(Error::Transport {
                    url: url.to_string(),
                    source,
                });
            }
        };

        self.counters.record_bytes(content.len() as u64);

        let mut result = FetchResult {
            url: url.clone(),
            content,
            headers,
            status,
            links: Vec::new(),
            assets: Vec::new(),
            metadata: IndexMap::new(),
        };

        if is_html(&result.headers) {
            let body = String::from_utf8_lossy(&result.content).into_owned();

            result.metadata = extract_metadata(&body)?;
            result.links = discover_in(&body, url, &policy)?;
            result.assets = discover_assets_in(&body, url, &policy)?;

            self.counters.record_links(result.links.len() as u64);

            tracing::debug!(
                "Fetched page {{ url: {url}, links: {}, assets: {} }}",
                result.links.len(),
                result.assets.len()
            );
        } else if !policy.allowed_mimes.is_empty() && !mime_allowed(&result.content, &policy) {
            return Err(Error::PolicyReject(format!(
                "payload type not in allow-list: {url}"
            )));
        }

        Ok(result)
    }

    /// Extracts crawlable page links from HTML, resolved against `base` and
    /// filtered by scheme and domain allow-list. Every returned URL is
    /// absolute and allowed.
    pub async fn discover(&self, content: &str, base: &Url) -> Result<Vec<Url>> {
        let policy = self.state.read().await.policy.clone();

        discover_in(content, base, &policy)
    }

    /// Space out requests to the same host. The reservation is taken under
    /// the lock, the sleep happens outside it, so concurrent callers queue
    /// behind each other without serializing distinct hosts.
    async fn honor_delay(&self, host: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }

        let slot = {
            let mut last_hit = self.last_hit.lock().await;
            let now = Instant::now();
            let slot = match last_hit.get(host) {
                Some(previous) => (*previous + delay).max(now),
                None => now,
            };
            last_hit.insert(host.to_string(), slot);

            slot
        };

        sleep_until(slot).await;
    }

    async fn send_with_retries(
        &self,
        client: &Client,
        url: &Url,
        max_retries: u32,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;

        loop {
            match client.get(url.clone()).send().await {
                Ok(response) => return Ok(response),
                Err(error) if attempt < max_retries => {
                    attempt += 1;

                    tracing::debug!(
                        "Retrying after transport error {{ url: {url}, attempt: {attempt}, error: {error} }}"
                    );

                    sleep(Duration::from_millis(RETRY_BACKOFF_MS) * attempt).await;
                }
                Err(source) => {
                    self.counters.record_failure();

                    return Err(Error::Transport {
                        url: url.to_string(),
                        source,
                    });
                }
            }
        }
    }
}

/// Shared allow-list test: exact host match or subdomain suffix.
pub(crate) fn host_in_domains(host: &str, entries: &[String]) -> bool {
    let host = host.to_ascii_lowercase();

    entries.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

fn build_client(policy: &FetchPolicy) -> Result<Client> {
    let redirects = if policy.follow_redirects {
        redirect::Policy::limited(MAX_REDIRECTS)
    } else {
        redirect::Policy::none()
    };

    Client::builder()
        .user_agent(policy.user_agent.as_str())
        .timeout(policy.timeout)
        .redirect(redirects)
        .build()
        .map_err(|error| Error::Fatal(format!("failed to build http client: {error}")))
}

fn is_html(headers: &IndexMap<String, String>) -> bool {
    headers
        .get("content-type")
        .and_then(|value| Mime::from_str(value).ok())
        .map(|mime| mime.type_() == mime::TEXT && mime.subtype() == mime::HTML)
        .unwrap_or(false)
}

fn mime_allowed(content: &[u8], policy: &FetchPolicy) -> bool {
    match infer::get(content) {
        Some(kind) => match Mime::from_str(kind.mime_type()) {
            Ok(mime) => policy.allowed_mimes.contains(&mime),
            Err(_) => true,
        },
        // Unrecognized payloads pass; the filter only drops known-foreign types.
        None => true,
    }
}

/// Collects attribute values for a selector, in document order.
fn extract_attrs(html: &Html, selector: &str, attr: &str) -> Result<Vec<String>> {
    let selector = Selector::parse(selector)
        .map_err(|error| Error::InvalidInput(format!("bad selector: {error:?}")))?;

    Ok(html
        .select(&selector)
        .filter_map(|element| element.value().attr(attr).map(str::to_string))
        .collect())
}

fn resolve_candidates(
    candidates: Vec<String>,
    base: &Url,
    policy: &FetchPolicy,
) -> Vec<Url> {
    candidates
        .into_iter()
        .filter(|href| {
            !href.is_empty()
                && !SKIPPED_HREF_PREFIXES
                    .iter()
                    .any(|prefix| href.starts_with(prefix))
        })
        .filter_map(|href| base.join(&href).ok())
        .filter(|url| ACCEPTED_SCHEMES.contains(&url.scheme()))
        .filter(|url| {
            url.host_str()
                .map(|host| policy.domain_allowed(host))
                .unwrap_or(false)
        })
        .collect()
}

fn discover_in(content: &str, base: &Url, policy: &FetchPolicy) -> Result<Vec<Url>> {
    let html = Html::parse_document(content);
    let candidates = extract_attrs(&html, "a", "href")?;

    Ok(resolve_candidates(candidates, base, policy))
}

fn discover_assets_in(content: &str, base: &Url, policy: &FetchPolicy) -> Result<Vec<Url>> {
    let html = Html::parse_document(content);

    let mut candidates = extract_attrs(&html, "img", "src")?;
    candidates.extend(extract_attrs(&html, "script", "src")?);
    candidates.extend(extract_attrs(&html, "link", "href")?);

    Ok(resolve_candidates(candidates, base, policy))
}

fn extract_metadata(content: &str) -> Result<IndexMap<String, String>> {
    let html = Html::parse_document(content);
    let mut metadata = IndexMap::new();

    let title = Selector::parse("title")
        .map_err(|error| Error::InvalidInput(format!("bad selector: {error:?}")))?;
    if let Some(element) = html.select(&title).next() {
        let text = element.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            metadata.insert("title".to_string(), text);
        }
    }

    let description = Selector::parse(r#"meta[name="description"]"#)
        .map_err(|error| Error::InvalidInput(format!("bad selector: {error:?}")))?;
    if let Some(content) = html
        .select(&description)
        .next()
        .and_then(|element| element.value().attr("content"))
    {
        if !content.is_empty() {
            metadata.insert("description".to_string(), content.to_string());
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> FetchPolicy {
        FetchPolicy {
            allowed_domains: vec!["example.com".into()],
            ..FetchPolicy::default()
        }
    }

    #[test]
    fn default_policy_validates() {
        assert!(FetchPolicy::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let policy = FetchPolicy {
            timeout: Duration::ZERO,
            ..FetchPolicy::default()
        };
        assert!(matches!(policy.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn domain_allow_list_accepts_exact_and_subdomains() {
        let policy = test_policy();
        assert!(policy.domain_allowed("example.com"));
        assert!(policy.domain_allowed("www.example.com"));
        assert!(policy.domain_allowed("EXAMPLE.com"));
        assert!(!policy.domain_allowed("example.org"));
        assert!(!policy.domain_allowed("badexample.com"));
    }

    #[test]
    fn site_delay_overrides_default() {
        let mut policy = test_policy();
        policy
            .site_delays
            .insert("slow.example.com".into(), Duration::from_secs(5));

        assert_eq!(policy.delay_for("slow.example.com"), Duration::from_secs(5));
        assert_eq!(
            policy.delay_for("example.com"),
            Duration::from_millis(REQUEST_DELAY_MS)
        );
    }

    #[test]
    fn discover_filters_unusable_links() {
        let base = Url::parse("http://example.com/dir/").unwrap();
        let html = r##"
            <a href="/absolute">a</a>
            <a href="relative.html">b</a>
            <a href="mailto:someone@example.com">c</a>
            <a href="javascript:void(0)">d</a>
            <a href="tel:+1234">e</a>
            <a href="">f</a>
            <a href="http://other.org/offsite">g</a>
            <a href="ftp://example.com/file">h</a>
        "##;

        let links = discover_in(html, &base, &test_policy()).unwrap();
        let raw: Vec<String> = links.iter().map(Url::to_string).collect();

        assert_eq!(
            raw,
            vec![
                "http://example.com/absolute".to_string(),
                "http://example.com/dir/relative.html".to_string(),
            ]
        );
    }

    #[test]
    fn asset_discovery_covers_img_script_link() {
        let base = Url::parse("http://example.com/").unwrap();
        let html = r#"
            <img src="/logo.png">
            <script src="/app.js"></script>
            <link rel="stylesheet" href="/style.css">
            <img src="http://cdn.other.org/far.png">
        "#;

        let assets = discover_assets_in(html, &base, &test_policy()).unwrap();
        let raw: Vec<String> = assets.iter().map(Url::to_string).collect();

        assert_eq!(
            raw,
            vec![
                "http://example.com/logo.png".to_string(),
                "http://example.com/app.js".to_string(),
                "http://example.com/style.css".to_string(),
            ]
        );
    }

    #[test]
    fn metadata_extraction() {
        let html = r#"
            <html><head>
              <title> Example Title </title>
              <meta name="description" content="An example page.">
            </head><body></body></html>
        "#;

        let metadata = extract_metadata(html).unwrap();
        assert_eq!(metadata.get("title").map(String::as_str), Some("Example Title"));
        assert_eq!(
            metadata.get("description").map(String::as_str),
            Some("An example page.")
        );
    }

    #[test]
    fn html_detection_uses_content_type() {
        let mut headers = IndexMap::new();
        headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
        assert!(is_html(&headers));

        headers.insert("content-type".to_string(), "image/png".to_string());
        assert!(!is_html(&headers));

        assert!(!is_html(&IndexMap::new()));
    }

    #[tokio::test]
    async fn configure_rejects_invalid_policy() {
        let fetcher = Fetcher::new(test_policy()).unwrap();
        let bad = FetchPolicy {
            timeout: Duration::ZERO,
            ..test_policy()
        };

        assert!(fetcher.configure(bad).await.is_err());
        // The previous policy stays in force.
        assert!(fetcher.policy().await.timeout > Duration::ZERO);
    }

    #[tokio::test]
    async fn fetch_rejects_disallowed_domain() {
        let fetcher = Fetcher::new(test_policy()).unwrap();
        let url = Url::parse("http://other.org/").unwrap();

        assert!(matches!(
            fetcher.fetch(&url).await,
            Err(Error::PolicyReject(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_gate_spaces_same_host_requests() {
        let fetcher = Fetcher::new(test_policy()).unwrap();
        let delay = Duration::from_millis(200);

        let before = Instant::now();
        fetcher.honor_delay("example.com", delay).await;
        fetcher.honor_delay("example.com", delay).await;
        fetcher.honor_delay("example.com", delay).await;

        assert!(before.elapsed() >= delay * 2);
    }
}
