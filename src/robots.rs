//! Per-host `robots.txt` cache.
//!
//! Only the `User-agent: *` group and its `Disallow:` lines are interpreted.
//! A host whose robots file is missing or unreachable is treated as
//! unrestricted, so a broken robots endpoint never halts a crawl.

use indexmap::IndexMap;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Directives parsed from one host's `robots.txt`.
#[derive(Debug, Clone)]
pub struct RobotsRules {
    deny_all: bool,
    disallow: Vec<String>,
    fetched_at: Instant,
}

impl RobotsRules {
    /// Rules for a host with no reachable robots file.
    fn allow_all() -> Self {
        Self {
            deny_all: false,
            disallow: Vec::new(),
            fetched_at: Instant::now(),
        }
    }

    /// Line-oriented parse of the minimal subset: an active flag tracks
    /// whether the most recent `User-agent:` line was `*`; while active,
    /// `Disallow:` lines contribute path prefixes, with `/` denying the
    /// whole host and an empty value ignored.
    fn parse(content: &str) -> Self {
        let mut deny_all = false;
        let mut disallow = Vec::new();
        let mut active = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let (directive, value) = match line.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => active = value == "*",
                "disallow" if active => match value {
                    "" => {}
                    "/" => deny_all = true,
                    prefix => disallow.push(prefix.to_string()),
                },
                _ => {}
            }
        }

        Self {
            deny_all,
            disallow,
            fetched_at: Instant::now(),
        }
    }

    /// Whether this rule set permits fetching `path`.
    pub fn allows(&self, path: &str) -> bool {
        if self.deny_all {
            return false;
        }

        !self.disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// When the rules were fetched; rules live for the whole run.
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }
}

/// Lazily-populated robots rules, one entry per host.
///
/// The fast path is read-locked; racing fetches for the same host may both
/// retrieve the file, but the store is serialized and the last writer wins
/// (the rule sets are equivalent).
pub struct RobotsCache {
    client: Client,
    respect: bool,
    rules: RwLock<IndexMap<String, Arc<RobotsRules>>>,
}

impl RobotsCache {
    pub fn new(client: Client, respect: bool) -> Self {
        Self {
            client,
            respect,
            rules: RwLock::new(IndexMap::new()),
        }
    }

    /// Decides whether `url` may be fetched under the cached host rules,
    /// consulting the host's `robots.txt` on first need.
    pub async fn allowed(&self, url: &Url) -> bool {
        if !self.respect {
            return true;
        }

        // The robots file itself must stay fetchable.
        if url.path() == "/robots.txt" {
            return true;
        }

        let host = match host_key(url) {
            Some(host) => host,
            None => return false,
        };

        if let Some(rules) = self.rules.read().await.get(&host).cloned() {
            return rules.allows(url.path());
        }

        let rules = Arc::new(self.fetch_rules(url.scheme(), &host).await);
        self.rules
            .write()
            .await
            .insert(host, Arc::clone(&rules));

        rules.allows(url.path())
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_rules(&self, scheme: &str, host: &str) -> RobotsRules {
        let robots_url = format!("{scheme}://{host}/robots.txt");

        match self.client.get(&robots_url).send().await {
            Ok(response) if response.status().as_u16() < 400 => match response.text().await {
                Ok(content) => {
                    tracing::debug!("Fetched robots.txt {{ host: {host} }}");

                    RobotsRules::parse(&content)
                }
                Err(error) => {
                    tracing::debug!("Unreadable robots.txt body, allowing all {{ host: {host}, error: {error} }}");

                    RobotsRules::allow_all()
                }
            },
            Ok(response) => {
                tracing::debug!(
                    "No robots.txt, allowing all {{ host: {host}, status: {} }}",
                    response.status()
                );

                RobotsRules::allow_all()
            }
            Err(error) => {
                tracing::debug!("robots.txt fetch failed, allowing all {{ host: {host}, error: {error} }}");

                RobotsRules::allow_all()
            }
        }
    }
}

/// Cache key for a URL's authority, carrying a non-default port.
fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
