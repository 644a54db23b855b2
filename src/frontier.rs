//! Bounded, deduplicated queue of pending fetch work.
//!
//! Admission applies the whole policy envelope (scheme, allow-list, depth,
//! dedup by normalized key, robots, page/asset caps). Pages drain ahead of
//! assets so slow asset retrieval never starves page discovery.

use crate::fetcher::host_in_domains;
use crate::normalize::normalize;
use crate::robots::RobotsCache;
use reqwest::Url;
use std::collections::{HashSet, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Page,
    Asset,
}

/// One unit of crawl work; created on admission, consumed at most once.
#[derive(Debug, Clone)]
pub struct FrontierItem {
    pub url: Url,
    pub depth: usize,
    pub kind: ItemKind,
    pub parent: Option<Url>,
}

impl FrontierItem {
    pub fn page(url: Url, depth: usize, parent: Option<Url>) -> Self {
        Self {
            url,
            depth,
            kind: ItemKind::Page,
            parent,
        }
    }

    pub fn asset(url: Url, depth: usize, parent: Option<Url>) -> Self {
        Self {
            url,
            depth,
            kind: ItemKind::Asset,
            parent,
        }
    }
}

/// Bounds applied at admission time.
#[derive(Debug, Clone)]
pub struct FrontierLimits {
    pub allowed_domains: Vec<String>,
    pub max_depth: usize,
    pub max_pages: usize,
    pub max_assets: Option<usize>,
}

#[derive(Default)]
struct Queues {
    pages: VecDeque<FrontierItem>,
    assets: VecDeque<FrontierItem>,
}

/// Set-backed FIFO shared by all workers of one run.
pub struct Frontier {
    limits: FrontierLimits,
    robots: Arc<RobotsCache>,
    seen: Mutex<HashSet<String>>,
    queues: Mutex<Queues>,
    notify: Notify,
    pages_admitted: AtomicUsize,
    assets_admitted: AtomicUsize,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl Frontier {
    pub fn new(limits: FrontierLimits, robots: Arc<RobotsCache>) -> Self {
        Self {
            limits,
            robots,
            seen: Mutex::new(HashSet::new()),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            pages_admitted: AtomicUsize::new(0),
            assets_admitted: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Applies the admission rules in order; returns false on any rejection
    /// (duplicates included). An admitted item will be handed to exactly one
    /// worker.
    pub async fn admit(&self, item: FrontierItem) -> bool {
        if self.is_closed() {
            return false;
        }

        if !matches!(item.url.scheme(), "http" | "https") {
            return false;
        }

        let allowed_host = item
            .url
            .host_str()
            .map(|host| host_in_domains(host, &self.limits.allowed_domains))
            .unwrap_or(false);
        if !allowed_host {
            return false;
        }

        if item.depth > self.limits.max_depth {
            return false;
        }

        // Single check-and-insert critical section keys the dedup guarantee.
        let key = normalize(&item.url);
        if !self.seen.lock().await.insert(key) {
            return false;
        }

        if !self.robots.allowed(&item.url).await {
            tracing::debug!("Robots denied admission {{ url: {} }}", item.url);

            return false;
        }

        let cap_ok = match item.kind {
            ItemKind::Page => admit_under_cap(&self.pages_admitted, Some(self.limits.max_pages)),
            ItemKind::Asset => admit_under_cap(&self.assets_admitted, self.limits.max_assets),
        };
        if !cap_ok {
            return false;
        }

        self.pending.fetch_add(1, Ordering::SeqCst);

        {
            let mut queues = self.queues.lock().await;
            match item.kind {
                ItemKind::Page => queues.pages.push_back(item),
                ItemKind::Asset => queues.assets.push_back(item),
            }
        }
        self.notify.notify_one();

        true
    }

    /// Blocks until an item is available or the frontier is closed and
    /// drained; `None` means the run is over for this worker.
    pub async fn next(&self) -> Option<FrontierItem> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before checking, so a concurrent push or close cannot
            // slip between the check and the await.
            notified.as_mut().enable();

            if let Some(item) = self.pop().await {
                return Some(item);
            }

            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    async fn pop(&self) -> Option<FrontierItem> {
        let mut queues = self.queues.lock().await;

        queues.pages.pop_front().or_else(|| queues.assets.pop_front())
    }

    /// Marks one admitted item finished. Finishing the last outstanding item
    /// ends the run by closing the frontier.
    pub fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close();
        }
    }

    /// Idempotent; wakes every blocked worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Distinct pages admitted so far in this run.
    pub fn pages_admitted(&self) -> usize {
        self.pages_admitted.load(Ordering::SeqCst)
    }
}

/// Reserve one slot under `cap`; unlimited when `cap` is `None`.
fn admit_under_cap(counter: &AtomicUsize, cap: Option<usize>) -> bool {
    match cap {
        Some(cap) => counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |admitted| {
                if admitted < cap {
                    Some(admitted + 1)
                } else {
                    None
                }
            })
            .is_ok(),
        None => {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }
    }
}
