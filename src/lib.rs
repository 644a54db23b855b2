//! The `Trawler` crawl engine fetches pages and assets from a bounded set of
//! domains under a configurable policy envelope. It respects `robots.txt`
//! guidelines, enforces per-host politeness, and streams typed results while
//! a worker pool drains the frontier.

pub mod config;
pub mod crawler;
pub mod error;
pub mod fetcher;
pub mod frontier;
pub mod normalize;
pub mod robots;
pub mod stats;

pub use crawler::{CrawlResult, Crawler, CrawlerBuilder, RunState, ScraperConfig, Stage};
pub use error::{Error, Result};
pub use fetcher::{FetchPolicy, FetchResult, Fetcher};
pub use frontier::{Frontier, FrontierItem, FrontierLimits, ItemKind};
pub use mime::Mime;
pub use normalize::normalize;
pub use robots::{RobotsCache, RobotsRules};
pub use stats::CrawlStats;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// State mutexes guard plain data; a panic while holding one leaves the data
/// consistent, so poisoning is ignored rather than propagated.
pub(crate) fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
