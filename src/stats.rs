//! Monotonic crawl counters, readable at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time snapshot of a run's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub processed_pages: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub links_discovered: u64,
    pub bytes_downloaded: u64,
    pub average_latency: Duration,
}

/// Lock-free counters updated on the fetch path.
#[derive(Debug, Default)]
pub(crate) struct FetchCounters {
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    links_discovered: AtomicU64,
    bytes_downloaded: AtomicU64,
    total_latency_ns: AtomicU64,
}

impl FetchCounters {
    pub(crate) fn record_response(&self, latency: Duration) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_links(&self, count: u64) {
        self.links_discovered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, processed_pages: u64) -> CrawlStats {
        let completed = self.requests_completed.load(Ordering::Relaxed);
        let average_latency = if completed > 0 {
            Duration::from_nanos(self.total_latency_ns.load(Ordering::Relaxed) / completed)
        } else {
            Duration::ZERO
        };

        CrawlStats {
            processed_pages,
            requests_completed: completed,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            links_discovered: self.links_discovered.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            average_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_is_zero_without_completions() {
        let counters = FetchCounters::default();
        assert_eq!(counters.snapshot(0).average_latency, Duration::ZERO);
    }

    #[test]
    fn average_latency_divides_by_completed() {
        let counters = FetchCounters::default();
        counters.record_response(Duration::from_millis(100));
        counters.record_response(Duration::from_millis(300));

        let stats = counters.snapshot(2);
        assert_eq!(stats.requests_completed, 2);
        assert_eq!(stats.average_latency, Duration::from_millis(200));
        assert_eq!(stats.processed_pages, 2);
    }
}
