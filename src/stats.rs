//! # Statistics Module
//!
//! Collects and stores metrics about the engine's operation.
//!
//! ## Overview
//!
//! The `StatCollector` tracks request dispatch outcomes (enqueued, sent,
//! succeeded, failed, ignored, skipped, cancelled), response status code
//! distributions, and the item success/error/ignore counters fed by the
//! pipeline chain. All counters use atomic operations and are safe to update
//! from any number of workers.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

// A snapshot of the current statistics, used for reporting.
struct StatsSnapshot {
    requests_enqueued: usize,
    requests_sent: usize,
    requests_succeeded: usize,
    requests_failed: usize,
    requests_ignored: usize,
    requests_skipped: usize,
    requests_cancelled: usize,
    item_success: usize,
    item_error: usize,
    item_ignore: usize,
    response_status_counts: HashMap<u16, usize>,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn requests_per_second(&self) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs();
        if total_seconds > 0 {
            self.requests_sent as f64 / total_seconds as f64
        } else {
            0.0
        }
    }
}

/// Collects and stores various statistics about the engine's operation.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    // Request-related metrics
    pub requests_enqueued: AtomicUsize,
    pub requests_sent: AtomicUsize,
    pub requests_succeeded: AtomicUsize,
    pub requests_failed: AtomicUsize,
    pub requests_ignored: AtomicUsize,
    pub requests_skipped: AtomicUsize,
    pub requests_cancelled: AtomicUsize,

    // Response-related metrics
    #[serde(skip)]
    pub response_status_counts: Arc<dashmap::DashMap<u16, usize>>,

    // Item-related metrics
    pub item_success: AtomicUsize,
    pub item_error: AtomicUsize,
    pub item_ignore: AtomicUsize,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters initialized to zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            requests_sent: AtomicUsize::new(0),
            requests_succeeded: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            requests_ignored: AtomicUsize::new(0),
            requests_skipped: AtomicUsize::new(0),
            requests_cancelled: AtomicUsize::new(0),
            response_status_counts: Arc::new(dashmap::DashMap::new()),
            item_success: AtomicUsize::new(0),
            item_error: AtomicUsize::new(0),
            item_ignore: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut status_counts: HashMap<u16, usize> = HashMap::new();
        for entry in self.response_status_counts.iter() {
            let (key, value) = entry.pair();
            status_counts.insert(*key, *value);
        }

        StatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            requests_sent: self.requests_sent.load(Ordering::SeqCst),
            requests_succeeded: self.requests_succeeded.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            requests_ignored: self.requests_ignored.load(Ordering::SeqCst),
            requests_skipped: self.requests_skipped.load(Ordering::SeqCst),
            requests_cancelled: self.requests_cancelled.load(Ordering::SeqCst),
            item_success: self.item_success.load(Ordering::SeqCst),
            item_error: self.item_error.load(Ordering::SeqCst),
            item_ignore: self.item_ignore.load(Ordering::SeqCst),
            response_status_counts: status_counts,
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_succeeded(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_ignored(&self) {
        self.requests_ignored.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_skipped(&self) {
        self.requests_skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response_status(&self, status_code: u16) {
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
    }

    pub(crate) fn increment_item_success(&self) {
        self.item_success.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_item_error(&self) {
        self.item_error.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_item_ignore(&self) {
        self.item_ignore.fetch_add(1, Ordering::SeqCst);
    }

    /// Converts the current statistics into a JSON string.
    pub fn to_json_string(&self) -> Result<String, crate::error::CrawlError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", snapshot.elapsed_duration)?;
        writeln!(f, "  speed    : req/s: {:.2}", snapshot.requests_per_second())?;
        writeln!(
            f,
            "  requests : enqueued: {}, sent: {}, ok: {}, fail: {}, ignored: {}, skipped: {}, cancelled: {}",
            snapshot.requests_enqueued,
            snapshot.requests_sent,
            snapshot.requests_succeeded,
            snapshot.requests_failed,
            snapshot.requests_ignored,
            snapshot.requests_skipped,
            snapshot.requests_cancelled
        )?;
        writeln!(
            f,
            "  items    : ok: {}, error: {}, ignored: {}",
            snapshot.item_success, snapshot.item_error, snapshot.item_ignore
        )?;

        let status_string = if snapshot.response_status_counts.is_empty() {
            "none".to_string()
        } else {
            snapshot
                .response_status_counts
                .iter()
                .map(|(code, count)| format!("{}: {}", code, count))
                .collect::<Vec<String>>()
                .join(", ")
        };

        writeln!(f, "  status   : {}\n", status_string)
    }
}
