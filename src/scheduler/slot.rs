//! # Slot Rate Limiting
//!
//! Lazily created token-bucket limiters keyed by slot name.
//!
//! ## Overview
//!
//! Every request throttles under a named slot (default `"*"`). The first
//! request that names a slot creates its limiter with the concurrency and
//! interval derived from that request; later requests reusing the slot with
//! different parameters do not alter it (first-wins policy).
//!
//! A [`SlotLimiter`] pairs two gates:
//! - a concurrency gate capping simultaneously executing fetches at the
//!   slot's configured concurrency (the permit is held for the duration of
//!   the fetch), and
//! - token pacing granting one token every `interval / concurrency` with a
//!   burst of `concurrency`, when an interval is configured.
//!
//! Waits are interruptible: acquisition races the governing task's
//! cancellation token and fails with [`CrawlError::Cancelled`] without the
//! fetch ever starting.

use crate::error::CrawlError;
use crate::request::Request;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Grant held for the duration of one fetch; dropping it releases the
/// slot's concurrency gate.
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token-bucket limiter for one slot.
pub struct SlotLimiter {
    name: String,
    concurrency: u8,
    /// One token per this much time; `None` disables pacing.
    pace: Option<Duration>,
    gate: Arc<Semaphore>,
    bucket: Mutex<Bucket>,
}

impl SlotLimiter {
    fn new(name: &str, concurrency: u8, interval: Option<Duration>) -> Self {
        let concurrency = concurrency.max(1);
        let pace = interval
            .map(|interval| interval / u32::from(concurrency))
            .filter(|pace| !pace.is_zero());
        SlotLimiter {
            name: name.to_string(),
            concurrency,
            pace,
            gate: Arc::new(Semaphore::new(usize::from(concurrency))),
            bucket: Mutex::new(Bucket {
                tokens: u32::from(concurrency),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> u8 {
        self.concurrency
    }

    /// The pacing step between grants, when an interval is configured.
    pub fn pace(&self) -> Option<Duration> {
        self.pace
    }

    /// Blocks until a token is granted or the given context is cancelled.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SlotPermit, CrawlError> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.gate).acquire_owned() => {
                permit.map_err(|_| CrawlError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
        };

        if let Some(pace) = self.pace {
            loop {
                let wait = self.take_or_wait(pace);
                match wait {
                    None => break,
                    Some(wait) => {
                        trace!(slot = %self.name, wait_ms = wait.as_millis() as u64, "waiting for slot token");
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                        }
                    }
                }
            }
        }

        Ok(SlotPermit { _permit: permit })
    }

    /// Takes a token when one is available, otherwise returns the time until
    /// the next token matures.
    fn take_or_wait(&self, pace: Duration) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);

        let matured = (elapsed.as_nanos() / pace.as_nanos()) as u32;
        if matured > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(matured)
                .min(u32::from(self.concurrency));
            if bucket.tokens == u32::from(self.concurrency) {
                // A full bucket stops accruing; restart the clock so idle
                // time does not grant an oversized burst later.
                bucket.last_refill = now;
            } else {
                bucket.last_refill += pace * matured;
            }
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            None
        } else {
            let since = now.duration_since(bucket.last_refill);
            Some(pace.saturating_sub(since).max(Duration::from_millis(1)))
        }
    }
}

/// Concurrency-safe name→limiter mapping with atomic load-or-store
/// semantics: one limiter is ever created per slot name, even under
/// concurrent first access.
pub struct SlotRegistry {
    slots: DashMap<String, Arc<SlotLimiter>>,
    default_interval: Option<Duration>,
}

impl SlotRegistry {
    pub fn new(default_interval: Option<Duration>) -> Self {
        SlotRegistry {
            slots: DashMap::new(),
            default_interval,
        }
    }

    /// Fetches the limiter for the request's slot, creating it from the
    /// request's concurrency/interval on first access. Parameters are fixed
    /// at creation (first-wins).
    pub fn load_or_store(&self, request: &Request) -> Arc<SlotLimiter> {
        let name = request.slot_or_default();
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| {
                let concurrency = request.effective_concurrency();
                let interval = request.interval.or(self.default_interval);
                debug!(
                    slot = name,
                    concurrency,
                    interval_ms = interval.map(|i| i.as_millis() as u64),
                    "creating slot limiter"
                );
                Arc::new(SlotLimiter::new(name, concurrency, interval))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_for(slot: &str, concurrency: u8, interval: Option<Duration>) -> Request {
        let mut request = Request::parse("https://example.com/")
            .unwrap()
            .with_slot(slot)
            .with_concurrency(concurrency);
        request.interval = interval;
        request
    }

    #[tokio::test]
    async fn concurrency_gate_caps_simultaneous_grants() {
        tokio::time::pause();

        let limiter = SlotLimiter::new("s1", 2, None);
        let cancel = CancellationToken::new();

        let first = limiter.acquire(&cancel).await.unwrap();
        let _second = limiter.acquire(&cancel).await.unwrap();

        // Third grant must wait for a permit to come back.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&cancel)).await;
        assert!(blocked.is_err(), "third grant should block");

        drop(first);
        let third =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&cancel)).await;
        assert!(third.is_ok_and(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn pacing_spaces_grants_after_the_burst() {
        tokio::time::pause();

        let limiter = SlotLimiter::new("s1", 2, Some(Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        // Burst of two, immediately; permits dropped so only pacing gates.
        drop(limiter.acquire(&cancel).await.unwrap());
        drop(limiter.acquire(&cancel).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(10));

        // Third token matures one pace step (1s / 2) later.
        drop(limiter.acquire(&cancel).await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn five_submissions_on_concurrency_two_never_overlap_more_than_two() {
        tokio::time::pause();

        let limiter = Arc::new(SlotLimiter::new("s1", 2, Some(Duration::from_secs(1))));
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let permit = limiter.acquire(&cancel).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "slot concurrency exceeded");
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_wait() {
        tokio::time::pause();

        let limiter = Arc::new(SlotLimiter::new("s1", 1, None));
        let cancel = CancellationToken::new();

        let held = limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CrawlError::Cancelled)));
        drop(held);
    }

    #[tokio::test]
    async fn registry_parameters_are_first_wins() {
        let registry = SlotRegistry::new(None);

        let first = registry.load_or_store(&request_for(
            "api",
            2,
            Some(Duration::from_secs(1)),
        ));
        let second = registry.load_or_store(&request_for("api", 9, None));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.concurrency(), 2);
        assert_eq!(second.pace(), Some(Duration::from_millis(500)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn distinct_slots_get_distinct_limiters() {
        let registry = SlotRegistry::new(None);
        let a = registry.load_or_store(&request_for("a", 1, None));
        let b = registry.load_or_store(&request_for("b", 1, None));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }
}
