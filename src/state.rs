//! # State Module
//!
//! Reference-counting completion tracking for the units a crawl produces.
//!
//! ## Overview
//!
//! Every class of unit (requests, items) is tracked by a [`StateCounter`]
//! exposing three signals: `close` (the seeding producer declares that no
//! further units will arrive from outside), `enter` (one unit began), and
//! `leave` (one unit finished). Two or more counters compose into a
//! [`MultiState`], which invokes a registered completion callback exactly
//! once, the instant every composed counter has been closed and the combined
//! count across all of them is zero.
//!
//! ## Protocol
//!
//! Correct completion detection relies on the reference-counting discipline
//! observed by the engine: any unit spawned from within another unit calls
//! `enter` before its parent calls `leave`. Under that discipline the
//! combined count can only reach zero once all transitively spawned work has
//! finished, so "all closed and combined count zero" is a stable condition.
//!
//! Completion evaluation takes a consistent snapshot by locking all composed
//! counters in registration order; exactly-once firing is guarded by an
//! atomic swap, so arbitrary interleavings of concurrent `enter`/`leave`/
//! `close` calls can neither double-fire nor miss the firing edge.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct Counts {
    count: usize,
    closed: bool,
}

/// Tracks the in-flight count for one class of unit.
#[derive(Default)]
pub struct StateCounter {
    counts: Mutex<Counts>,
    watchers: Mutex<Vec<Arc<MultiStateInner>>>,
}

impl StateCounter {
    /// Creates a new, atomically reference-counted counter.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declares that the seeding producer will submit no further units.
    ///
    /// Closing is idempotent and triggers a completion evaluation, so a
    /// counter that is already drained completes without any further signal.
    pub fn close(&self) {
        self.counts.lock().closed = true;
        self.notify();
    }

    /// Records that one unit began.
    pub fn enter(&self) {
        self.counts.lock().count += 1;
        self.notify();
    }

    /// Records that one unit finished.
    pub fn leave(&self) {
        {
            let mut counts = self.counts.lock();
            if counts.count == 0 {
                warn!("state counter leave() without a matching enter()");
            } else {
                counts.count -= 1;
            }
        }
        self.notify();
    }

    /// The current number of in-flight units.
    pub fn count(&self) -> usize {
        self.counts.lock().count
    }

    /// Whether the producer has declared the counter closed.
    pub fn is_closed(&self) -> bool {
        self.counts.lock().closed
    }

    fn notify(&self) {
        let watchers = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.evaluate();
        }
    }
}

struct MultiStateInner {
    counters: Vec<Arc<StateCounter>>,
    fired: AtomicBool,
    on_drained: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MultiStateInner {
    fn evaluate(&self) {
        // Lock every counter in registration order so the snapshot is
        // consistent across the whole composition.
        let guards: Vec<_> = self.counters.iter().map(|c| c.counts.lock()).collect();
        let drained =
            guards.iter().all(|g| g.closed) && guards.iter().map(|g| g.count).sum::<usize>() == 0;
        drop(guards);

        if drained && !self.fired.swap(true, Ordering::SeqCst) {
            trace!("all state counters closed and drained, firing completion");
            if let Some(callback) = self.on_drained.lock().take() {
                callback();
            }
        }
    }
}

/// A composition of two or more [`StateCounter`]s with an exactly-once
/// completion callback.
pub struct MultiState {
    inner: Arc<MultiStateInner>,
}

impl MultiState {
    /// Composes the given counters. Every subsequent mutation of any of them
    /// re-evaluates the completion condition.
    pub fn compose(counters: Vec<Arc<StateCounter>>) -> Self {
        let inner = Arc::new(MultiStateInner {
            counters: counters.clone(),
            fired: AtomicBool::new(false),
            on_drained: Mutex::new(None),
        });
        for counter in &counters {
            counter.watchers.lock().push(Arc::clone(&inner));
        }
        MultiState { inner }
    }

    /// Registers the completion callback. Fires exactly once, the instant
    /// every composed counter is closed and the combined count is zero.
    pub fn on_drained(&self, callback: impl FnOnce() + Send + 'static) {
        *self.inner.on_drained.lock() = Some(Box::new(callback));
        // The composition may already be drained by the time the callback is
        // registered.
        self.inner.evaluate();
    }

    /// Whether the completion callback has fired.
    pub fn is_drained(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_once_when_closed_and_zero() {
        let requests = StateCounter::new();
        let items = StateCounter::new();
        let multi = MultiState::compose(vec![requests.clone(), items.clone()]);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        multi.on_drained(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        requests.enter();
        requests.close();
        items.close();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "one request still running");

        requests.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn does_not_fire_before_all_closed() {
        let requests = StateCounter::new();
        let items = StateCounter::new();
        let multi = MultiState::compose(vec![requests.clone(), items.clone()]);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        multi.on_drained(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        requests.close();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "items not yet closed");
        items.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_when_callback_registered_after_drain() {
        let requests = StateCounter::new();
        let items = StateCounter::new();
        let multi = MultiState::compose(vec![requests.clone(), items.clone()]);

        requests.close();
        items.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        multi.on_drained(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn leave_without_enter_saturates() {
        let counter = StateCounter::new();
        counter.leave();
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn concurrent_enters_and_leaves_fire_exactly_once() {
        let requests = StateCounter::new();
        let items = StateCounter::new();
        let multi = MultiState::compose(vec![requests.clone(), items.clone()]);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        multi.on_drained(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Seed one unit per worker before closing, mirroring the dispatch
        // protocol where children enter before their parent leaves.
        let workers = 16;
        for _ in 0..workers {
            requests.enter();
        }
        requests.close();
        items.close();

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let requests = requests.clone();
                let items = items.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        items.enter();
                        items.leave();
                    }
                    requests.leave();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(requests.count(), 0);
        assert_eq!(items.count(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
