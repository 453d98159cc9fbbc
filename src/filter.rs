//! Duplicate filter shared by the dispatcher and the filter pipeline.
//!
//! Backed by a bounded in-memory cache; a key evicted under memory pressure
//! may be admitted again, which trades exactness for a hard memory ceiling.

use moka::sync::Cache;

const DEFAULT_FILTER_CAPACITY: u64 = 100_000;

/// Records unique keys with atomic exists-or-store semantics.
pub struct Filter {
    seen: Cache<String, ()>,
}

impl Filter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FILTER_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Filter {
            seen: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Stores the key and reports whether it was already present. One caller
    /// wins under concurrent first access.
    pub fn exists_or_store(&self, key: &str) -> bool {
        let entry = self.seen.entry(key.to_string()).or_insert(());
        !entry.is_fresh()
    }

    /// Whether the key has been recorded.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}
