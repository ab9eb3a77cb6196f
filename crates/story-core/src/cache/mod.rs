//! Key/value store with per-entry TTL and prefix invalidation.
//!
//! Entries live in a `BTreeMap` ordered by [`CacheKey`], so invalidating a
//! project, a category or a path prefix walks one contiguous range instead of
//! scanning every key. Every mutation completes within a single call; readers
//! never observe a half-applied invalidation.

mod clock;
mod key;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{CacheCategory, CacheKey, KeyParseError, KeyPrefix};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use web_time::Instant;

/// Per-category TTLs and the store's capacity.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub file_content_ttl: Duration,
    pub file_history_ttl: Duration,
    pub repository_status_ttl: Duration,
    pub project_tree_ttl: Duration,
    pub project_branches_ttl: Duration,
    /// Maximum number of live entries before the oldest is evicted.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            file_content_ttl: Duration::from_secs(5 * 60),
            file_history_ttl: Duration::from_secs(10 * 60),
            repository_status_ttl: Duration::from_secs(30),
            project_tree_ttl: Duration::from_secs(2 * 60),
            project_branches_ttl: Duration::from_secs(5 * 60),
            capacity: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::FileContent => self.file_content_ttl,
            CacheCategory::FileHistory => self.file_history_ttl,
            CacheCategory::RepositoryStatus => self.repository_status_ttl,
            CacheCategory::ProjectTree => self.project_tree_ttl,
            CacheCategory::ProjectBranches => self.project_branches_ttl,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// TTL cache keyed by [`CacheKey`].
///
/// Values are handed out as clones; the store keeps sole ownership of what it
/// holds.
pub struct CacheStore<V> {
    entries: BTreeMap<CacheKey, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            clock,
            capacity: capacity.max(1),
        }
    }

    /// Store backed by the wall clock.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(SystemClock), capacity)
    }

    /// Fetch a live value. An expired entry is removed and reported absent.
    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                debug!("Cache entry {} expired", key);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains(&mut self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace unconditionally; the last writer wins.
    pub fn set(&mut self, key: CacheKey, value: V, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.purge_expired();
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }

        let stored_at = self.clock.now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at,
                ttl,
            },
        );
    }

    /// Remove a single entry. Returns whether anything was removed.
    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry selected by `prefix`, leaving all others untouched.
    pub fn invalidate_prefix(&mut self, prefix: &KeyPrefix) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .range(prefix.lower_bound()..)
            .map(|(k, _)| k)
            .take_while(|k| prefix.matches(k))
            .cloned()
            .collect();

        for key in &doomed {
            self.entries.remove(key);
        }

        if !doomed.is_empty() {
            debug!("Invalidated {} cache entries under {}", doomed.len(), prefix);
        }
        doomed.len()
    }

    /// String form of [`invalidate_prefix`](Self::invalidate_prefix), using the
    /// `{projectId}:{category}:{path}` scheme.
    pub fn invalidate_pattern(&mut self, pattern: &str) -> Result<usize, KeyParseError> {
        let prefix: KeyPrefix = pattern.parse()?;
        Ok(self.invalidate_prefix(&prefix))
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries, including ones that expired but were not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        if let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(k, _)| k.clone())
        {
            debug!("Cache full, evicting {}", victim);
            self.entries.remove(&victim);
        }
    }
}
