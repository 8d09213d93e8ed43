//! Memory Cache - bounded in-process bitmap tier
//!
//! Process-wide key→bitmap store shared by every resource loader.
//!
//! # Design
//!
//! - A single `LruCache` behind a `parking_lot::Mutex`; `get` and `put` hold the lock only
//!   for map bookkeeping, never across I/O or decoding
//! - Two ceilings checked atomically with every insert: total estimated cost and entry count
//! - Eviction pops least-recently-used entries whole until both ceilings hold
//! - Values are reference-counted bitmaps, so eviction never invalidates a bitmap a caller
//!   already obtained

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::entry::{CacheEntry, Locator};
use super::{DEFAULT_MAX_COST_BYTES, DEFAULT_MAX_ENTRIES};
use crate::error::{Error, Result};
use crate::imaging::Bitmap;

/// Memory cache configuration
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Ceiling on the summed estimated cost of all entries
    pub max_cost_bytes: u64,
    /// Ceiling on the number of entries
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_cost_bytes: DEFAULT_MAX_COST_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl MemoryCacheConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_cost_bytes == 0 {
            return Err(Error::Config("max_cost_bytes must be non-zero".into()));
        }
        if self.max_entries == 0 {
            return Err(Error::Config("max_entries must be non-zero".into()));
        }
        Ok(())
    }
}

struct Inner {
    entries: LruCache<Locator, CacheEntry>,
    total_cost: u64,
}

/// Bounded LRU bitmap cache
pub struct MemoryCache {
    inner: Mutex<Inner>,
    config: MemoryCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Create a memory cache with default ceilings (80 MiB, 300 entries)
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_cost: 0,
            }),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a bitmap and mark it most recently used
    pub fn get(&self, locator: &Locator) -> Option<Bitmap> {
        let found = self
            .inner
            .lock()
            .entries
            .get(locator)
            .map(|entry| entry.bitmap().clone());

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Like [`MemoryCache::get`], but leaves the hit and miss counters alone
    pub fn get_uncounted(&self, locator: &Locator) -> Option<Bitmap> {
        self.inner
            .lock()
            .entries
            .get(locator)
            .map(|entry| entry.bitmap().clone())
    }

    /// Insert a bitmap with an explicit cost.
    ///
    /// Evicts least-recently-used entries until both ceilings hold. Returns `false`
    /// without touching the cache if `cost` alone exceeds the cost ceiling.
    pub fn put(&self, locator: Locator, bitmap: Bitmap, cost: u64) -> bool {
        self.insert(CacheEntry::new(locator, bitmap, cost))
    }

    /// Insert a bitmap costed by its row stride times height
    pub fn put_bitmap(&self, locator: Locator, bitmap: Bitmap) -> bool {
        self.insert(CacheEntry::from_bitmap(locator, bitmap))
    }

    fn insert(&self, entry: CacheEntry) -> bool {
        let cost = entry.cost();
        if cost > self.config.max_cost_bytes {
            debug!(
                "Not caching {}: cost {} exceeds ceiling {}",
                entry.locator(),
                cost,
                self.config.max_cost_bytes
            );
            return false;
        }

        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.put(entry.locator().clone(), entry) {
            inner.total_cost -= old.cost();
        }
        inner.total_cost += cost;

        // The new entry is most recently used, so it is popped last.
        while inner.total_cost > self.config.max_cost_bytes
            || inner.entries.len() > self.config.max_entries
        {
            match inner.entries.pop_lru() {
                Some((evicted, entry)) => {
                    inner.total_cost -= entry.cost();
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    trace!("Evicted {} (cost {})", evicted, entry.cost());
                }
                None => break,
            }
        }

        true
    }

    /// Remove a single entry
    pub fn remove(&self, locator: &Locator) -> Option<Bitmap> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop(locator)?;
        inner.total_cost -= entry.cost();
        Some(entry.bitmap().clone())
    }

    /// Check presence without touching recency
    pub fn contains(&self, locator: &Locator) -> bool {
        self.inner.lock().entries.contains(locator)
    }

    /// Drop every entry
    pub fn remove_all(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!("Memory cache cleared ({} entries)", dropped);
    }

    /// Summed cost of resident entries
    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCacheStats {
    /// Summed estimated cost in bytes
    pub total_cost: u64,
    /// Cost ceiling in bytes
    pub max_cost_bytes: u64,
    /// Number of entries
    pub entries: usize,
    /// Entry ceiling
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
}

impl MemoryCache {
    /// Get cache statistics
    pub fn stats(&self) -> MemoryCacheStats {
        let (total_cost, entries) = {
            let inner = self.inner.lock();
            (inner.total_cost, inner.entries.len())
        };
        MemoryCacheStats {
            total_cost,
            max_cost_bytes: self.config.max_cost_bytes,
            entries,
            max_entries: self.config.max_entries,
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
