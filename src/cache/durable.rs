//! Durable Store - persistent tier interface
//!
//! The pipeline only talks to the durable tier through [`DurableStore`]. Keys are
//! locator strings; values are encoded image bytes.
//!
//! # Design
//!
//! - Async trait so implementations can do file or network I/O without blocking
//! - Errors are reported, but callers treat every failure as a miss
//! - Pluggable backend (filesystem, in-memory)

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Result;

/// Durable cache backend
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the bytes stored under `key`
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store `data` under `key`, replacing any previous value
    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()>;

    /// Remove `key`. Returns whether it was present.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// Get store statistics
    fn stats(&self) -> DurableStoreStats;
}

/// Durable store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableStoreStats {
    /// Entries currently stored, where the backend tracks it
    pub entry_count: u64,
    /// Bytes currently stored, where the backend tracks it
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Reads that found a live entry
    pub hits: u64,
    /// Write operations
    pub writes: u64,
    /// Remove operations
    pub removes: u64,
}

/// In-memory durable store for tests and disk-less runs
#[derive(Default)]
pub struct InMemoryDurableStore {
    storage: DashMap<String, Bytes>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Check presence without counting a read
    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let found = self.storage.get(key).map(|data| data.clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = data.len() as u64;
        match self.storage.insert(key.to_string(), data) {
            Some(old) => {
                self.total_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
            None => {
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.removes.fetch_add(1, Ordering::Relaxed);

        match self.storage.remove(key) {
            Some((_, data)) => {
                self.total_bytes
                    .fetch_sub(data.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> DurableStoreStats {
        DurableStoreStats {
            entry_count: self.storage.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
