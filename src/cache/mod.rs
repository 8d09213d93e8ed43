//! Two-Tier Bitmap Cache
//!
//! A bounded in-process tier of decoded bitmaps in front of a durable tier of
//! encoded bytes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Image Pipeline                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Memory Cache (RAM)            │  Durable Store              │
//! │  ┌──────────────────────────┐  │  ┌───────────────────────┐  │
//! │  │ LRU  Locator → Bitmap    │  │  │ key → encoded bytes   │  │
//! │  │ ≤ 80 MiB, ≤ 300 entries  │  │  │ (fs / in-memory)      │  │
//! │  └──────────────────────────┘  │  └───────────────────────┘  │
//! │         ▲ populate on hit ─────┴──────────┘                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The memory tier holds decoded, downsampled bitmaps. The durable tier holds
//! encoded bytes and is consulted only on a memory miss; its failures are
//! treated as misses.

mod durable;
mod entry;
mod fs;
mod memory;
mod proptest;

pub use durable::{DurableStore, DurableStoreStats, InMemoryDurableStore};
pub use entry::{CacheEntry, Locator};
pub use fs::{default_cache_dir, CleanupReport, FsDurableStore, FsStoreConfig};
pub use memory::{MemoryCache, MemoryCacheConfig, MemoryCacheStats};

/// Default memory tier cost ceiling (80 MiB)
pub const DEFAULT_MAX_COST_BYTES: u64 = 80 * 1024 * 1024;

/// Default memory tier entry ceiling
pub const DEFAULT_MAX_ENTRIES: usize = 300;

/// Default durable tier size limit (300 MiB)
pub const DEFAULT_DURABLE_MAX_BYTES: u64 = 300 * 1024 * 1024;

/// Default durable entry lifetime (7 days)
pub const DEFAULT_DURABLE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

// =============================================================================
// Tests
// =============================================================================
