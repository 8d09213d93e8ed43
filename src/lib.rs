//! artcache - Image Acquisition and Caching Pipeline
//!
//! Serves remote bitmaps (cover art, avatars, thumbnails) to high-churn scrolling
//! UIs that issue many overlapping, rapidly superseded requests.
//!
//! # Architecture
//!
//! ```text
//! ResourceLoader ×N            (one per requester, generation counter)
//!        │
//!        ▼
//! MemoryCache                  (LRU, ≤ 80 MiB, ≤ 300 entries)
//!        │ miss
//!        ▼
//! DurableStore                 (fs or in-memory; failures are misses)
//!        │ miss
//!        ▼
//! FetchCoordinator             (single flight per locator)
//!        │
//!        ▼
//! FetchPool ──▶ Downsampler    (8 per host, 15 s timeout)
//! ```
//!
//! Guarantees:
//!
//! - Memory stays under both cache ceilings
//! - At most one network fetch per locator is in flight, however many loaders ask
//! - A loader only ever shows the result for the locator it last requested
//!
//! # Modules
//!
//! - [`cache`] - Memory cache, locator type and durable stores
//! - [`error`] - Error types
//! - [`fetch`] - Single-flight fetch coordinator
//! - [`imaging`] - Bitmap type and downsampler
//! - [`loader`] - Per-requester resource loader
//! - [`metrics`] - Prometheus instruments
//! - [`net`] - HTTP fetch pool
//! - [`pipeline`] - Application-lifetime owner of the shared components

use std::time::Duration;

pub mod cache;
pub mod error;
pub mod fetch;
pub mod imaging;
pub mod loader;
pub mod metrics;
pub mod net;
pub mod pipeline;

// Re-export commonly used types
pub use cache::{
    DurableStore, FsDurableStore, FsStoreConfig, InMemoryDurableStore, Locator, MemoryCache,
    MemoryCacheConfig,
};
pub use error::{Error, FetchFailure, Result};
pub use fetch::{FetchCoordinator, FetchOutcome};
pub use imaging::{Bitmap, DownsampleConfig, Downsampler};
pub use loader::{LoadOutcome, LoaderEvent, ResourceLoader};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use net::{ByteFetcher, FetchPool, FetchPoolConfig};
pub use pipeline::{ImagePipeline, PipelineConfig, Resolved, Tier};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default longer-edge target, in display points
pub const DEFAULT_TARGET_DIMENSION: u32 = 300;

/// Default display pixels per point
pub const DEFAULT_SCALE_FACTOR: f32 = 2.0;

/// Default concurrent requests per remote host
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 8;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Tests
// =============================================================================
