//! Image Pipeline - application-lifetime owner of the shared components
//!
//! Builds and owns the memory cache, durable store handle, fetch coordinator and
//! metrics, and hands out [`ResourceLoader`]s that share them.
//!
//! Resolution order for a locator:
//!
//! 1. Memory cache (hit returns immediately)
//! 2. Durable store (bytes decoded on a blocking worker, memory cache populated)
//! 3. Fetch coordinator (joins or starts the single network fetch)

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use crate::cache::{DurableStore, Locator, MemoryCache, MemoryCacheConfig};
use crate::error::{Error, FetchFailure, Result};
use crate::fetch::FetchCoordinator;
use crate::imaging::{Bitmap, DownsampleConfig, Downsampler};
use crate::loader::ResourceLoader;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::net::{ByteFetcher, FetchPool, FetchPoolConfig};

/// Tier a resolution was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// In-process bitmap cache
    Memory,
    /// Durable byte store
    Durable,
    /// Coordinated network fetch
    Network,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Durable => write!(f, "durable"),
            Tier::Network => write!(f, "network"),
        }
    }
}

/// A resolved bitmap and where it came from
#[derive(Debug, Clone)]
pub struct Resolved {
    pub bitmap: Bitmap,
    pub tier: Tier,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Memory cache ceilings
    pub memory: MemoryCacheConfig,
    /// Network transport settings
    pub fetch: FetchPoolConfig,
    /// Downsampling target
    pub downsample: DownsampleConfig,
    /// Buffered events per loader before slow subscribers start lagging
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            memory: MemoryCacheConfig::default(),
            fetch: FetchPoolConfig::default(),
            downsample: DownsampleConfig::default(),
            event_capacity: 16,
        }
    }
}

impl PipelineConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.fetch.validate()?;
        self.downsample.validate()?;
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Shared image acquisition and caching pipeline
pub struct ImagePipeline {
    config: PipelineConfig,
    memory: Arc<MemoryCache>,
    durable: Arc<dyn DurableStore>,
    coordinator: FetchCoordinator,
    downsampler: Downsampler,
    metrics: Arc<PipelineMetrics>,
    runtime: Handle,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ImagePipeline {
    /// Create a pipeline fetching over HTTP.
    ///
    /// Must be called from within a Tokio runtime; that runtime runs every fetch
    /// and loader task.
    pub fn new(config: PipelineConfig, durable: Arc<dyn DurableStore>) -> Result<Arc<Self>> {
        let pool = FetchPool::new(config.fetch.clone())?;
        Self::with_fetcher(config, pool, durable)
    }

    /// Create a pipeline with a custom byte source
    pub fn with_fetcher(
        config: PipelineConfig,
        fetcher: Arc<dyn ByteFetcher>,
        durable: Arc<dyn DurableStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("ImagePipeline needs a Tokio runtime: {}", e)))?;

        let memory = Arc::new(MemoryCache::with_config(config.memory.clone()));
        let metrics = Arc::new(PipelineMetrics::new()?);
        let downsampler = Downsampler::new(config.downsample.clone());
        let coordinator = FetchCoordinator::new(
            fetcher,
            downsampler.clone(),
            memory.clone(),
            durable.clone(),
            metrics.clone(),
            runtime.clone(),
        );

        Ok(Arc::new(Self {
            config,
            memory,
            durable,
            coordinator,
            downsampler,
            metrics,
            runtime,
        }))
    }

    /// Create a loader bound to this pipeline
    pub fn loader(self: &Arc<Self>) -> ResourceLoader {
        ResourceLoader::new(self.clone())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache> {
        &self.memory
    }

    pub fn durable_store(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.coordinator
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn instruments(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Drop every memory-cached bitmap. Bitmaps already handed out stay valid.
    pub fn clear_memory_cache(&self) {
        self.memory.remove_all();
    }

    /// Resolve a locator through memory, durable store and network in turn
    #[instrument(skip(self), fields(locator = %locator))]
    pub async fn resolve(&self, locator: &Locator) -> std::result::Result<Resolved, FetchFailure> {
        if let Some(bitmap) = self.memory.get(locator) {
            return Ok(Resolved {
                bitmap,
                tier: Tier::Memory,
            });
        }

        if let Some(bitmap) = self.load_durable(locator).await {
            return Ok(Resolved {
                bitmap,
                tier: Tier::Durable,
            });
        }

        let bitmap = self.coordinator.fetch(locator).await?;
        Ok(Resolved {
            bitmap,
            tier: Tier::Network,
        })
    }

    /// Durable lookup; every failure along the way is a miss
    async fn load_durable(&self, locator: &Locator) -> Option<Bitmap> {
        let bytes = match self.durable.get_bytes(locator.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.metrics.record_durable_miss();
                return None;
            }
            Err(e) => {
                warn!("Durable read failed for {}: {}", locator, e);
                self.metrics.record_durable_miss();
                return None;
            }
        };

        let downsampler = self.downsampler.clone();
        let decoded = tokio::task::spawn_blocking(move || downsampler.downsample(&bytes)).await;

        match decoded {
            Ok(Some(bitmap)) => {
                debug!("Durable hit for {}", locator);
                self.metrics.record_durable_hit();
                self.memory.put_bitmap(locator.clone(), bitmap.clone());
                Some(bitmap)
            }
            Ok(None) => {
                debug!("Discarding undecodable durable entry for {}", locator);
                self.metrics.record_durable_miss();
                if let Err(e) = self.durable.remove(locator.as_str()).await {
                    warn!("Failed to remove durable entry for {}: {}", locator, e);
                }
                None
            }
            Err(e) => {
                warn!("Durable decode task failed for {}: {}", locator, e);
                self.metrics.record_durable_miss();
                None
            }
        }
    }

    /// Current metrics, with memory-tier figures refreshed
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.observe_memory(&self.memory.stats());
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of the current metrics
    pub fn encode_metrics(&self) -> Result<String> {
        self.metrics.observe_memory(&self.memory.stats());
        self.metrics.encode_text()
    }
}

// =============================================================================
// Tests
// =============================================================================
