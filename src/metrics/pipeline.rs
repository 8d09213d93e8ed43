//! Pipeline Metrics
//!
//! Prometheus counters and gauges for one [`ImagePipeline`](crate::ImagePipeline),
//! registered on a registry owned by the pipeline rather than the process-global one,
//! so several pipelines (and tests) never collide.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::MemoryCacheStats;
use crate::error::{Error, Result};

/// Metric name prefix
const NAMESPACE: &str = "artcache";

/// Point-in-time copy of every pipeline metric
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub memory_evictions: u64,
    pub memory_cost_bytes: u64,
    pub memory_entries: u64,
    pub durable_hits: u64,
    pub durable_misses: u64,
    pub durable_write_failures: u64,
    pub fetches_started: u64,
    pub fetches_joined: u64,
    pub fetches_failed: u64,
    pub stale_discarded: u64,
}

/// Prometheus instruments for the image pipeline
pub struct PipelineMetrics {
    registry: Registry,

    memory_hits: IntCounter,
    memory_misses: IntCounter,
    memory_evictions: IntCounter,
    memory_cost_bytes: IntGauge,
    memory_entries: IntGauge,

    durable_hits: IntCounter,
    durable_misses: IntCounter,
    durable_write_failures: IntCounter,

    fetches_started: IntCounter,
    fetches_joined: IntCounter,
    fetches_failed: IntCounter,

    stale_discarded: IntCounter,
}

impl PipelineMetrics {
    /// Create the instruments and register them on a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            memory_hits: counter(&registry, "memory_hits_total", "Memory cache hits")?,
            memory_misses: counter(&registry, "memory_misses_total", "Memory cache misses")?,
            memory_evictions: counter(
                &registry,
                "memory_evictions_total",
                "Entries evicted from the memory cache",
            )?,
            memory_cost_bytes: gauge(
                &registry,
                "memory_cost_bytes",
                "Estimated bytes held by the memory cache",
            )?,
            memory_entries: gauge(&registry, "memory_entries", "Entries in the memory cache")?,
            durable_hits: counter(&registry, "durable_hits_total", "Durable store hits")?,
            durable_misses: counter(
                &registry,
                "durable_misses_total",
                "Durable store misses, including swallowed read failures",
            )?,
            durable_write_failures: counter(
                &registry,
                "durable_write_failures_total",
                "Failed durable store writes",
            )?,
            fetches_started: counter(
                &registry,
                "fetches_started_total",
                "Network fetches started by the coordinator",
            )?,
            fetches_joined: counter(
                &registry,
                "fetches_joined_total",
                "Requests attached to an already in-flight fetch",
            )?,
            fetches_failed: counter(
                &registry,
                "fetches_failed_total",
                "Coordinated fetches that ended in failure",
            )?,
            stale_discarded: counter(
                &registry,
                "stale_results_discarded_total",
                "Results dropped because the loader target changed",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_durable_hit(&self) {
        self.durable_hits.inc();
    }

    pub fn record_durable_miss(&self) {
        self.durable_misses.inc();
    }

    pub fn record_durable_write_failure(&self) {
        self.durable_write_failures.inc();
    }

    pub fn record_fetch_started(&self) {
        self.fetches_started.inc();
    }

    pub fn record_fetch_joined(&self) {
        self.fetches_joined.inc();
    }

    pub fn record_fetch_failed(&self) {
        self.fetches_failed.inc();
    }

    pub fn record_stale_discarded(&self) {
        self.stale_discarded.inc();
    }

    /// Bring memory-tier instruments in line with the cache's own counters
    pub fn observe_memory(&self, stats: &MemoryCacheStats) {
        advance(&self.memory_hits, stats.hits);
        advance(&self.memory_misses, stats.misses);
        advance(&self.memory_evictions, stats.evictions);
        self.memory_cost_bytes
            .set(i64::try_from(stats.total_cost).unwrap_or(i64::MAX));
        self.memory_entries
            .set(i64::try_from(stats.entries).unwrap_or(i64::MAX));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.memory_hits.get(),
            memory_misses: self.memory_misses.get(),
            memory_evictions: self.memory_evictions.get(),
            memory_cost_bytes: self.memory_cost_bytes.get().max(0) as u64,
            memory_entries: self.memory_entries.get().max(0) as u64,
            durable_hits: self.durable_hits.get(),
            durable_misses: self.durable_misses.get(),
            durable_write_failures: self.durable_write_failures.get(),
            fetches_started: self.fetches_started.get(),
            fetches_joined: self.fetches_joined.get(),
            fetches_failed: self.fetches_failed.get(),
            stale_discarded: self.stale_discarded.get(),
        }
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Counters only move forward; a lower total (after a cache reset) is ignored.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_stats(hits: u64, misses: u64, evictions: u64) -> MemoryCacheStats {
        MemoryCacheStats {
            total_cost: 4096,
            max_cost_bytes: 80 * 1024 * 1024,
            entries: 3,
            max_entries: 300,
            hits,
            misses,
            hit_ratio: 0.0,
            evictions,
        }
    }

    #[test]
    fn test_new_metrics_are_zero() {
        let metrics = PipelineMetrics::new().unwrap();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_counters() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_fetch_started();
        metrics.record_fetch_joined();
        metrics.record_fetch_joined();
        metrics.record_fetch_failed();
        metrics.record_durable_hit();
        metrics.record_durable_miss();
        metrics.record_durable_write_failure();
        metrics.record_stale_discarded();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetches_started, 1);
        assert_eq!(snapshot.fetches_joined, 2);
        assert_eq!(snapshot.fetches_failed, 1);
        assert_eq!(snapshot.durable_hits, 1);
        assert_eq!(snapshot.durable_misses, 1);
        assert_eq!(snapshot.durable_write_failures, 1);
        assert_eq!(snapshot.stale_discarded, 1);
    }

    #[test]
    fn test_observe_memory_is_monotonic() {
        let metrics = PipelineMetrics::new().unwrap();

        metrics.observe_memory(&memory_stats(5, 2, 1));
        metrics.observe_memory(&memory_stats(3, 2, 1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.memory_hits, 5);
        assert_eq!(snapshot.memory_misses, 2);
        assert_eq!(snapshot.memory_evictions, 1);
        assert_eq!(snapshot.memory_cost_bytes, 4096);
        assert_eq!(snapshot.memory_entries, 3);
    }

    #[test]
    fn test_encode_text() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_fetch_started();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("artcache_fetches_started_total 1"));
        assert!(text.contains("# HELP artcache_memory_cost_bytes"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.record_stale_discarded();

        assert_eq!(a.snapshot().stale_discarded, 1);
        assert_eq!(b.snapshot().stale_discarded, 0);
    }
}
