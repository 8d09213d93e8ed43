//! artcache CLI
//!
//! Resolves a list of image URLs through a full pipeline, one loader per URL,
//! and reports what each loader ended up showing.
//!
//! ```text
//! artcache [OPTIONS] <URL>...
//!
//!   https://img/cover-1.jpg   ok 600x600
//!   https://img/missing.jpg   failed
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use artcache::cache::default_cache_dir;
use artcache::{
    DownsampleConfig, DurableStore, FetchPoolConfig, FsDurableStore, FsStoreConfig,
    ImagePipeline, InMemoryDurableStore, MemoryCacheConfig, PipelineConfig,
};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// artcache - fetch, downsample and cache remote images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image URLs to resolve
    #[arg(required = true)]
    urls: Vec<String>,

    /// Durable cache directory
    #[arg(long, env = "ARTCACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Keep the durable tier in memory instead of on disk
    #[arg(long, env = "ARTCACHE_NO_DISK")]
    no_disk: bool,

    /// Wipe the durable cache directory before loading
    #[arg(long)]
    clear_disk: bool,

    /// Durable cache size limit in MiB
    #[arg(long, env = "ARTCACHE_DISK_LIMIT_MIB", default_value = "300")]
    disk_limit_mib: u64,

    /// Memory cache cost ceiling in MiB
    #[arg(long, env = "ARTCACHE_MEMORY_LIMIT_MIB", default_value = "80")]
    memory_limit_mib: u64,

    /// Memory cache entry ceiling
    #[arg(long, env = "ARTCACHE_MEMORY_ENTRIES", default_value = "300")]
    memory_entries: usize,

    /// Target longer edge in display points
    #[arg(long, env = "ARTCACHE_TARGET_DIMENSION", default_value = "300")]
    target_dimension: u32,

    /// Display pixels per point
    #[arg(long, env = "ARTCACHE_SCALE_FACTOR", default_value = "2.0")]
    scale_factor: f32,

    /// Concurrent requests per host
    #[arg(long, env = "ARTCACHE_MAX_CONNECTIONS_PER_HOST", default_value = "8")]
    max_connections_per_host: usize,

    /// Request timeout in seconds
    #[arg(long, env = "ARTCACHE_REQUEST_TIMEOUT_SECONDS", default_value = "15")]
    request_timeout_seconds: u64,

    /// Resolve the URL set this many times (later rounds hit the caches)
    #[arg(long, default_value = "1")]
    repeat: usize,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            memory: MemoryCacheConfig {
                max_cost_bytes: self.memory_limit_mib * 1024 * 1024,
                max_entries: self.memory_entries,
            },
            fetch: FetchPoolConfig {
                max_connections_per_host: self.max_connections_per_host,
                request_timeout: Duration::from_secs(self.request_timeout_seconds),
                ..Default::default()
            },
            downsample: DownsampleConfig {
                target_dimension: self.target_dimension,
                scale_factor: self.scale_factor,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting artcache {}", artcache::VERSION);

    let durable = open_durable_store(&args).await?;
    let pipeline = ImagePipeline::new(args.pipeline_config(), durable)
        .context("failed to build image pipeline")?;

    for round in 1..=args.repeat.max(1) {
        if args.repeat > 1 {
            println!("round {}", round);
        }
        run_round(&pipeline, &args.urls).await;
    }

    let metrics = pipeline.metrics();
    println!(
        "memory: {} entries, {} bytes | fetches: {} started, {} joined, {} failed | durable: {} hits, {} misses",
        metrics.memory_entries,
        metrics.memory_cost_bytes,
        metrics.fetches_started,
        metrics.fetches_joined,
        metrics.fetches_failed,
        metrics.durable_hits,
        metrics.durable_misses,
    );

    if args.print_metrics {
        print!("{}", pipeline.encode_metrics()?);
    }

    Ok(())
}

async fn open_durable_store(args: &Args) -> anyhow::Result<Arc<dyn DurableStore>> {
    if args.no_disk {
        info!("Durable tier kept in memory");
        return Ok(Arc::new(InMemoryDurableStore::new()));
    }

    let config = FsStoreConfig {
        directory: args.cache_dir.clone().unwrap_or_else(default_cache_dir),
        max_bytes: args.disk_limit_mib * 1024 * 1024,
        ..Default::default()
    };
    info!("Durable cache at {}", config.directory.display());

    let store = FsDurableStore::new(config).context("invalid durable cache settings")?;

    if args.clear_disk {
        store
            .clear()
            .await
            .context("failed to clear durable cache")?;
        info!("Durable cache cleared");
    } else {
        match store.cleanup().await {
            Ok(report) => info!(
                "Durable cleanup: {} expired, {} evicted, {} bytes in use",
                report.expired, report.evicted, report.remaining_bytes
            ),
            Err(e) => warn!("Durable cleanup failed: {}", e),
        }
    }

    Ok(Arc::new(store))
}

/// Load every URL on its own loader and wait for all of them to settle
async fn run_round(pipeline: &Arc<ImagePipeline>, urls: &[String]) {
    let started = Instant::now();

    let loaders: Vec<_> = urls
        .iter()
        .map(|url| {
            let loader = pipeline.loader();
            loader.load_url(url);
            loader
        })
        .collect();

    let states = futures::future::join_all(loaders.iter().map(|l| l.settle())).await;

    let width = urls.iter().map(|u| u.len()).max().unwrap_or(0);
    for (url, state) in urls.iter().zip(states) {
        match state.bitmap {
            Some(bitmap) => println!(
                "  {:width$}  ok {}x{}",
                url,
                bitmap.width(),
                bitmap.height(),
                width = width
            ),
            None => println!("  {:width$}  failed", url, width = width),
        }
    }

    info!("Round finished in {:?}", started.elapsed());
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so stdout stays the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
