//! Network Fetch Pool
//!
//! One shared HTTP client for every resource fetch. Concurrency is capped per
//! remote host with a semaphore per `host:port`, each request carries a fixed
//! timeout, and successful bodies are kept briefly in a small response cache.
//!
//! The pool does not deduplicate: two calls for the same locator make two
//! requests unless the response cache answers the second one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::{Client, Url};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use crate::cache::Locator;
use crate::error::{Error, Result};
use crate::{DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_REQUEST_TIMEOUT};

/// Source of raw encoded bytes for a locator
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// Retrieve the raw bytes behind `locator`
    async fn fetch_bytes(&self, locator: &Locator) -> Result<Bytes>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the fetch pool
#[derive(Debug, Clone)]
pub struct FetchPoolConfig {
    /// Concurrent requests allowed against one host
    pub max_connections_per_host: usize,

    /// Timeout applied to every request
    pub request_timeout: Duration,

    /// Response cache capacity; 0 disables it
    pub response_cache_entries: usize,

    /// Ceiling on the summed size of cached bodies. Larger bodies are not cached.
    pub response_cache_max_bytes: u64,

    /// How long a cached response may be served
    pub response_cache_ttl: Duration,

    /// User-Agent header sent with each request
    pub user_agent: String,
}

impl Default for FetchPoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            response_cache_entries: 64,
            response_cache_max_bytes: 16 * 1024 * 1024,
            response_cache_ttl: Duration::from_secs(60),
            user_agent: format!("artcache/{}", crate::VERSION),
        }
    }
}

impl FetchPoolConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_host == 0 {
            return Err(Error::Config(
                "max_connections_per_host must be non-zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Response Cache Entry
// =============================================================================

#[derive(Debug, Clone)]
struct CachedResponse {
    bytes: Bytes,
    expires_at: Instant,
}

impl CachedResponse {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

// =============================================================================
// Fetch Pool
// =============================================================================

/// Shared HTTP transport with per-host connection limits
pub struct FetchPool {
    config: FetchPoolConfig,
    client: Client,
    hosts: DashMap<String, Arc<Semaphore>>,
    responses: DashMap<Locator, CachedResponse>,
}

impl FetchPool {
    /// Create a new fetch pool
    pub fn new(config: FetchPoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.max_connections_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Arc::new(Self {
            config,
            client,
            hosts: DashMap::new(),
            responses: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &FetchPoolConfig {
        &self.config
    }

    /// Requests currently holding a slot for `host` (`host:port`)
    pub fn active_requests(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|s| self.config.max_connections_per_host - s.available_permits())
            .unwrap_or(0)
    }

    /// Number of cached responses, including expired ones not yet swept
    pub fn cached_responses(&self) -> usize {
        self.responses.len()
    }

    /// Summed size of cached bodies
    pub fn cached_response_bytes(&self) -> u64 {
        self.responses
            .iter()
            .map(|entry| entry.bytes.len() as u64)
            .sum()
    }

    /// Drop every cached response
    pub fn clear_response_cache(&self) {
        self.responses.clear();
    }

    async fn host_permit(&self, host: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_connections_per_host)))
            .clone();

        semaphore
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("Host limiter closed: {}", e)))
    }

    fn cached_response(&self, locator: &Locator) -> Option<Bytes> {
        if self.config.response_cache_entries == 0 {
            return None;
        }
        let entry = self.responses.get(locator)?;
        if entry.is_expired() {
            drop(entry);
            self.responses.remove(locator);
            return None;
        }
        Some(entry.bytes.clone())
    }

    fn store_response(&self, locator: &Locator, bytes: Bytes) {
        let capacity = self.config.response_cache_entries;
        let max_bytes = self.config.response_cache_max_bytes;
        let size = bytes.len() as u64;
        if capacity == 0 || size > max_bytes {
            return;
        }

        self.responses.remove(locator);
        let over = |pool: &Self| {
            pool.responses.len() >= capacity || pool.cached_response_bytes() + size > max_bytes
        };

        if over(self) {
            self.responses.retain(|_, entry| !entry.is_expired());
        }
        // Still over: drop arbitrary entries. This cache is a hint only.
        while over(self) {
            let victim = self.responses.iter().next().map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.responses.remove(&key);
                }
                None => break,
            }
        }

        self.responses.insert(
            locator.clone(),
            CachedResponse {
                bytes,
                expires_at: Instant::now() + self.config.response_cache_ttl,
            },
        );
    }

    fn classify(&self, locator: &Locator, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout {
                locator: locator.to_string(),
                timeout: self.config.request_timeout,
            }
        } else {
            Error::Transport {
                locator: locator.to_string(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl ByteFetcher for FetchPool {
    #[instrument(skip(self), fields(locator = %locator))]
    async fn fetch_bytes(&self, locator: &Locator) -> Result<Bytes> {
        if let Some(bytes) = self.cached_response(locator) {
            debug!("Response cache hit for {}", locator);
            return Ok(bytes);
        }

        let url = parse_url(locator)?;
        let host = host_key(&url);

        let permit = self.host_permit(&host).await?;
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(locator, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Fetch of {} failed with status {}", locator, status);
            return Err(Error::HttpStatus {
                locator: locator.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.classify(locator, e))?;
        drop(permit);

        debug!("Fetched {} bytes for {}", bytes.len(), locator);
        self.store_response(locator, bytes.clone());
        Ok(bytes)
    }
}

fn parse_url(locator: &Locator) -> Result<Url> {
    let url = Url::parse(locator.as_str())
        .map_err(|e| Error::InvalidLocator(format!("{}: {}", locator, e)))?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(Error::InvalidLocator(format!(
            "{}: only absolute http(s) URLs can be fetched",
            locator
        ))),
    }
}

/// Limiter key: `host:port`
fn host_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or_default()
    )
}

// =============================================================================
// Tests
// =============================================================================
