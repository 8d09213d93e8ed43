//! Fetch Coordinator - single-flight network resolution
//!
//! At most one network fetch per locator is outstanding at any time. The first
//! requester registers a shared channel and spawns the fetch; later requesters
//! clone that channel and wait on the same result.
//!
//! ```text
//!            fetch(L)                          fetch(L)
//!   Idle ──────────────► In-flight ◄───────────────────── join
//!    ▲                       │
//!    │  entry removed,       │ fetch_bytes → downsample → memory put
//!    └── then result sent ◄──┘                (durable write spawned)
//! ```
//!
//! A successful fetch populates the memory cache, then removes its registry entry,
//! then sends the result. A request that finds no entry checks the memory cache
//! under the registry lock before starting a fetch, so it never attaches to a
//! finished fetch and never repeats one that just succeeded. Dropping a returned future never cancels the fetch; it runs to
//! completion for the benefit of every other requester and of the caches.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use super::guard::CallOnDrop;
use crate::cache::{DurableStore, Locator, MemoryCache};
use crate::error::{Error, FetchFailure};
use crate::imaging::{Bitmap, Downsampler, DURABLE_JPEG_QUALITY};
use crate::metrics::PipelineMetrics;
use crate::net::ByteFetcher;

/// Result delivered to every requester attached to one fetch
pub type FetchOutcome = std::result::Result<Bitmap, FetchFailure>;

type FetchChannel = Shared<oneshot::Receiver<FetchOutcome>>;

/// Everything a spawned fetch needs, detached from the coordinator's lifetime
#[derive(Clone)]
struct FetchContext {
    fetcher: Arc<dyn ByteFetcher>,
    downsampler: Downsampler,
    memory: Arc<MemoryCache>,
    durable: Arc<dyn DurableStore>,
    metrics: Arc<PipelineMetrics>,
    runtime: Handle,
}

/// Deduplicates network fetches across all loaders
pub struct FetchCoordinator {
    context: FetchContext,
    in_flight: Arc<Mutex<HashMap<Locator, FetchChannel>>>,
}

impl FetchCoordinator {
    pub fn new(
        fetcher: Arc<dyn ByteFetcher>,
        downsampler: Downsampler,
        memory: Arc<MemoryCache>,
        durable: Arc<dyn DurableStore>,
        metrics: Arc<PipelineMetrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            context: FetchContext {
                fetcher,
                downsampler,
                memory,
                durable,
                metrics,
                runtime,
            },
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve `locator` over the network, joining an outstanding fetch if there is one.
    ///
    /// May be called from outside the runtime; the fetch itself is spawned on the
    /// coordinator's runtime handle.
    pub fn fetch(&self, locator: &Locator) -> BoxFuture<'static, FetchOutcome> {
        let (channel, task) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(channel) = in_flight.get(locator) {
                debug!("Joining in-flight fetch for {}", locator);
                self.context.metrics.record_fetch_joined();
                (channel.clone(), None)
            } else if let Some(bitmap) = self.context.memory.get_uncounted(locator) {
                // A fetch finished since the caller last looked. Its memory put
                // happens before its registry entry is removed.
                debug!("{} was resolved by a fetch that just completed", locator);
                return future::ready(Ok(bitmap)).boxed();
            } else {
                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                in_flight.insert(locator.clone(), channel.clone());
                (channel, Some(self.fetch_task(locator.clone(), sender)))
            }
        };

        // Spawn with the registry unlocked: a shut-down runtime drops the task
        // inside `spawn`, and its removal token takes the lock.
        if let Some(task) = task {
            self.context.runtime.spawn(task);
        }

        channel
            .map(|received| received.unwrap_or(Err(FetchFailure::Abandoned)))
            .boxed()
    }

    /// Number of locators with a fetch outstanding
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, locator: &Locator) -> bool {
        self.in_flight.lock().contains_key(locator)
    }

    /// Build the task for a freshly registered locator. Dropping the task, run or
    /// not, removes the registry entry.
    fn fetch_task(
        &self,
        locator: Locator,
        sender: oneshot::Sender<FetchOutcome>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let in_flight = self.in_flight.clone();
        let key = locator.clone();
        let remove_token = CallOnDrop::new(move || {
            in_flight.lock().remove(&key);
        });

        self.context.metrics.record_fetch_started();
        let context = self.context.clone();
        async move {
            let outcome = context.resolve(locator).await;
            // Evict from the registry first: callers either get a channel that will
            // receive this result, or they start a new fetch.
            drop(remove_token);
            sender.send(outcome).ok();
        }
    }
}

impl FetchContext {
    #[instrument(skip(self), fields(locator = %locator))]
    async fn resolve(&self, locator: Locator) -> FetchOutcome {
        let bytes = match self.fetcher.fetch_bytes(&locator).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Fetch failed for {}: {}", locator, e);
                self.metrics.record_fetch_failed();
                return Err(FetchFailure::from(&e));
            }
        };

        let downsampler = self.downsampler.clone();
        let raw = bytes.clone();
        let bitmap = match tokio::task::spawn_blocking(move || downsampler.downsample(&raw)).await
        {
            Ok(Some(bitmap)) => bitmap,
            Ok(None) => {
                let err = Error::Decode {
                    locator: locator.to_string(),
                    reason: format!("{} bytes are not a supported image", bytes.len()),
                };
                warn!("{}", err);
                self.metrics.record_fetch_failed();
                return Err(FetchFailure::from(&err));
            }
            Err(e) => {
                warn!("Downsample task for {} did not complete: {}", locator, e);
                self.metrics.record_fetch_failed();
                return Err(FetchFailure::Abandoned);
            }
        };

        debug!(
            "Fetched {} as {}x{}",
            locator,
            bitmap.width(),
            bitmap.height()
        );
        self.memory.put_bitmap(locator.clone(), bitmap.clone());
        self.persist(locator, bitmap.clone(), bytes);

        Ok(bitmap)
    }

    /// Write the bitmap to the durable tier in the background. Failures are logged
    /// and counted, never surfaced.
    fn persist(&self, locator: Locator, bitmap: Bitmap, raw: Bytes) {
        let durable = self.durable.clone();
        let metrics = self.metrics.clone();

        self.runtime.spawn(async move {
            let encoded =
                tokio::task::spawn_blocking(move || bitmap.encode_jpeg(DURABLE_JPEG_QUALITY))
                    .await;
            let data = match encoded {
                Ok(Ok(jpeg)) => Bytes::from(jpeg),
                Ok(Err(e)) => {
                    debug!("Re-encode failed for {}, storing source bytes: {}", locator, e);
                    raw
                }
                Err(e) => {
                    debug!("Re-encode task failed for {}, storing source bytes: {}", locator, e);
                    raw
                }
            };

            if let Err(e) = durable.put_bytes(locator.as_str(), data).await {
                warn!("Durable write failed for {}: {}", locator, e);
                metrics.record_durable_write_failure();
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDurableStore;
    use crate::error::Result;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn png(width: u32, height: u32) -> Bytes {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    enum Reply {
        Image(Bytes),
        Status(u16),
    }

    /// Counts calls and holds each one until the gate grants a permit
    struct GatedFetcher {
        calls: AtomicUsize,
        gate: Semaphore,
        reply: Reply,
    }

    impl GatedFetcher {
        fn new(reply: Reply, open: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                reply,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ByteFetcher for GatedFetcher {
        async fn fetch_bytes(&self, locator: &Locator) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
            match &self.reply {
                Reply::Image(bytes) => Ok(bytes.clone()),
                Reply::Status(status) => Err(Error::HttpStatus {
                    locator: locator.to_string(),
                    status: *status,
                }),
            }
        }
    }

    struct Harness {
        coordinator: FetchCoordinator,
        fetcher: Arc<GatedFetcher>,
        memory: Arc<MemoryCache>,
        durable: Arc<InMemoryDurableStore>,
        metrics: Arc<PipelineMetrics>,
    }

    fn harness(reply: Reply, open: bool) -> Harness {
        let fetcher = GatedFetcher::new(reply, open);
        let memory = Arc::new(MemoryCache::new());
        let durable = Arc::new(InMemoryDurableStore::new());
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        let coordinator = FetchCoordinator::new(
            fetcher.clone(),
            Downsampler::default(),
            memory.clone(),
            durable.clone(),
            metrics.clone(),
            Handle::current(),
        );
        Harness {
            coordinator,
            fetcher,
            memory,
            durable,
            metrics,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let h = harness(Reply::Image(png(64, 32)), false);
        let locator = Locator::new("https://img/cover-1.jpg");

        let pending: Vec<_> = (0..5).map(|_| h.coordinator.fetch(&locator)).collect();
        wait_for(|| h.fetcher.calls() == 1).await;
        assert!(h.coordinator.is_in_flight(&locator));

        h.fetcher.gate.add_permits(1);
        let results = futures::future::join_all(pending).await;

        let first = results[0].clone().unwrap();
        for result in &results {
            assert!(Bitmap::ptr_eq(result.as_ref().unwrap(), &first));
        }
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.memory.len(), 1);
        assert_eq!(h.coordinator.in_flight_count(), 0);

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.fetches_started, 1);
        assert_eq!(snapshot.fetches_joined, 4);
    }

    #[tokio::test]
    async fn test_failure_shared_and_not_cached() {
        let h = harness(Reply::Status(500), false);
        let locator = Locator::new("https://img/broken.jpg");

        let a = h.coordinator.fetch(&locator);
        let b = h.coordinator.fetch(&locator);
        h.fetcher.gate.add_permits(1);

        assert_eq!(a.await, Err(FetchFailure::Status(500)));
        assert_eq!(b.await, Err(FetchFailure::Status(500)));
        assert!(h.memory.is_empty());
        assert_eq!(h.metrics.snapshot().fetches_failed, 1);

        // The registry is empty again, so the next request starts over
        h.fetcher.gate.add_permits(1);
        assert_eq!(
            h.coordinator.fetch(&locator).await,
            Err(FetchFailure::Status(500))
        );
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_bytes_fail_with_decode() {
        let h = harness(Reply::Image(Bytes::from_static(b"<html>nope</html>")), true);
        let locator = Locator::new("https://img/not-an-image.jpg");

        assert_eq!(
            h.coordinator.fetch(&locator).await,
            Err(FetchFailure::Decode)
        );
        assert!(h.memory.is_empty());
        assert_eq!(h.metrics.snapshot().fetches_failed, 1);
    }

    #[tokio::test]
    async fn test_completed_fetch_is_not_joined() {
        let h = harness(Reply::Image(png(8, 8)), true);
        let locator = Locator::new("https://img/a.png");

        h.coordinator.fetch(&locator).await.unwrap();
        assert!(!h.coordinator.is_in_flight(&locator));

        h.memory.remove_all();
        h.coordinator.fetch(&locator).await.unwrap();
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(h.metrics.snapshot().fetches_joined, 0);
    }

    #[tokio::test]
    async fn test_cached_result_is_served_without_refetch() {
        let h = harness(Reply::Image(png(8, 8)), true);
        let locator = Locator::new("https://img/a.png");

        let first = h.coordinator.fetch(&locator).await.unwrap();
        let second = h.coordinator.fetch(&locator).await.unwrap();

        assert!(Bitmap::ptr_eq(&first, &second));
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.metrics.snapshot().fetches_started, 1);
        assert_eq!((h.memory.hits(), h.memory.misses()), (0, 0));
    }

    #[test]
    fn test_fetch_after_runtime_shutdown_is_abandoned() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fetcher = GatedFetcher::new(Reply::Image(png(8, 8)), true);
        let coordinator = Arc::new(FetchCoordinator::new(
            fetcher.clone(),
            Downsampler::default(),
            Arc::new(MemoryCache::new()),
            Arc::new(InMemoryDurableStore::new()),
            Arc::new(PipelineMetrics::new().unwrap()),
            runtime.handle().clone(),
        ));
        drop(runtime);

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = coordinator.clone();
        std::thread::spawn(move || {
            let locator = Locator::new("https://img/a.png");
            let outcome = futures::executor::block_on(worker.fetch(&locator));
            tx.send(outcome).ok();
        });

        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("fetch did not return after runtime shutdown");
        assert_eq!(outcome, Err(FetchFailure::Abandoned));
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_different_locators_fetch_in_parallel() {
        let h = harness(Reply::Image(png(8, 8)), false);
        let a = h.coordinator.fetch(&Locator::new("https://img/a.png"));
        let b = h.coordinator.fetch(&Locator::new("https://img/b.png"));

        wait_for(|| h.fetcher.calls() == 2).await;
        assert_eq!(h.coordinator.in_flight_count(), 2);

        h.fetcher.gate.add_permits(2);
        assert!(a.await.is_ok());
        assert!(b.await.is_ok());
        assert_eq!(h.memory.len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_requester_does_not_cancel_fetch() {
        let h = harness(Reply::Image(png(8, 8)), false);
        let locator = Locator::new("https://img/a.png");

        drop(h.coordinator.fetch(&locator));
        wait_for(|| h.fetcher.calls() == 1).await;
        h.fetcher.gate.add_permits(1);

        wait_for(|| h.memory.contains(&locator)).await;
        assert_eq!(h.coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_success_is_persisted_as_jpeg() {
        let h = harness(Reply::Image(png(40, 20)), true);
        let locator = Locator::new("https://img/a.png");

        h.coordinator.fetch(&locator).await.unwrap();
        wait_for(|| h.durable.contains(locator.as_str())).await;

        let stored = h.durable.get_bytes(locator.as_str()).await.unwrap().unwrap();
        assert_eq!(
            image::guess_format(&stored).unwrap(),
            ImageFormat::Jpeg
        );
        let decoded = image::load_from_memory(&stored).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }
}
