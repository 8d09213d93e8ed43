//! Resource Loader - one per UI requester
//!
//! Tracks which locator its requester currently wants and publishes
//! `(bitmap, is_loading)` snapshots on a broadcast channel.
//!
//! Every `load()`, `cancel()` and clear bumps a generation counter. Async work
//! captures the generation when it starts and only delivers if the counter and
//! target are unchanged when it finishes; otherwise the result is dropped. The
//! shared fetch itself is never aborted, so a superseded resolution still lands
//! in the memory cache for whoever asks next.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::cache::Locator;
use crate::error::FetchFailure;
use crate::imaging::Bitmap;
use crate::pipeline::{ImagePipeline, Resolved};

/// Snapshot of what a loader's requester should display
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoaderEvent {
    pub bitmap: Option<Bitmap>,
    pub is_loading: bool,
}

/// What a call to [`ResourceLoader::load`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Already showing or loading this locator
    Unchanged,
    /// No locator given; the bitmap was cleared
    Cleared,
    /// Delivered synchronously from the memory cache
    MemoryHit,
    /// Asynchronous resolution started
    Started,
}

#[derive(Default)]
struct Session {
    current_target: Option<Locator>,
    current_bitmap: Option<Bitmap>,
    is_loading: bool,
    generation: u64,
}

impl Session {
    fn snapshot(&self) -> LoaderEvent {
        LoaderEvent {
            bitmap: self.current_bitmap.clone(),
            is_loading: self.is_loading,
        }
    }
}

struct LoaderShared {
    session: Mutex<Session>,
    events: broadcast::Sender<LoaderEvent>,
}

impl LoaderShared {
    /// Publish the session state. Called with the session lock held so
    /// subscribers see events in state order.
    fn emit(&self, session: &Session) {
        // No subscribers is fine
        let _ = self.events.send(session.snapshot());
    }
}

/// Per-requester loader
pub struct ResourceLoader {
    pipeline: Arc<ImagePipeline>,
    shared: Arc<LoaderShared>,
}

impl ResourceLoader {
    pub fn new(pipeline: Arc<ImagePipeline>) -> Self {
        let (events, _) = broadcast::channel(pipeline.config().event_capacity);
        Self {
            pipeline,
            shared: Arc::new(LoaderShared {
                session: Mutex::new(Session::default()),
                events,
            }),
        }
    }

    /// Request `target`, or clear the loader with `None`.
    ///
    /// Memory hits are delivered before this returns. Anything else is resolved in
    /// the background, superseding work from earlier calls.
    pub fn load(&self, target: Option<Locator>) -> LoadOutcome {
        let Some(locator) = target else {
            self.clear();
            return LoadOutcome::Cleared;
        };

        let mut session = self.shared.session.lock();

        if session.current_target.as_ref() == Some(&locator)
            && (session.current_bitmap.is_some() || session.is_loading)
        {
            trace!("Already holding {}", locator);
            return LoadOutcome::Unchanged;
        }

        session.generation += 1;
        session.current_target = Some(locator.clone());

        if let Some(bitmap) = self.pipeline.memory_cache().get(&locator) {
            debug!("Memory hit for {}", locator);
            session.current_bitmap = Some(bitmap);
            session.is_loading = false;
            self.shared.emit(&session);
            return LoadOutcome::MemoryHit;
        }

        session.current_bitmap = None;
        session.is_loading = true;
        self.shared.emit(&session);
        let generation = session.generation;
        drop(session);

        let pipeline = self.pipeline.clone();
        let shared = Arc::downgrade(&self.shared);
        self.pipeline.runtime().spawn(async move {
            let result = pipeline.resolve(&locator).await;
            deliver(&pipeline, &shared, generation, &locator, result);
        });

        LoadOutcome::Started
    }

    /// Parse and load a URL string; blank strings clear the loader
    pub fn load_url(&self, url: &str) -> LoadOutcome {
        self.load(Locator::parse(Some(url)))
    }

    /// Mark outstanding work cancelled. The current target and bitmap are kept.
    pub fn cancel(&self) {
        let mut session = self.shared.session.lock();
        session.generation += 1;
        if session.is_loading {
            session.is_loading = false;
            self.shared.emit(&session);
        }
    }

    fn clear(&self) {
        let mut session = self.shared.session.lock();
        session.generation += 1;
        session.current_target = None;
        session.current_bitmap = None;
        session.is_loading = false;
        self.shared.emit(&session);
    }

    /// Subscribe to state changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> LoaderEvent {
        self.shared.session.lock().snapshot()
    }

    pub fn current_bitmap(&self) -> Option<Bitmap> {
        self.shared.session.lock().current_bitmap.clone()
    }

    pub fn current_target(&self) -> Option<Locator> {
        self.shared.session.lock().current_target.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.session.lock().is_loading
    }

    /// Wait until the loader is no longer loading and return its state
    pub async fn settle(&self) -> LoaderEvent {
        let mut events = self.subscribe();
        loop {
            let state = self.state();
            if !state.is_loading {
                return state;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.state(),
            }
        }
    }
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.shared.session.lock();
        f.debug_struct("ResourceLoader")
            .field("current_target", &session.current_target)
            .field("has_bitmap", &session.current_bitmap.is_some())
            .field("is_loading", &session.is_loading)
            .field("generation", &session.generation)
            .finish()
    }
}

/// Apply a finished resolution if it is still wanted
fn deliver(
    pipeline: &ImagePipeline,
    shared: &Weak<LoaderShared>,
    generation: u64,
    locator: &Locator,
    result: std::result::Result<Resolved, FetchFailure>,
) {
    let Some(shared) = shared.upgrade() else {
        trace!("Loader dropped before {} resolved", locator);
        pipeline.instruments().record_stale_discarded();
        return;
    };

    let mut session = shared.session.lock();
    if session.generation != generation || session.current_target.as_ref() != Some(locator) {
        debug!("Discarding stale result for {}", locator);
        pipeline.instruments().record_stale_discarded();
        return;
    }

    match result {
        Ok(resolved) => {
            debug!("Resolved {} from {}", locator, resolved.tier);
            session.current_bitmap = Some(resolved.bitmap);
        }
        Err(failure) => {
            debug!("Load of {} failed: {}", locator, failure);
        }
    }
    session.is_loading = false;
    shared.emit(&session);
}

// =============================================================================
// Tests
// =============================================================================
