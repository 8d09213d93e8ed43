//! Per-requester loading
//!
//! A [`ResourceLoader`] backs one UI element. It resolves through the shared
//! pipeline and suppresses results its requester no longer wants.

mod resource;

pub use resource::{LoadOutcome, LoaderEvent, ResourceLoader};
