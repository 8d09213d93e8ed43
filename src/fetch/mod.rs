//! Coordinated network resolution
//!
//! Collapses concurrent requests for one locator into a single fetch and
//! downsample, shared by every loader in the process.

mod coordinator;
mod guard;

pub use coordinator::{FetchCoordinator, FetchOutcome};
