//! Network transport
//!
//! The [`ByteFetcher`] seam and its HTTP implementation, [`FetchPool`].

mod pool;

pub use pool::{ByteFetcher, FetchPool, FetchPoolConfig};
