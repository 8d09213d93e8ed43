//! Metrics module
//!
//! Prometheus instruments describing cache and fetch activity.

mod pipeline;

pub use pipeline::{MetricsSnapshot, PipelineMetrics};
