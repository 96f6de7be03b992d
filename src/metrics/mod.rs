//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job creation per trigger path, worker outcomes, queue depth,
//! dead-letter growth and sweep runs.
//!
//! # Example
//!
//! ```ignore
//! use fixture_pipeline::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_sweep("gap-scan", true);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERS, JOBS_CREATED, JOBS_PROCESSED, JOB_DURATION, QUEUE_DEPTH,
    REGISTRY, SWEEPS_TOTAL,
};
