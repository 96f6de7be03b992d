//! Metric collectors for pipeline operations.
//!
//! Every method is a no-op when `init_metrics()` has not been called, so
//! library code records unconditionally and tests need no setup.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, DEAD_LETTERS, JOBS_CREATED, JOBS_PROCESSED, JOB_DURATION, QUEUE_DEPTH,
    SWEEPS_TOTAL,
};
use crate::queue::QueueCounts;

/// Collector that records pipeline metrics with consistent labels.
///
/// # Example
///
/// ```ignore
/// use fixture_pipeline::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_jobs_created("analysis", "catch_up", 3);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record jobs created for `stage` by `trigger`.
    pub fn record_jobs_created(&self, stage: &str, trigger: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(created) = JOBS_CREATED.get() {
            created
                .with_label_values(&[stage, trigger])
                .inc_by(count as f64);
        }
    }

    /// Record a job leaving a worker.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue the job came from
    /// * `outcome` - One of "completed", "skipped", "retried", "failed", "timed_out"
    /// * `duration` - Time spent in the handler
    pub fn record_job_processed(&self, queue: &str, outcome: &str, duration: Duration) {
        if let Some(processed) = JOBS_PROCESSED.get() {
            processed.with_label_values(&[queue, outcome]).inc();
        }

        if let Some(histogram) = JOB_DURATION.get() {
            histogram
                .with_label_values(&[queue])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(queue, outcome, duration_ms = duration.as_millis() as u64, "Recorded job metric");
    }

    pub fn record_dead_letter(&self, queue: &str) {
        if let Some(dead_letters) = DEAD_LETTERS.get() {
            dead_letters.with_label_values(&[queue]).inc();
        }
    }

    /// Publish the per-state counts of one queue.
    pub fn update_queue_counts(&self, queue: &str, counts: &QueueCounts) {
        let Some(depth) = QUEUE_DEPTH.get() else {
            return;
        };

        let states = [
            ("waiting", counts.waiting),
            ("delayed", counts.delayed),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
            ("dead_letter", counts.dead_letter),
        ];
        for (state, value) in states {
            depth.with_label_values(&[queue, state]).set(value as f64);
        }
    }

    pub fn record_sweep(&self, sweep: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        if let Some(sweeps) = SWEEPS_TOTAL.get() {
            sweeps.with_label_values(&[sweep, result]).inc();
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.dec();
        }
    }
}
