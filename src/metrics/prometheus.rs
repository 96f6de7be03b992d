//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the pipeline and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all pipeline metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs actually created, labeled by stage and the trigger path that created them.
pub static JOBS_CREATED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs finished by a worker, labeled by queue and outcome.
pub static JOBS_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Handler duration in seconds, labeled by queue.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs per queue and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Entries pushed to the dead-letter store, labeled by queue.
pub static DEAD_LETTERS: OnceLock<CounterVec> = OnceLock::new();

/// Recovery sweep runs, labeled by sweep and result.
pub static SWEEPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of workers currently running a handler.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are no-ops.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    // Every static must come from the same registry
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_created = CounterVec::new(
        Opts::new("fixture_pipeline_jobs_created_total", "Jobs created by the scheduler"),
        &["stage", "trigger"],
    )?;

    let jobs_processed = CounterVec::new(
        Opts::new("fixture_pipeline_jobs_processed_total", "Jobs finished by workers"),
        &["queue", "outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "fixture_pipeline_job_duration_seconds",
            "Job handler duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["queue"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("fixture_pipeline_queue_depth", "Number of jobs per queue and state"),
        &["queue", "state"],
    )?;

    let dead_letters = CounterVec::new(
        Opts::new("fixture_pipeline_dead_letters_total", "Jobs moved to the dead-letter store"),
        &["queue"],
    )?;

    let sweeps_total = CounterVec::new(
        Opts::new("fixture_pipeline_sweeps_total", "Recovery sweep runs"),
        &["sweep", "result"],
    )?;

    let active_workers = Gauge::new(
        "fixture_pipeline_active_workers",
        "Number of workers currently running a job",
    )?;

    registry.register(Box::new(jobs_created.clone()))?;
    registry.register(Box::new(jobs_processed.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(dead_letters.clone()))?;
    registry.register(Box::new(sweeps_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = JOBS_CREATED.set(jobs_created);
    let _ = JOBS_PROCESSED.set(jobs_processed);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = DEAD_LETTERS.set(dead_letters);
    let _ = SWEEPS_TOTAL.set(sweeps_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = REGISTRY.set(registry);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Renders the registry in the Prometheus text exposition format.
///
/// Before [`init_metrics`] the output is a single comment line, so
/// `status --metrics` never fails on an uninitialized process.
pub fn export_metrics() -> String {
    match REGISTRY.get() {
        Some(registry) => TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap_or_else(|e| format!("# encoding failed: {}\n", e)),
        None => "# metrics registry not initialized\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_contains_created_jobs() {
        init_metrics().unwrap();
        JOBS_CREATED
            .get()
            .unwrap()
            .with_label_values(&["analysis", "catch_up"])
            .inc();

        let text = export_metrics();
        assert!(text.contains("fixture_pipeline_jobs_created_total"));
        assert!(text.contains(r#"trigger="catch_up""#));
    }
}
