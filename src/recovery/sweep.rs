//! Sweep jobs on the backfill queue.
//!
//! Periodic triggers do not run scans directly; they enqueue a sweep job with
//! a fixed identity. With several scheduler processes sharing one backend,
//! only one copy of each sweep can be pending at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::backfill::Backfill;
use super::stuck::StuckDetector;
use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::queue::{EnqueueOutcome, Job, JobId, JobPayload, QueueError, QueueSet, SweepKind};
use crate::worker::{HandlerOutcome, JobHandler};

/// Sweeps run ahead of anything else waiting on the backfill queue.
const SWEEP_PRIORITY: i32 = 1;

/// Sweeps are cheap to re-run; one attempt keeps a broken store from
/// piling up retries behind the next tick.
const SWEEP_MAX_ATTEMPTS: u32 = 1;

/// Requests a sweep, unless one is already pending.
pub async fn enqueue_sweep(
    queues: &QueueSet,
    sweep: SweepKind,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome, QueueError> {
    let job = Job::new(
        JobId::for_sweep(sweep),
        JobPayload::for_sweep(sweep, now),
        SWEEP_PRIORITY,
        now,
    )
    .with_created_at(now)
    .with_max_attempts(SWEEP_MAX_ATTEMPTS);

    let outcome = queues.get(job.queue()).enqueue_unique(job, now).await?;
    if !outcome.created() {
        info!(sweep = sweep.as_str(), "Sweep already pending");
    }
    Ok(outcome)
}

/// Runs gap and stuck scans for the backfill queue's workers.
pub struct RecoveryHandler {
    backfill: Backfill,
    stuck: StuckDetector,
    metrics: MetricsCollector,
}

impl RecoveryHandler {
    pub fn new(backfill: Backfill, stuck: StuckDetector) -> Self {
        Self {
            backfill,
            stuck,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl JobHandler for RecoveryHandler {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let (sweep, result) = match &job.payload {
            JobPayload::GapScan(_) => (
                SweepKind::GapScan,
                self.backfill.run().await.map(|r| r.jobs_created()),
            ),
            JobPayload::StuckScan(_) => (
                SweepKind::StuckScan,
                self.stuck.run().await.map(|r| r.jobs_created),
            ),
            other => {
                return Err(JobError::Validation(format!(
                    "{} job on the backfill queue",
                    other.queue()
                )));
            }
        };

        self.metrics.record_sweep(sweep.as_str(), result.is_ok());
        let created = result?;
        info!(sweep = sweep.as_str(), created, "Sweep finished");
        Ok(HandlerOutcome::Done)
    }
}
