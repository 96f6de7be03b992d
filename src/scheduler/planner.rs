//! Idempotent stage scheduling for a single match.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::timing::Timing;
use crate::metrics::MetricsCollector;
use crate::model::{Match, MatchStatus, Stage};
use crate::queue::{
    EnqueueOutcome, Job, JobId, JobPayload, MatchJob, QueueError, QueueSet, DEFAULT_MAX_ATTEMPTS,
};

/// Errors returned by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The match cannot carry jobs because it has no external id.
    #[error("Match {0} has no external id")]
    MissingExternalId(i64),

    /// The queue backend rejected an enqueue.
    #[error("Failed to enqueue {stage} job for match {match_id}: {source}")]
    Enqueue {
        stage: Stage,
        match_id: i64,
        #[source]
        source: QueueError,
    },

    /// Some stages of a match failed to enqueue; the others were scheduled.
    #[error("{failed} stage(s) of match {match_id} not scheduled, {created} created: {first}")]
    Incomplete {
        match_id: i64,
        created: usize,
        failed: usize,
        #[source]
        first: Box<SchedulerError>,
    },
}

impl SchedulerError {
    /// Jobs that were created despite the error.
    pub fn jobs_created(&self) -> usize {
        match self {
            SchedulerError::Incomplete { created, .. } => *created,
            _ => 0,
        }
    }
}

/// Which path asked for a job. Used for logs and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Ingestion,
    CatchUp,
    Backfill,
    Recovery,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Ingestion => "ingestion",
            Trigger::CatchUp => "catch_up",
            Trigger::Backfill => "backfill",
            Trigger::Recovery => "recovery",
            Trigger::Manual => "manual",
        }
    }
}

/// Stages a match in `status` receives from the regular scheduling pass.
///
/// Terminal matches receive nothing; Settlement is only created by recovery.
pub fn applicable_stages(status: MatchStatus) -> &'static [Stage] {
    match status {
        MatchStatus::Scheduled => &Stage::PRE_MATCH,
        MatchStatus::Live => &[Stage::LiveMonitor],
        MatchStatus::Finished | MatchStatus::Cancelled | MatchStatus::Postponed => &[],
    }
}

/// Creates stage jobs with deterministic identities.
///
/// Cheap to clone; every trigger path holds its own copy.
#[derive(Clone)]
pub struct Scheduler {
    queues: QueueSet,
    timing: Timing,
    max_attempts: u32,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(queues: QueueSet, timing: Timing) -> Self {
        Self {
            queues,
            timing,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the attempt limit stamped on new jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Builds the job for `stage` of `m` as of `now`.
    pub fn build_job(
        &self,
        m: &Match,
        stage: Stage,
        allow_retroactive: bool,
        now: DateTime<Utc>,
    ) -> Result<Job, SchedulerError> {
        let payload = MatchJob::for_match(m, allow_retroactive)
            .ok_or(SchedulerError::MissingExternalId(m.id))?;
        let priority =
            self.timing
                .compute_dynamic_priority(stage.base_priority(), m.kickoff, stage, now);
        let run_at = self.timing.run_at(stage, m.kickoff, now);

        Ok(Job::new(
            JobId::for_stage(stage, m.id),
            JobPayload::for_stage(stage, payload),
            priority,
            run_at,
        )
        .with_created_at(now)
        .with_max_attempts(self.max_attempts))
    }

    /// Idempotently enqueues one stage job.
    pub async fn enqueue_stage(
        &self,
        m: &Match,
        stage: Stage,
        allow_retroactive: bool,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<EnqueueOutcome, SchedulerError> {
        let job = self.build_job(m, stage, allow_retroactive, now)?;
        let job_id = job.id.clone();
        let run_at = job.run_at;
        let priority = job.priority;

        let outcome = self
            .queues
            .get(stage.into())
            .enqueue_unique(job, now)
            .await
            .map_err(|source| SchedulerError::Enqueue {
                stage,
                match_id: m.id,
                source,
            })?;

        match outcome {
            EnqueueOutcome::Created | EnqueueOutcome::Replaced => {
                self.metrics
                    .record_jobs_created(stage.as_str(), trigger.as_str(), 1);
                debug!(
                    job_id = %job_id,
                    match_id = m.id,
                    stage = %stage,
                    trigger = trigger.as_str(),
                    run_at = %run_at,
                    priority,
                    replaced = matches!(outcome, EnqueueOutcome::Replaced),
                    "Enqueued stage job"
                );
            }
            EnqueueOutcome::Skipped(state) => {
                debug!(
                    job_id = %job_id,
                    match_id = m.id,
                    state = %state,
                    "Stage job already pending"
                );
            }
        }

        Ok(outcome)
    }

    /// Schedules every stage applicable to the match's status, as of now.
    pub async fn schedule_jobs(&self, m: &Match) -> Result<usize, SchedulerError> {
        self.schedule_jobs_at(m, Utc::now(), Trigger::Manual).await
    }

    /// Schedules every stage applicable to the match's status.
    ///
    /// Returns the number of jobs created. Stages are attempted independently;
    /// if any enqueue fails, `Incomplete` carries the first error and the
    /// number of jobs the other stages created.
    pub async fn schedule_jobs_at(
        &self,
        m: &Match,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<usize, SchedulerError> {
        if m.external_id.is_none() {
            debug!(match_id = m.id, "Skipping match without external id");
            return Ok(0);
        }

        let stages = applicable_stages(m.status);
        if stages.is_empty() {
            debug!(match_id = m.id, status = %m.status, "Skipping match in terminal status");
            return Ok(0);
        }

        let mut created = 0;
        let mut failed = 0;
        let mut first_error = None;
        for &stage in stages {
            match self.enqueue_stage(m, stage, false, now, trigger).await {
                Ok(outcome) if outcome.created() => created += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(match_id = m.id, stage = %stage, error = %e, "Failed to schedule stage");
                    failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if created > 0 {
            info!(
                match_id = m.id,
                created,
                trigger = trigger.as_str(),
                "Scheduled jobs for match"
            );
        }

        match first_error {
            Some(first) => Err(SchedulerError::Incomplete {
                match_id: m.id,
                created,
                failed,
                first: Box::new(first),
            }),
            None => Ok(created),
        }
    }

    /// Enqueues a recovery job for `stage`, bypassing the status gate.
    pub async fn schedule_recovery(&self, m: &Match, stage: Stage) -> Result<bool, SchedulerError> {
        self.schedule_recovery_at(m, stage, Utc::now()).await
    }

    /// Enqueues a recovery job for `stage` with `allow_retroactive` set.
    ///
    /// Returns whether a job was created.
    pub async fn schedule_recovery_at(
        &self,
        m: &Match,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let outcome = self
            .enqueue_stage(m, stage, true, now, Trigger::Recovery)
            .await?;
        if outcome.created() {
            info!(match_id = m.id, stage = %stage, status = %m.status, "Scheduled recovery job");
        }
        Ok(outcome.created())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;
    use chrono::TimeZone;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 9, 0, 0).unwrap()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(QueueSet::in_memory(), Timing::default())
    }

    #[test]
    fn test_applicable_stages() {
        assert_eq!(applicable_stages(MatchStatus::Scheduled), &Stage::PRE_MATCH);
        assert_eq!(applicable_stages(MatchStatus::Live), &[Stage::LiveMonitor]);
        assert!(applicable_stages(MatchStatus::Finished).is_empty());
        assert!(applicable_stages(MatchStatus::Postponed).is_empty());
    }

    #[test]
    fn test_build_job_requires_external_id() {
        let m = Match::new(5, None, now());
        let err = scheduler()
            .build_job(&m, Stage::Analysis, false, now())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::MissingExternalId(5)));
    }

    #[test]
    fn test_build_job_fields() {
        let m = Match::new(5, Some(500), now() + chrono::Duration::hours(10));
        let job = scheduler()
            .with_max_attempts(5)
            .build_job(&m, Stage::Lineups, false, now())
            .unwrap();

        assert_eq!(job.id.as_str(), "lineups-5");
        assert_eq!(job.priority, Stage::Lineups.base_priority());
        assert_eq!(job.run_at, now() + chrono::Duration::hours(9));
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.payload.match_id(), Some(5));
    }

    #[tokio::test]
    async fn test_schedule_jobs_is_idempotent() {
        let scheduler = scheduler();
        let m = Match::new(1, Some(100), now() + chrono::Duration::hours(36));

        let first = scheduler.schedule_jobs_at(&m, now(), Trigger::CatchUp).await.unwrap();
        let second = scheduler.schedule_jobs_at(&m, now(), Trigger::CatchUp).await.unwrap();

        assert_eq!(first, 3);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_live_match_gets_live_monitor() {
        let scheduler = scheduler();
        let m = Match::new(2, Some(200), now() - chrono::Duration::minutes(10))
            .with_status(MatchStatus::Live);

        let created = scheduler.schedule_jobs_at(&m, now(), Trigger::Ingestion).await.unwrap();
        assert_eq!(created, 1);

        let record = scheduler
            .queues()
            .get(Stage::LiveMonitor.into())
            .get(&JobId::for_stage(Stage::LiveMonitor, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.job.priority, Stage::LiveMonitor.base_priority());
        assert_eq!(record.job.run_at, now() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_terminal_and_unlinked_matches_get_nothing() {
        let scheduler = scheduler();
        let finished = Match::new(3, Some(300), now()).with_status(MatchStatus::Finished);
        let unlinked = Match::new(4, None, now() + chrono::Duration::hours(5));

        assert_eq!(scheduler.schedule_jobs_at(&finished, now(), Trigger::Manual).await.unwrap(), 0);
        assert_eq!(scheduler.schedule_jobs_at(&unlinked, now(), Trigger::Manual).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recovery_bypasses_status_gate() {
        let scheduler = scheduler();
        let m = Match::new(6, Some(600), now() - chrono::Duration::hours(4))
            .with_status(MatchStatus::Finished);

        assert!(scheduler
            .schedule_recovery_at(&m, Stage::Settlement, now())
            .await
            .unwrap());
        assert!(!scheduler
            .schedule_recovery_at(&m, Stage::Settlement, now())
            .await
            .unwrap());

        let record = scheduler
            .queues()
            .get(Stage::Settlement.into())
            .get(&JobId::for_stage(Stage::Settlement, 6))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert!(record.job.payload.match_job().unwrap().allow_retroactive);
    }

    #[tokio::test]
    async fn test_completed_job_is_replaced() {
        let scheduler = scheduler();
        let m = Match::new(8, Some(800), now() + chrono::Duration::hours(2));
        let queue = scheduler.queues().get(Stage::Analysis.into()).clone();

        scheduler.schedule_jobs_at(&m, now(), Trigger::CatchUp).await.unwrap();
        let claimed = queue
            .claim(now() + chrono::Duration::seconds(5), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        queue.complete(&claimed, now()).await.unwrap();

        let outcome = scheduler
            .enqueue_stage(&m, Stage::Analysis, false, now(), Trigger::Backfill)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Replaced);
    }
}
