//! Stage handler contract and the match-status guard.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::JobError;
use crate::model::{MatchStatus, Stage};
use crate::queue::Job;
use crate::storage::FixtureStore;

/// Successful result of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The work was done.
    Done,
    /// Nothing to do; the job completes without side effects.
    Skipped(String),
}

/// Performs the domain work of one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError>;
}

#[async_trait]
impl<H: JobHandler + ?Sized> JobHandler for Arc<H> {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        (**self).handle(job).await
    }
}

/// Checks the match's current status before delegating to the inner handler.
///
/// A match may change status between enqueue and execution; there is no
/// cancellation of already-enqueued jobs, so every stage job passes here.
///
/// - missing match: terminal `MatchNotFound`
/// - cancelled or postponed: terminal `MatchCancelled`
/// - finished: Settlement and retroactive jobs proceed, others are skipped
/// - Settlement for a match that has not finished: terminal `Validation`
/// - pre-match stage whose output record exists: skipped unless retroactive
///
/// Sweep jobs are passed through untouched.
pub struct MatchGuard<H> {
    store: Arc<dyn FixtureStore>,
    inner: H,
}

impl<H: JobHandler> MatchGuard<H> {
    pub fn new(store: Arc<dyn FixtureStore>, inner: H) -> Self {
        Self { store, inner }
    }
}

#[async_trait]
impl<H: JobHandler> JobHandler for MatchGuard<H> {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let (Some(target), Some(stage)) = (job.payload.match_job(), job.payload.stage()) else {
            return self.inner.handle(job).await;
        };

        let m = self
            .store
            .get_match(target.match_id)
            .await?
            .ok_or(JobError::MatchNotFound(target.match_id))?;

        match m.status {
            MatchStatus::Cancelled | MatchStatus::Postponed => {
                info!(job_id = %job.id, match_id = m.id, status = %m.status, "Match called off");
                return Err(JobError::MatchCancelled(m.id));
            }
            MatchStatus::Finished if stage != Stage::Settlement && !target.allow_retroactive => {
                debug!(job_id = %job.id, match_id = m.id, "Match already finished, skipping");
                return Ok(HandlerOutcome::Skipped(format!(
                    "match {} already finished",
                    m.id
                )));
            }
            status if stage == Stage::Settlement && status != MatchStatus::Finished => {
                return Err(JobError::Validation(format!(
                    "cannot settle match {} in status {}",
                    m.id, status
                )));
            }
            _ => {}
        }

        // Re-ingestion replaces completed jobs, so the output record decides
        if Stage::PRE_MATCH.contains(&stage)
            && !target.allow_retroactive
            && self.store.has_stage_output(m.id, stage).await?
        {
            debug!(job_id = %job.id, match_id = m.id, stage = %stage, "Stage output exists, skipping");
            return Ok(HandlerOutcome::Skipped(format!(
                "{} output exists for match {}",
                stage, m.id
            )));
        }

        self.inner.handle(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Match;
    use crate::queue::{JobId, JobPayload, MatchJob, SweepKind};
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, _job: &Job) -> Result<HandlerOutcome, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Done)
        }
    }

    fn stage_job(stage: Stage, match_id: i64, allow_retroactive: bool) -> Job {
        let payload = MatchJob {
            match_id,
            external_id: match_id * 100,
            kickoff: Utc::now(),
            allow_retroactive,
        };
        Job::new(
            JobId::for_stage(stage, match_id),
            JobPayload::for_stage(stage, payload),
            stage.base_priority(),
            Utc::now(),
        )
    }

    async fn guard_with(m: Match) -> MatchGuard<Arc<Counting>> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_match(&m).await.unwrap();
        MatchGuard::new(store, Arc::new(Counting::default()))
    }

    #[tokio::test]
    async fn test_scheduled_match_proceeds() {
        let guard = guard_with(Match::new(1, Some(100), Utc::now())).await;
        let outcome = guard.handle(&stage_job(Stage::Lineups, 1, false)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert_eq!(guard.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_match_is_terminal() {
        let guard = guard_with(Match::new(1, Some(100), Utc::now())).await;
        let err = guard.handle(&stage_job(Stage::Analysis, 2, false)).await.unwrap_err();
        assert!(matches!(err, JobError::MatchNotFound(2)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancelled_match_is_terminal() {
        let m = Match::new(3, Some(300), Utc::now()).with_status(MatchStatus::Postponed);
        let guard = guard_with(m).await;
        let err = guard.handle(&stage_job(Stage::Predictions, 3, true)).await.unwrap_err();
        assert!(matches!(err, JobError::MatchCancelled(3)));
        assert_eq!(guard.inner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finished_match_skips_pre_match_stage() {
        let m = Match::new(4, Some(400), Utc::now()).with_status(MatchStatus::Finished);
        let guard = guard_with(m).await;

        let outcome = guard.handle(&stage_job(Stage::Lineups, 4, false)).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));

        let outcome = guard.handle(&stage_job(Stage::LiveMonitor, 4, true)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);

        let outcome = guard.handle(&stage_job(Stage::Settlement, 4, true)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert_eq!(guard.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_existing_output_skips_stage_unless_retroactive() {
        let store = Arc::new(MemoryStore::with_matches([Match::new(6, Some(600), Utc::now())]));
        store.record_stage_output(6, Stage::Analysis).await;
        let guard = MatchGuard::new(store.clone(), Arc::new(Counting::default()));

        let outcome = guard.handle(&stage_job(Stage::Analysis, 6, false)).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Skipped(_)));

        let outcome = guard.handle(&stage_job(Stage::Analysis, 6, true)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);

        let outcome = guard.handle(&stage_job(Stage::Lineups, 6, false)).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert_eq!(guard.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_settlement_requires_finished_match() {
        let m = Match::new(5, Some(500), Utc::now()).with_status(MatchStatus::Live);
        let guard = guard_with(m).await;
        let err = guard.handle(&stage_job(Stage::Settlement, 5, true)).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_sweep_jobs_pass_through() {
        let guard = guard_with(Match::new(1, Some(100), Utc::now())).await;
        let job = Job::new(
            JobId::for_sweep(SweepKind::GapScan),
            JobPayload::for_sweep(SweepKind::GapScan, Utc::now()),
            1,
            Utc::now(),
        );
        assert_eq!(guard.handle(&job).await.unwrap(), HandlerOutcome::Done);
    }
}
