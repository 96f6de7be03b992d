//! Job execution end to end: scheduling, retries, guards, dead letters.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fixture_pipeline::error::JobError;
use fixture_pipeline::ingestion::FixtureIngestor;
use fixture_pipeline::model::{FixtureUpdate, Match, MatchStatus, QueueKind, Stage};
use fixture_pipeline::queue::{BackoffPolicy, Job, JobId, JobState, QueueSet};
use fixture_pipeline::scheduler::{Scheduler, Timing, Trigger};
use fixture_pipeline::status::replay_dead_letter;
use fixture_pipeline::storage::{FixtureStore, MemoryStore};
use fixture_pipeline::worker::{
    HandlerOutcome, JobHandler, JobOutcome, JobRunner, MatchGuard, WorkerPoolConfig,
};
use tokio::sync::Mutex;

/// Replays a fixed list of results, then succeeds.
struct Scripted {
    results: Mutex<VecDeque<Result<HandlerOutcome, JobError>>>,
    seen: Mutex<Vec<(JobId, u32)>>,
}

impl Scripted {
    fn new(results: impl IntoIterator<Item = Result<HandlerOutcome, JobError>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into_iter().collect()),
            seen: Mutex::default(),
        })
    }

    fn always_done() -> Arc<Self> {
        Self::new(Vec::<Result<HandlerOutcome, JobError>>::new())
    }
}

#[async_trait]
impl JobHandler for Scripted {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        self.seen.lock().await.push((job.id.clone(), job.attempts));
        self.results
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(HandlerOutcome::Done))
    }
}

/// Writes the stage output record the way a real stage handler does.
struct OutputWriter {
    store: Arc<MemoryStore>,
    runs: Mutex<Vec<JobId>>,
}

#[async_trait]
impl JobHandler for OutputWriter {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        self.runs.lock().await.push(job.id.clone());
        if let (Some(target), Some(stage)) = (job.payload.match_job(), job.payload.stage()) {
            self.store.record_stage_output(target.match_id, stage).await;
        }
        Ok(HandlerOutcome::Done)
    }
}

fn immediate_retries(max_attempts: u32) -> WorkerPoolConfig {
    WorkerPoolConfig::new(1).with_backoff(BackoffPolicy {
        max_attempts,
        base_delay: StdDuration::ZERO,
        max_delay: StdDuration::ZERO,
    })
}

/// Schedules a past-due match so its jobs are claimable right away.
async fn schedule_due(queues: &QueueSet, m: &Match) {
    schedule_due_with_attempts(queues, m, 3).await;
}

async fn schedule_due_with_attempts(queues: &QueueSet, m: &Match, max_attempts: u32) {
    let scheduler =
        Scheduler::new(queues.clone(), Timing::default()).with_max_attempts(max_attempts);
    let created = scheduler
        .schedule_jobs_at(m, Utc::now() - Duration::seconds(5), Trigger::Manual)
        .await
        .unwrap();
    assert!(created > 0);
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let queues = QueueSet::in_memory();
    schedule_due(&queues, &Match::new(1, Some(11), Utc::now() - Duration::hours(1))).await;

    let handler = Scripted::new([
        Err(JobError::Unavailable("connection reset".into())),
        Err(JobError::upstream(503, "maintenance")),
    ]);
    let runner = JobRunner::new(
        immediate_retries(3),
        queues.get(QueueKind::Analysis).clone(),
        handler.clone(),
    );

    assert!(matches!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Retried { .. })));
    assert!(matches!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Retried { .. })));
    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
    assert_eq!(runner.run_once("w").await.unwrap(), None);

    let attempts: Vec<u32> = handler.seen.lock().await.iter().map(|(_, a)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let stats = runner.stats();
    assert_eq!(stats.jobs_retried, 2);
    assert_eq!(stats.jobs_completed, 1);
}

#[tokio::test]
async fn test_terminal_failure_dead_letters_and_replays() {
    let queues = QueueSet::in_memory();
    schedule_due(&queues, &Match::new(2, Some(12), Utc::now() - Duration::hours(1))).await;
    let queue = queues.get(QueueKind::Lineups).clone();

    let handler = Scripted::new([Err(JobError::upstream(422, "unknown fixture"))]);
    let runner = JobRunner::new(immediate_retries(3), queue.clone(), handler.clone());

    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Failed));

    let original = JobId::for_stage(Stage::Lineups, 2);
    assert_eq!(queue.get(&original).await.unwrap().unwrap().state, JobState::Failed);

    let entries = queue.dead_letters(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].match_id, Some(2));
    assert!(entries[0].error.contains("422"));

    let replayed = replay_dead_letter(&queues, QueueKind::Lineups, entries[0].entry_id, Utc::now())
        .await
        .unwrap();
    assert_ne!(replayed, original);
    assert!(queue.dead_letters(10).await.unwrap().is_empty());

    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
    let seen = handler.seen.lock().await;
    assert_eq!(seen.last(), Some(&(replayed, 1)));
}

#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let queues = QueueSet::in_memory();
    let m = Match::new(3, Some(13), Utc::now() - Duration::hours(1));
    schedule_due_with_attempts(&queues, &m, 2).await;

    let handler = Scripted::new([
        Err(JobError::Timeout("provider".into())),
        Err(JobError::RateLimited { retry_after: None }),
    ]);
    let runner = JobRunner::new(
        immediate_retries(2),
        queues.get(QueueKind::Predictions).clone(),
        handler,
    );

    assert!(matches!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Retried { .. })));
    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Failed));
    assert_eq!(
        queues.get(QueueKind::Predictions).dead_letters(10).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_guard_dead_letters_jobs_for_cancelled_match() {
    let queues = QueueSet::in_memory();
    let m = Match::new(4, Some(14), Utc::now() - Duration::hours(1));
    let store = Arc::new(MemoryStore::with_matches([m.clone()]));
    schedule_due(&queues, &m).await;

    // Called off after the jobs were enqueued
    store.set_status(4, MatchStatus::Cancelled).await;

    let inner = Scripted::always_done();
    let store: Arc<dyn FixtureStore> = store;
    let runner = JobRunner::new(
        immediate_retries(3),
        queues.get(QueueKind::Analysis).clone(),
        Arc::new(MatchGuard::new(store, inner.clone())),
    );

    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Failed));
    assert!(inner.seen.lock().await.is_empty());

    let entries = queues.get(QueueKind::Analysis).dead_letters(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].error.contains("cancelled"));
}

#[tokio::test]
async fn test_guard_skips_pre_match_work_for_finished_match() {
    let queues = QueueSet::in_memory();
    let m = Match::new(5, Some(15), Utc::now() - Duration::hours(1));
    let store = Arc::new(MemoryStore::with_matches([m.clone()]));
    schedule_due(&queues, &m).await;
    store.set_status(5, MatchStatus::Finished).await;

    let inner = Scripted::always_done();
    let store: Arc<dyn FixtureStore> = store;
    let runner = JobRunner::new(
        immediate_retries(3),
        queues.get(QueueKind::Predictions).clone(),
        Arc::new(MatchGuard::new(store, inner.clone())),
    );

    assert!(matches!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Skipped(_))));
    assert!(inner.seen.lock().await.is_empty());
    assert_eq!(
        queues
            .get(QueueKind::Predictions)
            .get(&JobId::for_stage(Stage::Predictions, 5))
            .await
            .unwrap()
            .unwrap()
            .state,
        JobState::Completed
    );
}

#[tokio::test]
async fn test_repeated_ingestion_does_not_rerun_completed_stage() {
    let queues = QueueSet::in_memory();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(queues.clone(), Timing::default());
    let ingestor = FixtureIngestor::new(store.clone(), scheduler);

    let update = FixtureUpdate {
        match_id: 6,
        external_id: Some(16),
        kickoff: Utc::now() + Duration::hours(3),
        status: MatchStatus::Scheduled,
        home_score: None,
        away_score: None,
    };
    // Analysis is past due and lands just behind the poll time
    let poll_at = Utc::now() - Duration::seconds(5);

    let writer = Arc::new(OutputWriter {
        store: store.clone(),
        runs: Mutex::default(),
    });
    let guarded: Arc<dyn FixtureStore> = store.clone();
    let runner = JobRunner::new(
        immediate_retries(3),
        queues.get(QueueKind::Analysis).clone(),
        Arc::new(MatchGuard::new(guarded, writer.clone())),
    );

    let first = ingestor.ingest_at(vec![update.clone()], poll_at).await;
    assert_eq!(first.jobs_created, 3);
    assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
    assert!(store.has_stage_output(6, Stage::Analysis).await.unwrap());

    // The next poll replaces the completed job, but the output record wins
    let second = ingestor.ingest_at(vec![update], poll_at).await;
    assert_eq!(second.jobs_created, 1);
    assert!(matches!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Skipped(_))));

    assert_eq!(writer.runs.lock().await.len(), 1);
}
