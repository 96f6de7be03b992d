//! Scheduling behavior through the public API, against in-memory queues.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use fixture_pipeline::model::{Match, MatchStatus, QueueKind, Stage};
use fixture_pipeline::queue::{EnqueueOutcome, JobId, JobState, QueueSet};
use fixture_pipeline::recovery::{CatchUp, CatchUpWindow};
use fixture_pipeline::scheduler::{Scheduler, Timing, Trigger, MAX_URGENCY};
use fixture_pipeline::storage::MemoryStore;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 11, 7, 10, 0, 0).unwrap()
}

fn scheduler() -> (Scheduler, QueueSet) {
    let queues = QueueSet::in_memory();
    (Scheduler::new(queues.clone(), Timing::default()), queues)
}

async fn run_at(queues: &QueueSet, stage: Stage, match_id: i64) -> Option<DateTime<Utc>> {
    queues
        .get(stage.into())
        .get(&JobId::for_stage(stage, match_id))
        .await
        .expect("queue reachable")
        .map(|record| record.job.run_at)
}

#[tokio::test]
async fn test_catch_up_scenario_creates_three_timed_jobs_once() {
    let queues = QueueSet::in_memory();
    let store = Arc::new(MemoryStore::with_matches([Match::new(
        1,
        Some(501),
        now() + Duration::hours(36),
    )]));
    let catch_up = CatchUp::new(
        store,
        Scheduler::new(queues.clone(), Timing::default()),
        CatchUpWindow::default(),
    );

    let report = catch_up.run_at(now()).await.expect("catch-up succeeds");
    assert_eq!(report.jobs_created, 3);

    assert_eq!(run_at(&queues, Stage::Analysis, 1).await, Some(now() + Duration::hours(30)));
    assert_eq!(run_at(&queues, Stage::Lineups, 1).await, Some(now() + Duration::hours(35)));
    assert_eq!(
        run_at(&queues, Stage::Predictions, 1).await,
        Some(now() + Duration::minutes(35 * 60 + 30))
    );

    let again = catch_up.run_at(now()).await.expect("catch-up succeeds");
    assert_eq!(again.jobs_created, 0);
}

#[tokio::test]
async fn test_second_schedule_is_a_no_op() {
    let (scheduler, _) = scheduler();
    let m = Match::new(2, Some(502), now() + Duration::hours(8));

    assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::Ingestion).await.unwrap(), 3);
    assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::Ingestion).await.unwrap(), 0);
}

#[tokio::test]
async fn test_past_due_stages_are_not_skipped() {
    let (scheduler, queues) = scheduler();
    let m = Match::new(3, Some(503), now() - Duration::hours(2));

    assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::CatchUp).await.unwrap(), 3);
    for stage in Stage::PRE_MATCH {
        assert_eq!(run_at(&queues, stage, 3).await, Some(now() + Duration::seconds(1)));
        let record = queues
            .get(stage.into())
            .get(&JobId::for_stage(stage, 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.job.priority, MAX_URGENCY);
    }
}

#[tokio::test]
async fn test_terminal_status_blocks_scheduling() {
    let (scheduler, queues) = scheduler();
    for (id, status) in [
        (4, MatchStatus::Finished),
        (5, MatchStatus::Cancelled),
        (6, MatchStatus::Postponed),
    ] {
        let m = Match::new(id, Some(500 + id), now() + Duration::hours(3)).with_status(status);
        assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::Manual).await.unwrap(), 0);
    }

    let m = Match::new(7, None, now() + Duration::hours(3));
    assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::Manual).await.unwrap(), 0);

    for (_, queue) in queues.iter() {
        assert_eq!(queue.counts().await.unwrap().pending(), 0);
    }
}

#[tokio::test]
async fn test_priority_escalates_near_kickoff() {
    let (scheduler, _) = scheduler();
    let m = Match::new(8, Some(508), now() + Duration::minutes(20));

    let lineups = scheduler.build_job(&m, Stage::Lineups, false, now()).unwrap();
    assert_eq!(lineups.priority, Stage::Lineups.base_priority() - 2);

    let far = Match::new(9, Some(509), now() + Duration::hours(5));
    let analysis = scheduler.build_job(&far, Stage::Analysis, false, now()).unwrap();
    assert_eq!(analysis.priority, Stage::Analysis.base_priority());

    let live_match = m.clone().with_status(MatchStatus::Live);
    let live = scheduler
        .build_job(&live_match, Stage::LiveMonitor, false, now() + Duration::hours(1))
        .unwrap();
    assert_eq!(live.priority, Stage::LiveMonitor.base_priority());
}

#[tokio::test]
async fn test_completed_job_is_replaced_but_active_is_untouched() {
    let (scheduler, queues) = scheduler();
    let m = Match::new(10, Some(510), now() - Duration::hours(1));
    let queue = queues.get(QueueKind::Predictions);
    let id = JobId::for_stage(Stage::Predictions, 10);

    scheduler.schedule_jobs_at(&m, now(), Trigger::Ingestion).await.unwrap();

    // Claim it: an active job must not be replaced
    let active = queue
        .claim(now() + Duration::seconds(5), StdDuration::from_secs(60))
        .await
        .unwrap()
        .expect("job is due");
    assert_eq!(active.id, id);

    let outcome = scheduler
        .enqueue_stage(&m, Stage::Predictions, false, now(), Trigger::Backfill)
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Skipped(JobState::Active));

    queue.complete(&active, now() + Duration::seconds(10)).await.unwrap();
    let outcome = scheduler
        .enqueue_stage(&m, Stage::Predictions, false, now(), Trigger::Backfill)
        .await
        .unwrap();
    assert_eq!(outcome, EnqueueOutcome::Replaced);
    assert_eq!(queue.get(&id).await.unwrap().unwrap().state, JobState::Delayed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_schedule_calls_create_each_job_once() {
    let (scheduler, queues) = scheduler();
    let m = Match::new(11, Some(511), now() + Duration::hours(12));

    let calls = (0..16).map(|i| {
        let scheduler = scheduler.clone();
        let m = m.clone();
        let trigger = if i % 2 == 0 { Trigger::CatchUp } else { Trigger::Backfill };
        tokio::spawn(async move { scheduler.schedule_jobs_at(&m, now(), trigger).await })
    });

    let created: usize = join_all(calls)
        .await
        .into_iter()
        .map(|joined| joined.expect("task joins").expect("schedule succeeds"))
        .sum();

    assert_eq!(created, 3);
    for stage in Stage::PRE_MATCH {
        assert_eq!(queues.get(stage.into()).counts().await.unwrap().delayed, 1);
    }
}

#[tokio::test]
async fn test_recovery_bypasses_status_gate() {
    let (scheduler, queues) = scheduler();
    let m = Match::new(12, Some(512), now() - Duration::hours(4)).with_status(MatchStatus::Finished);

    assert_eq!(scheduler.schedule_jobs_at(&m, now(), Trigger::Manual).await.unwrap(), 0);
    assert!(scheduler.schedule_recovery_at(&m, Stage::Settlement, now()).await.unwrap());
    assert!(!scheduler.schedule_recovery_at(&m, Stage::Settlement, now()).await.unwrap());

    let record = queues
        .get(QueueKind::Settlement)
        .get(&JobId::for_stage(Stage::Settlement, 12))
        .await
        .unwrap()
        .unwrap();
    assert!(record.job.payload.match_job().unwrap().allow_retroactive);
}
