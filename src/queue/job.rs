//! Job definitions for the stage queues.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: A unit of work to be executed by workers
//! - `JobId`: Deterministic identity derived from (stage, match id)
//! - `JobPayload`: Closed set of per-queue payload shapes
//! - `JobState`: Where a job currently sits inside its queue

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Match, QueueKind, Stage};

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identity of a job inside its queue.
///
/// Stage jobs use `"{stage}-{match_id}"`, so independent trigger paths that
/// try to create the same job collide instead of duplicating it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Identity of the job running `stage` for `match_id`.
    pub fn for_stage(stage: Stage, match_id: i64) -> Self {
        Self(format!("{}-{}", stage.as_str(), match_id))
    }

    /// Identity of a recurring sweep on the backfill queue.
    pub fn for_sweep(sweep: SweepKind) -> Self {
        Self(sweep.as_str().to_string())
    }

    /// A fresh identity for an operator replay of this job.
    pub fn replay_of(&self) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-replay-{}", self.0, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload shared by every match-bound stage job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchJob {
    pub match_id: i64,
    pub external_id: i64,
    pub kickoff: DateTime<Utc>,
    /// Set on recovery-triggered jobs: the handler must not refuse the job
    /// because the match already left the status the stage normally needs.
    #[serde(default)]
    pub allow_retroactive: bool,
}

impl MatchJob {
    /// Builds the payload for a match. Returns `None` when the match has no
    /// external id.
    pub fn for_match(m: &Match, allow_retroactive: bool) -> Option<Self> {
        Some(Self {
            match_id: m.id,
            external_id: m.external_id?,
            kickoff: m.kickoff,
            allow_retroactive,
        })
    }
}

/// Recurring sweeps executed on the backfill queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SweepKind {
    /// Gap detection across the per-stage windows.
    GapScan,
    /// Stuck-match detection.
    StuckScan,
}

impl SweepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::GapScan => "gap-scan",
            SweepKind::StuckScan => "stuck-scan",
        }
    }
}

/// Payload of a sweep job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepJob {
    pub requested_at: DateTime<Utc>,
}

/// What a job does. One variant per queue operation, each with a fixed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    Analysis(MatchJob),
    Lineups(MatchJob),
    Predictions(MatchJob),
    LiveMonitor(MatchJob),
    Settlement(MatchJob),
    GapScan(SweepJob),
    StuckScan(SweepJob),
}

impl JobPayload {
    /// Wraps a match payload in the variant for `stage`.
    pub fn for_stage(stage: Stage, job: MatchJob) -> Self {
        match stage {
            Stage::Analysis => JobPayload::Analysis(job),
            Stage::Lineups => JobPayload::Lineups(job),
            Stage::Predictions => JobPayload::Predictions(job),
            Stage::LiveMonitor => JobPayload::LiveMonitor(job),
            Stage::Settlement => JobPayload::Settlement(job),
        }
    }

    /// Wraps a sweep request.
    pub fn for_sweep(sweep: SweepKind, requested_at: DateTime<Utc>) -> Self {
        let job = SweepJob { requested_at };
        match sweep {
            SweepKind::GapScan => JobPayload::GapScan(job),
            SweepKind::StuckScan => JobPayload::StuckScan(job),
        }
    }

    /// The stage this payload executes, `None` for sweeps.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobPayload::Analysis(_) => Some(Stage::Analysis),
            JobPayload::Lineups(_) => Some(Stage::Lineups),
            JobPayload::Predictions(_) => Some(Stage::Predictions),
            JobPayload::LiveMonitor(_) => Some(Stage::LiveMonitor),
            JobPayload::Settlement(_) => Some(Stage::Settlement),
            JobPayload::GapScan(_) | JobPayload::StuckScan(_) => None,
        }
    }

    /// The queue this payload belongs on.
    pub fn queue(&self) -> QueueKind {
        self.stage().map(QueueKind::from).unwrap_or(QueueKind::Backfill)
    }

    /// The match payload, if this is a stage job.
    pub fn match_job(&self) -> Option<&MatchJob> {
        match self {
            JobPayload::Analysis(job)
            | JobPayload::Lineups(job)
            | JobPayload::Predictions(job)
            | JobPayload::LiveMonitor(job)
            | JobPayload::Settlement(job) => Some(job),
            JobPayload::GapScan(_) | JobPayload::StuckScan(_) => None,
        }
    }

    pub fn match_id(&self) -> Option<i64> {
        self.match_job().map(|job| job.match_id)
    }
}

/// A job representing a unit of work to be executed.
///
/// Jobs are stored in the queue backend and processed by workers. They carry
/// retry and stall bookkeeping so any worker instance can pick them up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic identity within the queue.
    pub id: JobId,
    /// What to execute.
    pub payload: JobPayload,
    /// Claim order among eligible jobs (lower values = more urgent).
    pub priority: i32,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// When this job instance was created.
    pub created_at: DateTime<Utc>,
    /// Number of times this job has been attempted.
    pub attempts: u32,
    /// Maximum number of attempts before moving to the dead-letter store.
    pub max_attempts: u32,
    /// Number of times the job was recovered after its lock expired.
    #[serde(default)]
    pub stalled_count: u32,
    /// Error recorded by the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a job that becomes eligible at `run_at`.
    pub fn new(id: JobId, payload: JobPayload, priority: i32, run_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            priority,
            run_at,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stalled_count: 0,
            last_error: None,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn queue(&self) -> QueueKind {
        self.payload.queue()
    }

    /// Increments the attempt counter.
    ///
    /// Called by the worker when it claims the job.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether a retryable failure may be retried.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Copy of this job for an operator replay: fresh identity, counters reset,
    /// eligible immediately.
    pub fn replayed(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.replay_of(),
            payload: self.payload.clone(),
            priority: self.priority,
            run_at: now,
            created_at: now,
            attempts: 0,
            max_attempts: self.max_attempts,
            stalled_count: 0,
            last_error: None,
        }
    }
}

/// Position of a job inside its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible and waiting to be claimed.
    Waiting,
    /// Not eligible before its run-at time.
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; a dead-letter entry exists.
    Failed,
}

impl JobState {
    /// Pending states block creation of a job with the same identity.
    pub fn is_pending(self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed | JobState::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job together with its queue state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub state: JobState,
    /// Lock expiry while the job is active.
    pub locked_until: Option<DateTime<Utc>>,
}
