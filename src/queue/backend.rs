//! The queue backend contract shared by the Redis and in-memory queues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::dead_letter::{DeadLetterEntry, RetentionPolicy};
use super::job::{Job, JobId, JobRecord, JobState};
use crate::model::QueueKind;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the backend.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// The backend returned something the client does not understand.
    #[error("Unexpected backend reply: {0}")]
    UnexpectedReply(String),
}

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// No job with this identity existed.
    Created,
    /// A completed or failed instance was removed and a fresh one created.
    Replaced,
    /// A pending instance already exists; nothing changed.
    Skipped(JobState),
}

impl EnqueueOutcome {
    /// Whether a new job instance now exists.
    pub fn created(self) -> bool {
        matches!(self, EnqueueOutcome::Created | EnqueueOutcome::Replaced)
    }
}

/// Per-state job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Waiting => self.waiting += 1,
            JobState::Delayed => self.delayed += 1,
            JobState::Active => self.active += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    /// Jobs that still have to run.
    pub fn pending(&self) -> usize {
        self.waiting + self.delayed + self.active
    }
}

/// Outcome of one stalled-job sweep.
#[derive(Debug, Clone, Default)]
pub struct StalledRecovery {
    /// Jobs returned to the waiting state.
    pub requeued: usize,
    /// Jobs that stalled too often; now `failed`, to be dead-lettered by the caller.
    pub exhausted: Vec<Job>,
}

/// A persistent job queue.
///
/// All coordination between workers and trigger paths happens through these
/// operations. `enqueue_unique` and `claim` are atomic in every implementation.
/// Timestamps are passed in so callers control the clock.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// The queue this handle addresses.
    fn kind(&self) -> QueueKind;

    /// Creates `job` unless a job with the same identity is waiting, delayed
    /// or active. A completed or failed instance is replaced.
    async fn enqueue_unique(&self, job: Job, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError>;

    /// Looks up a job by identity.
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, QueueError>;

    /// Deletes a job regardless of state. Returns whether it existed.
    async fn remove(&self, id: &JobId) -> Result<bool, QueueError>;

    /// Promotes due delayed jobs, then claims the most urgent waiting job and
    /// locks it until `now + lock_for`.
    async fn claim(&self, now: DateTime<Utc>, lock_for: Duration) -> Result<Option<Job>, QueueError>;

    /// Marks an active job completed.
    async fn complete(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Moves an active job back to delayed until `job.run_at`.
    async fn retry_later(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Marks an active job failed.
    async fn fail(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Returns active jobs whose lock expired to the waiting state, or fails
    /// them once they stalled more than `max_stalled` times.
    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<StalledRecovery, QueueError>;

    /// Per-state counts including the dead-letter store.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Stores a dead-letter entry and applies the retention policy.
    async fn push_dead_letter(
        &self,
        entry: DeadLetterEntry,
        retention: &RetentionPolicy,
    ) -> Result<(), QueueError>;

    /// Newest-first dead-letter entries.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Looks up a dead-letter entry without removing it.
    async fn dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError>;

    /// Removes and returns a dead-letter entry.
    async fn take_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError>;

    /// Drops every dead-letter entry. Returns how many were dropped.
    async fn purge_dead_letters(&self) -> Result<usize, QueueError>;
}

/// Handles to all six queues.
///
/// Constructed once at process start and shared by reference; there is no
/// process-wide queue state.
#[derive(Clone)]
pub struct QueueSet {
    analysis: Arc<dyn JobQueue>,
    lineups: Arc<dyn JobQueue>,
    predictions: Arc<dyn JobQueue>,
    live_monitor: Arc<dyn JobQueue>,
    settlement: Arc<dyn JobQueue>,
    backfill: Arc<dyn JobQueue>,
}

impl QueueSet {
    /// Builds the set by asking `open` for each queue.
    pub fn build(mut open: impl FnMut(QueueKind) -> Arc<dyn JobQueue>) -> Self {
        Self {
            analysis: open(QueueKind::Analysis),
            lineups: open(QueueKind::Lineups),
            predictions: open(QueueKind::Predictions),
            live_monitor: open(QueueKind::LiveMonitor),
            settlement: open(QueueKind::Settlement),
            backfill: open(QueueKind::Backfill),
        }
    }

    /// In-memory queues for tests and single-process runs.
    pub fn in_memory() -> Self {
        Self::build(|kind| Arc::new(super::memory::MemoryQueue::new(kind)))
    }

    pub fn get(&self, kind: QueueKind) -> &Arc<dyn JobQueue> {
        match kind {
            QueueKind::Analysis => &self.analysis,
            QueueKind::Lineups => &self.lineups,
            QueueKind::Predictions => &self.predictions,
            QueueKind::LiveMonitor => &self.live_monitor,
            QueueKind::Settlement => &self.settlement,
            QueueKind::Backfill => &self.backfill,
        }
    }

    /// Every queue paired with its kind, in pipeline order.
    pub fn iter(&self) -> impl Iterator<Item = (QueueKind, &Arc<dyn JobQueue>)> + '_ {
        QueueKind::ALL.into_iter().map(move |kind| (kind, self.get(kind)))
    }
}
