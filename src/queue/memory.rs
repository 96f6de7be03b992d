//! In-process queue backend.
//!
//! Mirrors the Redis layout with plain maps behind one async mutex, which
//! makes every operation atomic. Used by tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backend::{EnqueueOutcome, JobQueue, QueueCounts, QueueError, StalledRecovery};
use super::dead_letter::{DeadLetterEntry, RetentionPolicy};
use super::job::{Job, JobId, JobRecord, JobState};
use crate::model::QueueKind;
use crate::scheduler::timing::to_chrono;

struct Slot {
    job: Job,
    state: JobState,
    locked_until: Option<DateTime<Utc>>,
    /// Insertion order, used as the FIFO tiebreak between equal priorities.
    seq: u64,
    /// Set once the job is completed or failed.
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Slot>,
    /// Newest first.
    dead_letters: Vec<DeadLetterEntry>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn finish(&mut self, job: &Job, state: JobState, now: DateTime<Utc>) -> Result<(), QueueError> {
        let slot = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::JobNotFound(job.id.clone()))?;
        slot.job = job.clone();
        slot.state = state;
        slot.locked_until = None;
        slot.finished_at = Some(now);
        Ok(())
    }

    /// Drops finished records older than the retention age, then the oldest
    /// ones beyond the retention count. Pending jobs are never touched.
    fn prune_finished(&mut self, retention: &RetentionPolicy, now: DateTime<Utc>) {
        self.jobs
            .retain(|_, slot| slot.finished_at.map_or(true, |at| !retention.is_expired(at, now)));

        let mut finished: Vec<(DateTime<Utc>, u64, JobId)> = self
            .jobs
            .iter()
            .filter_map(|(id, slot)| slot.finished_at.map(|at| (at, slot.seq, id.clone())))
            .collect();
        if finished.len() > retention.max_count {
            finished.sort_by_key(|(at, seq, _)| (*at, *seq));
            let excess = finished.len() - retention.max_count;
            for (_, _, id) in finished.into_iter().take(excess) {
                self.jobs.remove(&id);
            }
        }
    }
}

/// Queue held entirely in memory.
pub struct MemoryQueue {
    kind: QueueKind,
    inner: Mutex<Inner>,
    finished_retention: RetentionPolicy,
}

impl MemoryQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(Inner::default()),
            finished_retention: RetentionPolicy::finished_jobs(),
        }
    }

    /// Sets how many completed and failed records are kept.
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.finished_retention = retention;
        self
    }

    /// Number of jobs in any state.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue_unique(&self, job: Job, now: DateTime<Utc>) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.inner.lock().await;

        let replaced = match inner.jobs.get(&job.id) {
            Some(slot) if slot.state.is_pending() => return Ok(EnqueueOutcome::Skipped(slot.state)),
            Some(_) => true,
            None => false,
        };

        let state = if job.run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let seq = inner.next_seq();
        inner.jobs.insert(
            job.id.clone(),
            Slot {
                job,
                state,
                locked_until: None,
                seq,
                finished_at: None,
            },
        );

        Ok(if replaced {
            EnqueueOutcome::Replaced
        } else {
            EnqueueOutcome::Created
        })
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(id).map(|slot| JobRecord {
            job: slot.job.clone(),
            state: slot.state,
            locked_until: slot.locked_until,
        }))
    }

    async fn remove(&self, id: &JobId) -> Result<bool, QueueError> {
        Ok(self.inner.lock().await.jobs.remove(id).is_some())
    }

    async fn claim(&self, now: DateTime<Utc>, lock_for: Duration) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().await;

        for slot in inner.jobs.values_mut() {
            if slot.state == JobState::Delayed && slot.job.run_at <= now {
                slot.state = JobState::Waiting;
            }
        }

        let next = inner
            .jobs
            .values()
            .filter(|slot| slot.state == JobState::Waiting)
            .min_by_key(|slot| (slot.job.priority, slot.job.run_at, slot.seq))
            .map(|slot| slot.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(slot) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        slot.state = JobState::Active;
        slot.locked_until = Some(now + to_chrono(lock_for));
        Ok(Some(slot.job.clone()))
    }

    async fn complete(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.finish(job, JobState::Completed, now)?;
        inner.prune_finished(&self.finished_retention, now);
        Ok(())
    }

    async fn retry_later(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        let slot = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::JobNotFound(job.id.clone()))?;
        slot.job = job.clone();
        slot.state = if job.run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        slot.locked_until = None;
        slot.seq = seq;
        Ok(())
    }

    async fn fail(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.finish(job, JobState::Failed, now)?;
        inner.prune_finished(&self.finished_retention, now);
        Ok(())
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<StalledRecovery, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut recovery = StalledRecovery::default();

        for slot in inner.jobs.values_mut() {
            let expired = slot.state == JobState::Active
                && slot.locked_until.is_some_and(|until| until <= now);
            if !expired {
                continue;
            }

            slot.job.stalled_count += 1;
            slot.locked_until = None;
            if slot.job.stalled_count > max_stalled {
                slot.job.last_error = Some(format!(
                    "job stalled {} times (limit {})",
                    slot.job.stalled_count, max_stalled
                ));
                slot.state = JobState::Failed;
                slot.finished_at = Some(now);
                recovery.exhausted.push(slot.job.clone());
            } else {
                slot.state = JobState::Waiting;
                recovery.requeued += 1;
            }
        }

        Ok(recovery)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.lock().await;
        let mut counts = QueueCounts::default();
        for slot in inner.jobs.values() {
            counts.add(slot.state);
        }
        counts.dead_letter = inner.dead_letters.len();
        Ok(counts)
    }

    async fn push_dead_letter(
        &self,
        entry: DeadLetterEntry,
        retention: &RetentionPolicy,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let now = entry.failed_at.max(Utc::now());
        inner.dead_letters.insert(0, entry);
        retention.apply(&mut inner.dead_letters, now);
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .dead_letters
            .iter()
            .find(|entry| entry.entry_id == entry_id)
            .cloned())
    }

    async fn take_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, QueueError> {
        let mut inner = self.inner.lock().await;
        let position = inner
            .dead_letters
            .iter()
            .position(|entry| entry.entry_id == entry_id);
        Ok(position.map(|idx| inner.dead_letters.remove(idx)))
    }

    async fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let dropped = inner.dead_letters.len();
        inner.dead_letters.clear();
        Ok(dropped)
    }
}
