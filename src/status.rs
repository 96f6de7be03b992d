//! Operator view of the queues and the dead-letter store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::model::QueueKind;
use crate::queue::{DeadLetterEntry, JobId, QueueCounts, QueueError, QueueSet};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Dead letter entry {0} not found")]
    EntryNotFound(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue: QueueKind,
    #[serde(flatten)]
    pub counts: QueueCounts,
    /// Newest dead-letter entries, up to the requested limit.
    pub dead_letters: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub queues: Vec<QueueStatus>,
}

impl StatusReport {
    pub fn totals(&self) -> QueueCounts {
        self.queues.iter().fold(QueueCounts::default(), |mut acc, q| {
            acc.waiting += q.counts.waiting;
            acc.delayed += q.counts.delayed;
            acc.active += q.counts.active;
            acc.completed += q.counts.completed;
            acc.failed += q.counts.failed;
            acc.dead_letter += q.counts.dead_letter;
            acc
        })
    }
}

/// Collects per-queue counts and the newest `dead_letter_limit` entries of
/// each dead-letter store. Also refreshes the queue depth gauges.
pub async fn collect_status(
    queues: &QueueSet,
    dead_letter_limit: usize,
) -> Result<StatusReport, QueueError> {
    let metrics = MetricsCollector::new();
    let mut report = StatusReport {
        generated_at: Utc::now(),
        queues: Vec::with_capacity(QueueKind::ALL.len()),
    };

    for (kind, queue) in queues.iter() {
        let counts = queue.counts().await?;
        metrics.update_queue_counts(kind.as_str(), &counts);
        let dead_letters = if dead_letter_limit > 0 {
            queue.dead_letters(dead_letter_limit).await?
        } else {
            Vec::new()
        };
        report.queues.push(QueueStatus {
            queue: kind,
            counts,
            dead_letters,
        });
    }

    Ok(report)
}

/// Re-enqueues a dead-letter entry as a fresh job.
///
/// The replay gets a new identity and reset attempts, so it never collides
/// with the original job's record. The entry is removed from the store only
/// after the replay was enqueued; a failed enqueue leaves it in place.
pub async fn replay_dead_letter(
    queues: &QueueSet,
    kind: QueueKind,
    entry_id: Uuid,
    now: DateTime<Utc>,
) -> Result<JobId, StatusError> {
    let queue = queues.get(kind);
    let entry = queue
        .dead_letter(entry_id)
        .await?
        .ok_or(StatusError::EntryNotFound(entry_id))?;

    let replay = entry.job.replayed(now);
    let replay_id = replay.id.clone();
    queue.enqueue_unique(replay, now).await?;

    if queue.take_dead_letter(entry_id).await?.is_none() {
        warn!(queue = %kind, entry_id = %entry_id, "Dead letter entry removed during replay");
    }

    info!(
        queue = %kind,
        entry_id = %entry_id,
        original = %entry.job.id,
        replay = %replay_id,
        "Replayed dead letter entry"
    );

    Ok(replay_id)
}

/// Drops the dead-letter entries of `kind`, or of every queue. Returns how
/// many were dropped.
pub async fn purge_dead_letters(
    queues: &QueueSet,
    kind: Option<QueueKind>,
) -> Result<usize, QueueError> {
    let mut purged = 0;
    for (k, queue) in queues.iter() {
        if kind.map_or(true, |wanted| wanted == k) {
            purged += queue.purge_dead_letters().await?;
        }
    }
    info!(purged, "Purged dead letter entries");
    Ok(purged)
}
