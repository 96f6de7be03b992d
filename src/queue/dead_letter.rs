//! Dead-letter entries and the retention policy bounding queue history.
//!
//! A job lands here when it exhausts its attempts, fails with a terminal
//! error, or stalls too often. Entries are kept for manual inspection and
//! replay; each push prunes the store by age and count. The same policy
//! bounds completed and failed job records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Job;
use crate::model::{QueueKind, Stage};

/// A retained record of a permanently failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Identifier used to address the entry for replay.
    pub entry_id: Uuid,
    /// The job as it was when it failed.
    pub job: Job,
    pub queue: QueueKind,
    pub stage: Option<Stage>,
    pub match_id: Option<i64>,
    /// Final error message.
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, error: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            queue: job.queue(),
            stage: job.payload.stage(),
            match_id: job.payload.match_id(),
            job,
            error: error.into(),
            failed_at,
        }
    }
}

/// Bounds on how much history is kept per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_count: 1000,
        }
    }
}

impl RetentionPolicy {
    /// Default bounds for completed and failed job records.
    pub fn finished_jobs() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 3600),
            max_count: 5000,
        }
    }

    /// Whether an entry that failed at `failed_at` has aged out.
    pub fn is_expired(&self, failed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - failed_at).to_std() {
            Ok(age) => age > self.max_age,
            Err(_) => false,
        }
    }

    /// Applies the policy to entries ordered newest first.
    pub fn apply(&self, entries: &mut Vec<DeadLetterEntry>, now: DateTime<Utc>) {
        entries.retain(|entry| !self.is_expired(entry.failed_at, now));
        entries.truncate(self.max_count);
    }
}
