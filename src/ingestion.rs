//! Fixture ingestion.
//!
//! Each poll of the fixture provider yields a list of updates. Every entry is
//! stored and handed to the scheduler, not only new matches: a match that was
//! ingested while the queue backend was down gets its jobs on the next poll.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::FixtureUpdate;
use crate::scheduler::{Scheduler, Trigger};
use crate::storage::FixtureStore;

/// Errors reading a fixture batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to read fixture file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid fixture batch: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub upserted: usize,
    pub jobs_created: usize,
    /// Entries whose upsert or scheduling failed.
    pub failures: usize,
}

/// Parses a JSON array of fixture updates.
pub fn parse_batch(json: &str) -> Result<Vec<FixtureUpdate>, IngestError> {
    Ok(serde_json::from_str(json)?)
}

/// Reads a JSON array of fixture updates from `path`.
pub async fn read_batch(path: impl AsRef<Path>) -> Result<Vec<FixtureUpdate>, IngestError> {
    let json = tokio::fs::read_to_string(path).await?;
    parse_batch(&json)
}

/// Stores fixture updates and schedules their jobs.
pub struct FixtureIngestor {
    store: Arc<dyn FixtureStore>,
    scheduler: Scheduler,
}

impl FixtureIngestor {
    pub fn new(store: Arc<dyn FixtureStore>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }

    pub async fn ingest(&self, updates: Vec<FixtureUpdate>) -> IngestReport {
        self.ingest_at(updates, Utc::now()).await
    }

    /// Upserts and schedules each update. Failures are isolated per entry.
    pub async fn ingest_at(&self, updates: Vec<FixtureUpdate>, now: DateTime<Utc>) -> IngestReport {
        let mut report = IngestReport {
            received: updates.len(),
            ..Default::default()
        };

        for update in updates {
            let m = update.into_match();

            if let Err(e) = self.store.upsert_match(&m).await {
                warn!(match_id = m.id, error = %e, "Failed to store fixture");
                report.failures += 1;
                continue;
            }
            report.upserted += 1;

            match self.scheduler.schedule_jobs_at(&m, now, Trigger::Ingestion).await {
                Ok(created) => report.jobs_created += created,
                Err(e) => {
                    warn!(match_id = m.id, error = %e, "Failed to schedule fixture");
                    report.jobs_created += e.jobs_created();
                    report.failures += 1;
                }
            }
        }

        info!(
            received = report.received,
            upserted = report.upserted,
            created = report.jobs_created,
            failures = report.failures,
            "Ingested fixture batch"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchStatus;
    use crate::queue::QueueSet;
    use crate::scheduler::Timing;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn update(match_id: i64, status: MatchStatus, hours_to_kickoff: i64) -> FixtureUpdate {
        FixtureUpdate {
            match_id,
            external_id: Some(match_id * 10),
            kickoff: Utc::now() + Duration::hours(hours_to_kickoff),
            status,
            home_score: None,
            away_score: None,
        }
    }

    #[test]
    fn test_parse_batch() {
        let batch = parse_batch(
            r#"[
                {"match_id": 1, "external_id": 10, "kickoff": "2026-11-01T15:00:00Z", "status": "scheduled"},
                {"match_id": 2, "kickoff": "2026-11-01T17:30:00Z", "status": "finished", "home_score": 2, "away_score": 0}
            ]"#,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].external_id, Some(10));
        assert_eq!(batch[1].external_id, None);
        assert_eq!(batch[1].home_score, Some(2));
        assert!(parse_batch(r#"[{"match_id": 1}]"#).is_err());
    }

    #[tokio::test]
    async fn test_every_entry_is_stored_and_scheduled() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = FixtureIngestor::new(
            store.clone(),
            Scheduler::new(QueueSet::in_memory(), Timing::default()),
        );

        let report = ingestor
            .ingest(vec![
                update(1, MatchStatus::Scheduled, 20),
                update(2, MatchStatus::Live, 0),
                update(3, MatchStatus::Finished, -3),
            ])
            .await;

        assert_eq!(report.received, 3);
        assert_eq!(report.upserted, 3);
        assert_eq!(report.jobs_created, 4);
        assert_eq!(report.failures, 0);
        assert_eq!(
            store.get_match(2).await.unwrap().unwrap().status,
            MatchStatus::Live
        );

        // Re-polling the same fixtures creates nothing new
        let again = ingestor.ingest(vec![update(1, MatchStatus::Scheduled, 20)]).await;
        assert_eq!(again.jobs_created, 0);
        assert_eq!(again.upserted, 1);
    }
}
