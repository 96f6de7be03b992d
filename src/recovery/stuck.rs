//! Detection of matches that should have moved on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::model::{Match, Stage};
use crate::scheduler::timing::to_chrono;
use crate::scheduler::Scheduler;
use crate::storage::{FixtureStore, StoreError, StuckQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckThresholds {
    /// How long after kickoff a match may stay `scheduled`.
    pub scheduled_grace: Duration,
    /// How long after kickoff a match may stay `live`.
    pub live_max_duration: Duration,
    /// How far back finished matches are checked for a missing settlement.
    pub settlement_window: Duration,
    /// Kickoffs older than this are abandoned.
    pub max_age: Duration,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        Self {
            scheduled_grace: Duration::from_secs(15 * 60),
            live_max_duration: Duration::from_secs(3 * 3600),
            settlement_window: Duration::from_secs(48 * 3600),
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

impl StuckThresholds {
    pub fn query(&self, now: DateTime<Utc>) -> StuckQuery {
        StuckQuery {
            not_before: now - to_chrono(self.max_age),
            scheduled_before: now - to_chrono(self.scheduled_grace),
            live_before: now - to_chrono(self.live_max_duration),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StuckReport {
    /// Matches stuck in `scheduled` or `live`.
    pub stuck: usize,
    /// Finished matches with predictions but no settlement.
    pub unsettled: usize,
    pub jobs_created: usize,
    pub failures: usize,
}

/// Forces a status re-check for stuck matches and settles finished ones.
///
/// Stuck matches get a Live-Monitor recovery job; unsettled finished matches
/// get a Settlement recovery job. Both carry `allow_retroactive`.
pub struct StuckDetector {
    store: Arc<dyn FixtureStore>,
    scheduler: Scheduler,
    thresholds: StuckThresholds,
}

impl StuckDetector {
    pub fn new(store: Arc<dyn FixtureStore>, scheduler: Scheduler, thresholds: StuckThresholds) -> Self {
        Self {
            store,
            scheduler,
            thresholds,
        }
    }

    pub async fn run(&self) -> Result<StuckReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<StuckReport, StoreError> {
        let stuck = self.store.stuck_matches(&self.thresholds.query(now)).await?;
        let unsettled = self
            .store
            .unsettled_matches(now - to_chrono(self.thresholds.settlement_window), now)
            .await?;

        let mut report = StuckReport {
            stuck: stuck.len(),
            unsettled: unsettled.len(),
            ..Default::default()
        };

        for m in &stuck {
            warn!(match_id = m.id, status = %m.status, kickoff = %m.kickoff, "Match looks stuck");
            self.recover(m, Stage::LiveMonitor, now, &mut report).await;
        }
        for m in &unsettled {
            self.recover(m, Stage::Settlement, now, &mut report).await;
        }

        if report.stuck + report.unsettled > 0 {
            info!(
                stuck = report.stuck,
                unsettled = report.unsettled,
                created = report.jobs_created,
                failures = report.failures,
                "Stuck scan complete"
            );
        }

        Ok(report)
    }

    async fn recover(&self, m: &Match, stage: Stage, now: DateTime<Utc>, report: &mut StuckReport) {
        match self.scheduler.schedule_recovery_at(m, stage, now).await {
            Ok(true) => report.jobs_created += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(match_id = m.id, stage = %stage, error = %e, "Recovery enqueue failed");
                report.failures += 1;
            }
        }
    }
}
