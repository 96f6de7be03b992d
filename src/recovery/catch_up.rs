//! Startup re-scan of every match near kickoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::scheduler::timing::to_chrono;
use crate::scheduler::{Scheduler, Trigger};
use crate::storage::{FixtureStore, StoreError};

/// Kickoff range covered by catch-up, relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpWindow {
    /// How far before now kickoffs are still considered.
    pub lookback: Duration,
    /// How far after now kickoffs are considered.
    pub lookahead: Duration,
}

impl Default for CatchUpWindow {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(2 * 3600),
            lookahead: Duration::from_secs(48 * 3600),
        }
    }
}

impl CatchUpWindow {
    /// Inclusive kickoff bounds as of `now`.
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - to_chrono(self.lookback), now + to_chrono(self.lookahead))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpReport {
    pub matches_considered: usize,
    pub jobs_created: usize,
    /// Matches whose scheduling failed; the pass continued past them.
    pub failures: usize,
}

/// Re-invokes the scheduler for every match in the window, new or not.
///
/// Recovers jobs that were never created, e.g. while the queue backend was
/// unreachable. Idempotent enqueue makes repeated runs harmless.
pub struct CatchUp {
    store: Arc<dyn FixtureStore>,
    scheduler: Scheduler,
    window: CatchUpWindow,
}

impl CatchUp {
    pub fn new(store: Arc<dyn FixtureStore>, scheduler: Scheduler, window: CatchUpWindow) -> Self {
        Self {
            store,
            scheduler,
            window,
        }
    }

    pub async fn run(&self) -> Result<CatchUpReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Runs one pass as of `now`.
    ///
    /// # Errors
    ///
    /// Only the window query can fail the pass; per-match scheduling errors
    /// are logged and counted in `failures`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CatchUpReport, StoreError> {
        let (from, to) = self.window.bounds(now);
        let matches = self.store.matches_in_window(from, to).await?;

        let mut report = CatchUpReport {
            matches_considered: matches.len(),
            ..Default::default()
        };

        for m in &matches {
            match self.scheduler.schedule_jobs_at(m, now, Trigger::CatchUp).await {
                Ok(created) => report.jobs_created += created,
                Err(e) => {
                    warn!(match_id = m.id, error = %e, "Catch-up failed for match");
                    report.jobs_created += e.jobs_created();
                    report.failures += 1;
                }
            }
        }

        info!(
            from = %from,
            to = %to,
            matches = report.matches_considered,
            created = report.jobs_created,
            failures = report.failures,
            "Catch-up complete"
        );

        Ok(report)
    }
}
