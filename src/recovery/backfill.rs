//! Periodic gap detection across the pre-match stages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::model::Stage;
use crate::queue::EnqueueOutcome;
use crate::scheduler::timing::to_chrono;
use crate::scheduler::{Scheduler, Trigger};
use crate::storage::{FixtureStore, StoreError};

/// Per-stage kickoff windows scanned by backfill.
///
/// Every window starts at `now - lookback` and ends at `now + <stage window>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillWindows {
    pub lookback: Duration,
    pub analysis: Duration,
    pub lineups: Duration,
    pub predictions: Duration,
}

impl Default for BackfillWindows {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(2 * 3600),
            analysis: Duration::from_secs(48 * 3600),
            lineups: Duration::from_secs(12 * 3600),
            predictions: Duration::from_secs(12 * 3600),
        }
    }
}

impl BackfillWindows {
    /// Lookahead for `stage`, `None` for stages backfill does not cover.
    pub fn for_stage(&self, stage: Stage) -> Option<Duration> {
        match stage {
            Stage::Analysis => Some(self.analysis),
            Stage::Lineups => Some(self.lineups),
            Stage::Predictions => Some(self.predictions),
            Stage::LiveMonitor | Stage::Settlement => None,
        }
    }
}

/// Result of scanning one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageGapReport {
    pub stage: Stage,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Matches missing this stage's output with the prerequisite in place.
    pub candidates: usize,
    pub created: usize,
    /// Candidates whose job was already waiting, delayed or active.
    pub in_flight: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub stages: Vec<StageGapReport>,
}

impl BackfillReport {
    pub fn jobs_created(&self) -> usize {
        self.stages.iter().map(|s| s.created).sum()
    }

    pub fn failures(&self) -> usize {
        self.stages.iter().map(|s| s.failures).sum()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageGapReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Enqueues jobs for stage outputs that are missing and not in flight.
///
/// A later stage is only a candidate once its prerequisite produced output,
/// so one pass never creates Predictions before Lineups exists.
pub struct Backfill {
    store: Arc<dyn FixtureStore>,
    scheduler: Scheduler,
    windows: BackfillWindows,
}

impl Backfill {
    pub fn new(store: Arc<dyn FixtureStore>, scheduler: Scheduler, windows: BackfillWindows) -> Self {
        Self {
            store,
            scheduler,
            windows,
        }
    }

    pub async fn run(&self) -> Result<BackfillReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Scans every pre-match stage as of `now`.
    ///
    /// # Errors
    ///
    /// Fails only when every gap query failed. A single stage's query error
    /// is counted as one failure of that stage and the scan moves on; enqueue
    /// failures are isolated per match and counted.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<BackfillReport, StoreError> {
        let mut report = BackfillReport::default();
        let mut scanned = 0;
        let mut last_error = None;

        for stage in Stage::PRE_MATCH {
            let Some(lookahead) = self.windows.for_stage(stage) else {
                continue;
            };
            let window_start = now - to_chrono(self.windows.lookback);
            let window_end = now + to_chrono(lookahead);

            let mut stage_report = StageGapReport {
                stage,
                window_start,
                window_end,
                candidates: 0,
                created: 0,
                in_flight: 0,
                failures: 0,
            };

            let candidates = match self
                .store
                .matches_missing_stage(stage, window_start, window_end)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(stage = %stage, error = %e, "Backfill gap query failed");
                    stage_report.failures = 1;
                    report.stages.push(stage_report);
                    last_error = Some(e);
                    continue;
                }
            };
            scanned += 1;
            stage_report.candidates = candidates.len();

            for m in &candidates {
                match self
                    .scheduler
                    .enqueue_stage(m, stage, false, now, Trigger::Backfill)
                    .await
                {
                    Ok(EnqueueOutcome::Skipped(state)) => {
                        debug!(match_id = m.id, stage = %stage, state = %state, "Gap already in flight");
                        stage_report.in_flight += 1;
                    }
                    Ok(_) => stage_report.created += 1,
                    Err(e) => {
                        warn!(match_id = m.id, stage = %stage, error = %e, "Backfill enqueue failed");
                        stage_report.failures += 1;
                    }
                }
            }

            info!(
                stage = %stage,
                window_hours = lookahead.as_secs() / 3600,
                candidates = stage_report.candidates,
                created = stage_report.created,
                in_flight = stage_report.in_flight,
                failures = stage_report.failures,
                "Backfill stage scanned"
            );
            report.stages.push(stage_report);
        }

        match last_error {
            Some(e) if scanned == 0 => Err(e),
            _ => Ok(report),
        }
    }
}
