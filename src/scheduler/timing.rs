//! Run-at and priority computation relative to kickoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Stage;

/// Delay given to jobs whose target time has already passed.
pub const PAST_DUE_DELAY: Duration = Duration::from_secs(1);

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::max_value())
}

/// Target offset of each stage relative to kickoff.
///
/// Pre-match stages run before kickoff, Settlement after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOffsets {
    pub analysis_before: Duration,
    pub lineups_before: Duration,
    pub predictions_before: Duration,
    pub settlement_after: Duration,
}

impl Default for StageOffsets {
    fn default() -> Self {
        Self {
            analysis_before: Duration::from_secs(6 * 3600),
            lineups_before: Duration::from_secs(60 * 60),
            predictions_before: Duration::from_secs(30 * 60),
            settlement_after: Duration::from_secs(2 * 3600),
        }
    }
}

impl StageOffsets {
    /// Ideal execution time of `stage` for a match kicking off at `kickoff`.
    pub fn target_time(&self, stage: Stage, kickoff: DateTime<Utc>) -> DateTime<Utc> {
        match stage {
            Stage::Analysis => kickoff - to_chrono(self.analysis_before),
            Stage::Lineups => kickoff - to_chrono(self.lineups_before),
            Stage::Predictions => kickoff - to_chrono(self.predictions_before),
            Stage::LiveMonitor => kickoff,
            Stage::Settlement => kickoff + to_chrono(self.settlement_after),
        }
    }
}

/// Escalation of priority as kickoff approaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    /// How close to kickoff a job counts as urgent.
    pub boost_window: Duration,
    /// Subtracted from the base priority inside the boost window.
    pub boost: i32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            boost_window: Duration::from_secs(30 * 60),
            boost: 2,
        }
    }
}

/// Highest urgency a job can have.
pub const MAX_URGENCY: i32 = 1;

/// Delay and priority calculator shared by every trigger path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub offsets: StageOffsets,
    pub priority: PriorityPolicy,
}

impl Timing {
    pub fn new(offsets: StageOffsets, priority: PriorityPolicy) -> Self {
        Self { offsets, priority }
    }

    /// Time until `stage` should run.
    ///
    /// Never zero: a stage whose target time has passed still gets
    /// [`PAST_DUE_DELAY`] instead of being dropped.
    pub fn compute_delay(&self, stage: Stage, kickoff: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let target = self.offsets.target_time(stage, kickoff);
        match (target - now).to_std() {
            Ok(delay) if delay > Duration::ZERO => delay,
            _ => PAST_DUE_DELAY,
        }
    }

    /// Priority for `stage` given how close kickoff is. Lower is more urgent.
    pub fn compute_dynamic_priority(
        &self,
        base: i32,
        kickoff: DateTime<Utc>,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> i32 {
        if stage == Stage::LiveMonitor {
            return base;
        }
        if now >= kickoff {
            return MAX_URGENCY;
        }
        if kickoff - now <= to_chrono(self.priority.boost_window) {
            return (base - self.priority.boost).max(MAX_URGENCY);
        }
        base
    }

    /// Absolute run-at time for `stage`.
    pub fn run_at(&self, stage: Stage, kickoff: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.compute_delay(stage, kickoff, now))
    }
}
