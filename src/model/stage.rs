//! Pipeline stages and the queues that execute them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One discrete pipeline operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Analysis,
    Lineups,
    Predictions,
    LiveMonitor,
    Settlement,
}

impl Stage {
    /// Every stage in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Analysis,
        Stage::Lineups,
        Stage::Predictions,
        Stage::LiveMonitor,
        Stage::Settlement,
    ];

    /// Stages that run before kickoff, in dependency order.
    pub const PRE_MATCH: [Stage; 3] = [Stage::Analysis, Stage::Lineups, Stage::Predictions];

    /// Identifier used in job ids, queue keys and storage rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Lineups => "lineups",
            Stage::Predictions => "predictions",
            Stage::LiveMonitor => "live-monitor",
            Stage::Settlement => "settlement",
        }
    }

    /// The stage whose output must exist before this one may be enqueued
    /// by gap detection.
    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Stage::Lineups => Some(Stage::Analysis),
            Stage::Predictions => Some(Stage::Lineups),
            Stage::Settlement => Some(Stage::Predictions),
            Stage::Analysis | Stage::LiveMonitor => None,
        }
    }

    /// Whether the stage runs before kickoff.
    pub fn is_pre_match(self) -> bool {
        matches!(self, Stage::Analysis | Stage::Lineups | Stage::Predictions)
    }

    /// Whether successful runs leave a stage output record behind.
    pub fn writes_output(self) -> bool {
        !matches!(self, Stage::LiveMonitor)
    }

    /// Priority before any kickoff-proximity escalation. Lower is more urgent.
    pub fn base_priority(self) -> i32 {
        match self {
            Stage::LiveMonitor => 1,
            Stage::Settlement => 2,
            Stage::Predictions => 3,
            Stage::Lineups => 4,
            Stage::Analysis => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ParseQueueError(s.to_string()))
    }
}

/// One of the six job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    Analysis,
    Lineups,
    Predictions,
    LiveMonitor,
    Settlement,
    /// Re-evaluates state and enqueues into the stage queues.
    Backfill,
}

impl QueueKind {
    pub const ALL: [QueueKind; 6] = [
        QueueKind::Analysis,
        QueueKind::Lineups,
        QueueKind::Predictions,
        QueueKind::LiveMonitor,
        QueueKind::Settlement,
        QueueKind::Backfill,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Backfill => "backfill",
            QueueKind::Analysis => Stage::Analysis.as_str(),
            QueueKind::Lineups => Stage::Lineups.as_str(),
            QueueKind::Predictions => Stage::Predictions.as_str(),
            QueueKind::LiveMonitor => Stage::LiveMonitor.as_str(),
            QueueKind::Settlement => Stage::Settlement.as_str(),
        }
    }

    /// The stage executed by this queue, `None` for the backfill queue.
    pub fn stage(self) -> Option<Stage> {
        match self {
            QueueKind::Analysis => Some(Stage::Analysis),
            QueueKind::Lineups => Some(Stage::Lineups),
            QueueKind::Predictions => Some(Stage::Predictions),
            QueueKind::LiveMonitor => Some(Stage::LiveMonitor),
            QueueKind::Settlement => Some(Stage::Settlement),
            QueueKind::Backfill => None,
        }
    }

    /// Suffix used for environment variable names.
    pub fn env_key(self) -> &'static str {
        match self {
            QueueKind::Analysis => "ANALYSIS",
            QueueKind::Lineups => "LINEUPS",
            QueueKind::Predictions => "PREDICTIONS",
            QueueKind::LiveMonitor => "LIVE_MONITOR",
            QueueKind::Settlement => "SETTLEMENT",
            QueueKind::Backfill => "BACKFILL",
        }
    }
}

impl From<Stage> for QueueKind {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Analysis => QueueKind::Analysis,
            Stage::Lineups => QueueKind::Lineups,
            Stage::Predictions => QueueKind::Predictions,
            Stage::LiveMonitor => QueueKind::LiveMonitor,
            Stage::Settlement => QueueKind::Settlement,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a queue or stage name is not recognized.
#[derive(Debug, Error)]
#[error("unknown queue '{0}'")]
pub struct ParseQueueError(pub String);

impl FromStr for QueueKind {
    type Err = ParseQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseQueueError(s.to_string()))
    }
}
