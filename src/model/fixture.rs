//! Match entity and fixture updates reported by ingestion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Not started yet.
    Scheduled,
    /// In progress.
    Live,
    /// Played to completion; scores are available.
    Finished,
    /// Called off for good.
    Cancelled,
    /// Moved to an unknown later date.
    Postponed,
}

impl MatchStatus {
    /// Terminal statuses never receive new stage jobs.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Finished | MatchStatus::Cancelled | MatchStatus::Postponed
        )
    }

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::Finished => "finished",
            MatchStatus::Cancelled => "cancelled",
            MatchStatus::Postponed => "postponed",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not recognized.
#[derive(Debug, Error)]
#[error("unknown match status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for MatchStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(MatchStatus::Scheduled),
            "live" => Ok(MatchStatus::Live),
            "finished" => Ok(MatchStatus::Finished),
            "cancelled" => Ok(MatchStatus::Cancelled),
            "postponed" => Ok(MatchStatus::Postponed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A tracked match.
///
/// Mutated only by fixture ingestion and by the live-monitor stage handler;
/// the scheduler reads it but never writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Internal identifier.
    pub id: i64,
    /// Identifier at the external data provider. Matches without one are
    /// never scheduled.
    pub external_id: Option<i64>,
    /// Anchor timestamp for every stage offset.
    pub kickoff: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: MatchStatus,
    /// Final home score, present once finished.
    #[serde(default)]
    pub home_score: Option<i32>,
    /// Final away score, present once finished.
    #[serde(default)]
    pub away_score: Option<i32>,
}

impl Match {
    /// Creates a scheduled match with no scores.
    pub fn new(id: i64, external_id: Option<i64>, kickoff: DateTime<Utc>) -> Self {
        Self {
            id,
            external_id,
            kickoff,
            status: MatchStatus::Scheduled,
            home_score: None,
            away_score: None,
        }
    }

    /// Sets the lifecycle status.
    pub fn with_status(mut self, status: MatchStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the final score.
    pub fn with_score(mut self, home: i32, away: i32) -> Self {
        self.home_score = Some(home);
        self.away_score = Some(away);
        self
    }

    /// Whether the match may receive jobs at all.
    pub fn is_schedulable(&self) -> bool {
        self.external_id.is_some() && !self.status.is_terminal()
    }
}

/// One entry of a fixture ingestion poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureUpdate {
    pub match_id: i64,
    #[serde(default)]
    pub external_id: Option<i64>,
    pub kickoff: DateTime<Utc>,
    pub status: MatchStatus,
    #[serde(default)]
    pub home_score: Option<i32>,
    #[serde(default)]
    pub away_score: Option<i32>,
}

impl FixtureUpdate {
    /// Converts the update into the match row it describes.
    ///
    /// Scores are dropped unless the match is finished.
    pub fn into_match(self) -> Match {
        let finished = self.status == MatchStatus::Finished;
        Match {
            id: self.match_id,
            external_id: self.external_id,
            kickoff: self.kickoff,
            status: self.status,
            home_score: if finished { self.home_score } else { None },
            away_score: if finished { self.away_score } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!MatchStatus::Scheduled.is_terminal());
        assert!(!MatchStatus::Live.is_terminal());
        assert!(MatchStatus::Finished.is_terminal());
        assert!(MatchStatus::Cancelled.is_terminal());
        assert!(MatchStatus::Postponed.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "postponed".parse::<MatchStatus>().expect("valid status"),
            MatchStatus::Postponed
        );
        assert!("halftime".parse::<MatchStatus>().is_err());
    }

    #[test]
    fn test_match_without_external_id_is_not_schedulable() {
        let m = Match::new(1, None, Utc::now());
        assert!(!m.is_schedulable());

        let m = Match::new(1, Some(77), Utc::now());
        assert!(m.is_schedulable());

        let m = m.with_status(MatchStatus::Cancelled);
        assert!(!m.is_schedulable());
    }

    #[test]
    fn test_update_drops_scores_before_finish() {
        let update = FixtureUpdate {
            match_id: 5,
            external_id: Some(500),
            kickoff: Utc::now(),
            status: MatchStatus::Live,
            home_score: Some(1),
            away_score: Some(0),
        };
        let m = update.into_match();
        assert_eq!(m.status, MatchStatus::Live);
        assert!(m.home_score.is_none());
        assert!(m.away_score.is_none());
    }

    #[test]
    fn test_update_deserializes_from_poll_json() {
        let json = r#"{"match_id": 9, "external_id": 1209, "kickoff": "2026-05-01T18:00:00Z", "status": "scheduled"}"#;
        let update: FixtureUpdate = serde_json::from_str(json).expect("valid fixture json");
        assert_eq!(update.match_id, 9);
        assert_eq!(update.external_id, Some(1209));
        assert_eq!(update.status, MatchStatus::Scheduled);
        assert!(update.home_score.is_none());
    }
}
