//! In-memory fixture store.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{FixtureStore, StoreError, StuckQuery};
use crate::model::{Match, MatchStatus, Stage};

/// Fixture store kept in process memory.
///
/// Answers the same queries as [`Database`](super::Database) with the same
/// filters, so recovery logic can be tested without PostgreSQL.
#[derive(Default)]
pub struct MemoryStore {
    matches: RwLock<BTreeMap<i64, Match>>,
    outputs: RwLock<HashSet<(i64, Stage)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store holding `matches`.
    pub fn with_matches(matches: impl IntoIterator<Item = Match>) -> Self {
        Self {
            matches: RwLock::new(matches.into_iter().map(|m| (m.id, m)).collect()),
            outputs: RwLock::default(),
        }
    }

    /// Records that `stage` produced output for `match_id`.
    pub async fn record_stage_output(&self, match_id: i64, stage: Stage) {
        self.outputs.write().await.insert((match_id, stage));
    }

    /// Changes the status of a stored match. Returns whether it existed.
    pub async fn set_status(&self, match_id: i64, status: MatchStatus) -> bool {
        match self.matches.write().await.get_mut(&match_id) {
            Some(m) => {
                m.status = status;
                true
            }
            None => false,
        }
    }

    /// Matches passing `filter`, ordered by kickoff then id.
    async fn select(&self, filter: impl Fn(&Match, &HashSet<(i64, Stage)>) -> bool) -> Vec<Match> {
        let matches = self.matches.read().await;
        let outputs = self.outputs.read().await;

        let mut selected: Vec<Match> = matches
            .values()
            .filter(|m| filter(m, &outputs))
            .cloned()
            .collect();
        selected.sort_by_key(|m| (m.kickoff, m.id));
        selected
    }
}

fn in_window(m: &Match, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    m.kickoff >= from && m.kickoff <= to
}

#[async_trait]
impl FixtureStore for MemoryStore {
    async fn upsert_match(&self, m: &Match) -> Result<(), StoreError> {
        self.matches.write().await.insert(m.id, m.clone());
        Ok(())
    }

    async fn get_match(&self, id: i64) -> Result<Option<Match>, StoreError> {
        Ok(self.matches.read().await.get(&id).cloned())
    }

    async fn has_stage_output(&self, match_id: i64, stage: Stage) -> Result<bool, StoreError> {
        Ok(self.outputs.read().await.contains(&(match_id, stage)))
    }

    async fn matches_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError> {
        Ok(self.select(|m, _| in_window(m, from, to)).await)
    }

    async fn matches_missing_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError> {
        let prerequisite = stage.prerequisite();
        Ok(self
            .select(|m, outputs| {
                m.status == MatchStatus::Scheduled
                    && m.external_id.is_some()
                    && in_window(m, from, to)
                    && !outputs.contains(&(m.id, stage))
                    && prerequisite.map_or(true, |p| outputs.contains(&(m.id, p)))
            })
            .await)
    }

    async fn stuck_matches(&self, query: &StuckQuery) -> Result<Vec<Match>, StoreError> {
        Ok(self
            .select(|m, _| {
                m.external_id.is_some()
                    && m.kickoff >= query.not_before
                    && match m.status {
                        MatchStatus::Scheduled => m.kickoff < query.scheduled_before,
                        MatchStatus::Live => m.kickoff < query.live_before,
                        _ => false,
                    }
            })
            .await)
    }

    async fn unsettled_matches(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError> {
        Ok(self
            .select(|m, outputs| {
                m.status == MatchStatus::Finished
                    && m.external_id.is_some()
                    && in_window(m, from, to)
                    && outputs.contains(&(m.id, Stage::Predictions))
                    && !outputs.contains(&(m.id, Stage::Settlement))
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 22, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_replaces_match() {
        let store = MemoryStore::new();
        let m = Match::new(1, Some(10), now());
        store.upsert_match(&m).await.unwrap();
        store
            .upsert_match(&m.clone().with_status(MatchStatus::Live))
            .await
            .unwrap();

        let stored = store.get_match(1).await.unwrap().unwrap();
        assert_eq!(stored.status, MatchStatus::Live);
        assert!(store.get_match(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_window_is_inclusive_and_ordered() {
        let store = MemoryStore::with_matches([
            Match::new(3, Some(30), now() + Duration::hours(2)),
            Match::new(1, Some(10), now()),
            Match::new(2, None, now() + Duration::hours(1)),
            Match::new(4, Some(40), now() + Duration::hours(3)),
        ]);

        let found = store
            .matches_in_window(now(), now() + Duration::hours(2))
            .await
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_stage_respects_prerequisite() {
        let store = MemoryStore::with_matches([
            Match::new(1, Some(10), now() + Duration::hours(5)),
            Match::new(2, Some(20), now() + Duration::hours(5)),
        ]);
        store.record_stage_output(1, Stage::Analysis).await;

        let from = now();
        let to = now() + Duration::hours(12);

        let analysis = store.matches_missing_stage(Stage::Analysis, from, to).await.unwrap();
        assert_eq!(analysis.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2]);

        let lineups = store.matches_missing_stage(Stage::Lineups, from, to).await.unwrap();
        assert_eq!(lineups.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1]);

        let predictions = store.matches_missing_stage(Stage::Predictions, from, to).await.unwrap();
        assert!(predictions.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_and_unsettled_queries() {
        let store = MemoryStore::with_matches([
            Match::new(1, Some(10), now() - Duration::minutes(20)),
            Match::new(2, Some(20), now() - Duration::hours(4)).with_status(MatchStatus::Live),
            Match::new(3, Some(30), now() - Duration::hours(1)).with_status(MatchStatus::Live),
            Match::new(4, Some(40), now() - Duration::hours(5))
                .with_status(MatchStatus::Finished)
                .with_score(2, 1),
        ]);
        store.record_stage_output(4, Stage::Predictions).await;

        let stuck = store
            .stuck_matches(&StuckQuery {
                not_before: now() - Duration::hours(24),
                scheduled_before: now() - Duration::minutes(15),
                live_before: now() - Duration::hours(3),
            })
            .await
            .unwrap();
        let mut ids: Vec<i64> = stuck.iter().map(|m| m.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        let unsettled = store
            .unsettled_matches(now() - Duration::hours(48), now())
            .await
            .unwrap();
        assert_eq!(unsettled.len(), 1);
        assert_eq!(unsettled[0].id, 4);

        store.record_stage_output(4, Stage::Settlement).await;
        assert!(store
            .unsettled_matches(now() - Duration::hours(48), now())
            .await
            .unwrap()
            .is_empty());
    }
}
