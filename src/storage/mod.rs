//! Persistent fixture state.
//!
//! The scheduler reads matches and stage-output presence through
//! [`FixtureStore`]. Ingestion upserts matches; stage handlers write outputs.
//!
//! - **Database**: PostgreSQL implementation (sqlx)
//! - **MemoryStore**: in-process implementation for tests and dry runs
//! - **Migrations**: schema management tracked in `_migrations`
//!
//! # Usage
//!
//! ```rust,ignore
//! use fixture_pipeline::storage::{Database, FixtureStore};
//!
//! let db = Database::connect("postgres://localhost/fixtures").await?;
//! db.run_migrations().await?;
//!
//! let missing = db
//!     .matches_missing_stage(Stage::Lineups, from, to)
//!     .await?;
//! ```

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Match, Stage};

pub use database::Database;
pub use memory::MemoryStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A stored row could not be mapped to a domain value.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Cutoffs for detecting matches that should have moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckQuery {
    /// Matches kicking off before this are ignored.
    pub not_before: DateTime<Utc>,
    /// `scheduled` matches kicking off before this are stuck.
    pub scheduled_before: DateTime<Utc>,
    /// `live` matches kicking off before this are stuck.
    pub live_before: DateTime<Utc>,
}

/// Read access to fixtures and stage outputs, plus the match upsert used by
/// ingestion.
///
/// Window bounds are inclusive. Results are ordered by kickoff.
#[async_trait]
pub trait FixtureStore: Send + Sync {
    /// Inserts or updates a match.
    async fn upsert_match(&self, m: &Match) -> Result<(), StoreError>;

    async fn get_match(&self, id: i64) -> Result<Option<Match>, StoreError>;

    /// Whether `stage` has written its output record for `match_id`.
    async fn has_stage_output(&self, match_id: i64, stage: Stage) -> Result<bool, StoreError>;

    /// All matches with kickoff in `[from, to]`, any status.
    async fn matches_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError>;

    /// `scheduled` matches with an external id and kickoff in `[from, to]`
    /// that have no output for `stage` but do have an output for its
    /// prerequisite, if it has one.
    async fn matches_missing_stage(
        &self,
        stage: Stage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError>;

    /// Matches with an external id still `scheduled` or `live` past the
    /// cutoffs in `query`.
    async fn stuck_matches(&self, query: &StuckQuery) -> Result<Vec<Match>, StoreError>;

    /// `finished` matches with kickoff in `[from, to]` that have a
    /// Predictions output but no Settlement output.
    async fn unsettled_matches(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError>;
}
