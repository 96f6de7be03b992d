//! Versioned schema migrations tracked in `_migrations`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema::{Migration, MIGRATIONS};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration {version} ({name}) failed: {source}")]
    Statement {
        version: i32,
        name: &'static str,
        source: sqlx::Error,
    },
}

/// A row of `_migrations`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every migration whose version is not recorded yet, in order.
    /// Each one runs in its own transaction together with its record.
    ///
    /// Returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.ensure_table().await?;

        let applied: HashSet<i32> = self.applied().await?.iter().map(|m| m.version).collect();
        let pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .collect();

        for migration in &pending {
            self.apply(migration).await?;
            info!(version = migration.version, name = migration.name, "Applied migration");
        }

        Ok(pending.len())
    }

    /// Recorded migrations, oldest version first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_table().await?;
        Ok(sqlx::query_as(
            "SELECT version, name, applied_at FROM _migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn ensure_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name VARCHAR(128) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        for statement in migration.statements() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::Statement {
                    version: migration.version,
                    name: migration.name,
                    source,
                })?;
        }

        // Fails on a version recorded concurrently, rolling back the statements
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
