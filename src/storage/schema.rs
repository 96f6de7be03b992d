//! Database schema, as an ordered list of migrations.
//!
//! `matches` holds the fixture state reported by ingestion. `stage_outputs`
//! holds one row per completed (match, stage); stage handlers write it, the
//! scheduler only reads it.

/// One schema step. Versions are applied in ascending order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    /// One or more statements separated by `;`.
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_matches",
        sql: r#"
CREATE TABLE IF NOT EXISTS matches (
    id BIGINT PRIMARY KEY,
    external_id BIGINT,
    kickoff TIMESTAMPTZ NOT NULL,
    status VARCHAR(16) NOT NULL,
    home_score INTEGER,
    away_score INTEGER,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#,
    },
    Migration {
        version: 2,
        name: "create_stage_outputs",
        sql: r#"
CREATE TABLE IF NOT EXISTS stage_outputs (
    match_id BIGINT NOT NULL REFERENCES matches(id) ON DELETE CASCADE,
    stage VARCHAR(32) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (match_id, stage)
)
"#,
    },
    Migration {
        version: 3,
        name: "recovery_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_matches_kickoff ON matches(kickoff);
CREATE INDEX IF NOT EXISTS idx_matches_status_kickoff ON matches(status, kickoff);
CREATE INDEX IF NOT EXISTS idx_stage_outputs_stage ON stage_outputs(stage)
"#,
    },
];

impl Migration {
    /// Individual statements, trimmed, empty ones dropped.
    pub fn statements(&self) -> impl Iterator<Item = &'static str> {
        self.sql.split(';').map(str::trim).filter(|s| !s.is_empty())
    }
}

pub mod tables {
    pub const MATCHES: &str = "matches";
    pub const STAGE_OUTPUTS: &str = "stage_outputs";
}
