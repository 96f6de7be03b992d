//! fixture-pipeline: kickoff-relative job scheduling with backfill and
//! recovery for sporting fixtures.
//!
//! Every match gets a fixed set of stage jobs (analysis, lineups, predictions,
//! live monitor, settlement) timed relative to its kickoff. Three overlapping
//! detection paths (startup catch-up, periodic backfill, stuck-match
//! recovery) close gaps, and deterministic job identities keep them from
//! duplicating work.

pub mod cli;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod worker;

// Re-export commonly used types
pub use config::{ConfigError, PipelineConfig};
pub use error::{ErrorClass, JobError};
pub use model::{Match, MatchStatus, QueueKind, Stage};
pub use runtime::{PipelineRuntime, RuntimeError};
pub use scheduler::{Scheduler, SchedulerError};
