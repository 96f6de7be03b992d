//! Command-line interface for fixture-pipeline.
//!
//! Provides the scheduler process plus one-shot recovery passes, fixture
//! ingestion, queue status and dead-letter operations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
