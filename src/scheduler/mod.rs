//! Kickoff-relative scheduling of stage jobs.
//!
//! - **Timing**: target offsets per stage, past-due handling, priority escalation
//! - **Scheduler**: idempotent enqueue of the stages a match currently needs
//!
//! Every trigger path (ingestion, catch-up, backfill, stuck recovery) goes
//! through [`Scheduler`], so they all share one identity scheme and collide
//! on `"{stage}-{match_id}"` instead of duplicating work.
//!
//! # Example
//!
//! ```rust,ignore
//! use fixture_pipeline::queue::QueueSet;
//! use fixture_pipeline::scheduler::{Scheduler, Timing};
//!
//! let scheduler = Scheduler::new(QueueSet::in_memory(), Timing::default());
//! let created = scheduler.schedule_jobs(&fixture).await?;
//! ```

pub mod planner;
pub mod timing;

pub use planner::{applicable_stages, Scheduler, SchedulerError, Trigger};
pub use timing::{PriorityPolicy, StageOffsets, Timing, MAX_URGENCY, PAST_DUE_DELAY};
