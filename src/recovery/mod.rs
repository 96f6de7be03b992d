//! Recovery paths that close scheduling gaps.
//!
//! - **CatchUp**: startup re-scan of every match near kickoff
//! - **Backfill**: periodic scan for missing stage outputs, in dependency order
//! - **StuckDetector**: short-interval scan for matches stuck in `scheduled`
//!   or `live`, plus finished matches missing a settlement
//!
//! All three enqueue through the [`Scheduler`](crate::scheduler::Scheduler)
//! and share its job identities, so overlapping runs never duplicate work.

pub mod backfill;
pub mod catch_up;
pub mod stuck;
pub mod sweep;

pub use backfill::{Backfill, BackfillReport, BackfillWindows, StageGapReport};
pub use catch_up::{CatchUp, CatchUpReport, CatchUpWindow};
pub use stuck::{StuckDetector, StuckReport, StuckThresholds};
pub use sweep::{enqueue_sweep, RecoveryHandler};
