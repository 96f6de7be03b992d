//! Core domain types: matches, their lifecycle, and pipeline stages.
//!
//! A [`Match`] is the anchor entity every job hangs off. A [`Stage`] is one
//! discrete pipeline operation with a fixed position relative to kickoff, and
//! a [`QueueKind`] names one of the six job queues (five stage queues plus the
//! backfill queue).

pub mod fixture;
pub mod stage;

pub use fixture::{FixtureUpdate, Match, MatchStatus, ParseStatusError};
pub use stage::{ParseQueueError, QueueKind, Stage};
