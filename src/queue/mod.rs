//! Persistent job queues, one per pipeline stage plus one for sweeps.
//!
//! - **JobQueue**: backend contract with atomic unique-enqueue and claim
//! - **RedisQueue**: Redis-backed queue using Lua scripts for the atomic paths
//! - **MemoryQueue**: in-process queue with the same semantics, for tests
//! - **Job**: deterministic identity, typed payload, attempt accounting
//!
//! # Architecture
//!
//! ```text
//!   Scheduler / Catch-Up / Backfill / Stuck detector
//!                     │ enqueue_unique
//!   ┌────────┬────────┼─────────┬──────────────┬────────────┐
//!   ▼        ▼        ▼         ▼              ▼            ▼
//! analysis lineups predictions live-monitor settlement  backfill
//!   │        │        │         │              │            │
//!   └────────┴────────┴── claim ┴──────────────┴────────────┘
//!                     ▼
//!               worker pools
//! ```
//!
//! # Job lifecycle
//!
//! `delayed` → `waiting` → `active` → `completed` | `failed` (+ dead letter).
//! A job whose lock expires while `active` goes back to `waiting` until it
//! has stalled too often.

pub mod backend;
pub mod dead_letter;
pub mod job;
pub mod memory;
pub mod redis;
pub mod retry;

pub use backend::{EnqueueOutcome, JobQueue, QueueCounts, QueueError, QueueSet, StalledRecovery};
pub use dead_letter::{DeadLetterEntry, RetentionPolicy};
pub use job::{
    Job, JobId, JobPayload, JobRecord, JobState, MatchJob, SweepJob, SweepKind,
    DEFAULT_MAX_ATTEMPTS,
};
pub use memory::MemoryQueue;
pub use self::redis::{connect_manager, RedisQueue};
pub use retry::BackoffPolicy;

impl QueueSet {
    /// Redis-backed queues sharing one connection manager, keeping finished
    /// job records within `retention`.
    pub fn redis(
        conn: ::redis::aio::ConnectionManager,
        prefix: &str,
        retention: RetentionPolicy,
    ) -> Self {
        Self::build(|kind| {
            std::sync::Arc::new(
                RedisQueue::from_connection(conn.clone(), prefix, kind).with_retention(retention),
            )
        })
    }
}
