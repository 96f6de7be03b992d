//! Job execution.
//!
//! One [`WorkerPool`] per queue claims jobs and runs a [`JobHandler`] for
//! each. Stage queues run the webhook handler behind a [`MatchGuard`]; the
//! backfill queue runs the recovery sweeps.
//!
//! ```text
//! claim ──► rate limit ──► handler (timeout) ──► complete
//!                                  │
//!                                  ├─ transient, attempts left ──► delayed (backoff)
//!                                  ├─ otherwise ──────────────────► failed + dead letter
//!                                  └─ timed out ──────────────────► left active, stalled check
//! ```

pub mod handler;
pub mod pool;
pub mod rate_limit;
pub mod webhook;

pub use handler::{HandlerOutcome, JobHandler, MatchGuard};
pub use pool::{JobOutcome, JobRunner, PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
pub use rate_limit::JobRateLimiter;
pub use webhook::WebhookHandler;
