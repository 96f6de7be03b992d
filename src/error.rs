//! Errors returned by stage handlers.
//!
//! A handler error carries its own retry classification: transient failures
//! go back to the queue with backoff, terminal failures go straight to the
//! dead-letter store.
//!
//! Subsystem errors live next to their subsystem:
//! - `QueueError` in `queue`
//! - `StoreError` in `storage`
//! - `SchedulerError` in `scheduler`
//! - `PoolError` in `worker`
//! - `ConfigError` in `config`

use std::time::Duration;

use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::StoreError;

/// How a failed job is treated by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with exponential backoff until attempts run out.
    Transient,
    /// Dead-lettered immediately.
    Terminal,
}

/// Failure of a stage handler.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Rate limited by upstream{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Match {0} was cancelled or postponed")]
    MatchCancelled(i64),

    #[error("Match {0} not found")]
    MatchNotFound(i64),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl JobError {
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        JobError::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Retry classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            JobError::RateLimited { .. }
            | JobError::Timeout(_)
            | JobError::Unavailable(_)
            | JobError::Queue(_)
            | JobError::Storage(_) => ErrorClass::Transient,
            JobError::Upstream { status, .. } => {
                if *status >= 500 || *status == 429 || *status == 408 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Terminal
                }
            }
            JobError::MatchCancelled(_) | JobError::MatchNotFound(_) | JobError::Validation(_) => {
                ErrorClass::Terminal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(JobError::RateLimited { retry_after: None }.is_retryable());
        assert!(JobError::Timeout("lineups provider".into()).is_retryable());
        assert!(JobError::upstream(503, "bad gateway").is_retryable());
        assert!(JobError::upstream(429, "slow down").is_retryable());
        assert!(JobError::Unavailable("connection refused".into()).is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert_eq!(JobError::MatchCancelled(7).class(), ErrorClass::Terminal);
        assert_eq!(JobError::MatchNotFound(7).class(), ErrorClass::Terminal);
        assert_eq!(JobError::Validation("no odds".into()).class(), ErrorClass::Terminal);
        assert_eq!(JobError::upstream(404, "gone").class(), ErrorClass::Terminal);
        assert_eq!(JobError::upstream(422, "bad payload").class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_error_display() {
        let err = JobError::RateLimited {
            retry_after: Some(Duration::from_secs(6)),
        };
        assert_eq!(err.to_string(), "Rate limited by upstream (retry after 6s)");

        let err = JobError::MatchCancelled(42);
        assert!(err.to_string().contains("42"));
    }
}
