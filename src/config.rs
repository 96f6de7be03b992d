//! Pipeline configuration.
//!
//! Stage offsets, recovery windows, retry policy, per-queue concurrency and
//! rate limits, dead-letter and finished-job retention and connection URLs. Everything has a
//! default; `from_env` overrides from `PIPELINE_*` variables plus
//! `REDIS_URL` and `DATABASE_URL`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::QueueKind;
use crate::queue::{BackoffPolicy, RetentionPolicy};
use crate::recovery::{BackfillWindows, CatchUpWindow, StuckThresholds};
use crate::scheduler::{PriorityPolicy, StageOffsets, Timing};
use crate::worker::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Request budget of a queue: at most `max` jobs started per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn new(max: u32, per: Duration) -> Self {
        Self { max, per }
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max, self.per.as_secs())
    }
}

impl FromStr for RateLimit {
    type Err = String;

    /// Parses `"{max}/{seconds}"`, e.g. `"10/60"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (max, per) = s
            .split_once('/')
            .ok_or_else(|| format!("expected '<max>/<seconds>', got '{}'", s))?;
        let max: u32 = max
            .trim()
            .parse()
            .map_err(|_| format!("invalid request count '{}'", max))?;
        let per: u64 = per
            .trim()
            .parse()
            .map_err(|_| format!("invalid interval '{}'", per))?;
        Ok(Self::new(max, Duration::from_secs(per)))
    }
}

/// Worker settings of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Optional limit on how fast jobs are started.
    pub rate_limit: Option<RateLimit>,
}

impl QueueSettings {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Defaults per queue. The lineups provider allows one request every
    /// six seconds, the analysis provider ten per minute.
    pub fn default_for(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Analysis => {
                Self::new(2).with_rate_limit(RateLimit::new(10, Duration::from_secs(60)))
            }
            QueueKind::Lineups => {
                Self::new(1).with_rate_limit(RateLimit::new(1, Duration::from_secs(6)))
            }
            QueueKind::Predictions => Self::new(2),
            QueueKind::LiveMonitor => Self::new(4),
            QueueKind::Settlement => Self::new(2),
            QueueKind::Backfill => Self::new(1),
        }
    }
}

/// Configuration for the whole pipeline process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Connections
    /// Redis URL of the queue backend.
    pub redis_url: String,
    /// PostgreSQL URL of the fixture store.
    pub database_url: String,
    /// Key prefix shared by all queues.
    pub queue_prefix: String,
    /// Base URL of the stage handler endpoints.
    pub webhook_url: Option<String>,
    /// Request timeout of the webhook handler.
    pub webhook_timeout: Duration,

    // Scheduling
    pub offsets: StageOffsets,
    pub priority: PriorityPolicy,

    // Recovery
    pub catch_up: CatchUpWindow,
    pub backfill: BackfillWindows,
    pub stuck: StuckThresholds,
    /// How often the gap scan runs.
    pub backfill_interval: Duration,
    /// How often the stuck scan runs.
    pub stuck_interval: Duration,

    // Workers
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
    /// Bounds on completed and failed job records kept per queue.
    pub job_retention: RetentionPolicy,
    pub queues: BTreeMap<QueueKind, QueueSettings>,
    /// Maximum time a handler may run.
    pub job_timeout: Duration,
    /// How long a claimed job stays locked. Must not be shorter than `job_timeout`.
    pub lock_duration: Duration,
    /// How many times a job may stall before it fails.
    pub max_stalled: u32,
    pub stalled_check_interval: Duration,
    /// Sleep between claims when a queue is empty.
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "postgres://localhost/fixtures".to_string(),
            queue_prefix: "fixtures".to_string(),
            webhook_url: None,
            webhook_timeout: Duration::from_secs(30),

            offsets: StageOffsets::default(),
            priority: PriorityPolicy::default(),

            catch_up: CatchUpWindow::default(),
            backfill: BackfillWindows::default(),
            stuck: StuckThresholds::default(),
            backfill_interval: Duration::from_secs(3600),
            stuck_interval: Duration::from_secs(120),

            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
            job_retention: RetentionPolicy::finished_jobs(),
            queues: QueueKind::ALL
                .into_iter()
                .map(|kind| (kind, QueueSettings::default_for(kind)))
                .collect(),
            job_timeout: Duration::from_secs(300),
            lock_duration: Duration::from_secs(600),
            max_stalled: 1,
            stalled_check_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`, `DATABASE_URL`: connection URLs
    /// - `PIPELINE_QUEUE_PREFIX`: Redis key prefix (default: fixtures)
    /// - `PIPELINE_WEBHOOK_URL`, `PIPELINE_WEBHOOK_TIMEOUT_SECS`: stage handler endpoint
    /// - `PIPELINE_{ANALYSIS,LINEUPS,PREDICTIONS}_OFFSET_MINS`: minutes before kickoff
    /// - `PIPELINE_SETTLEMENT_DELAY_MINS`: minutes after kickoff
    /// - `PIPELINE_PRIORITY_BOOST_WINDOW_MINS`, `PIPELINE_PRIORITY_BOOST`
    /// - `PIPELINE_LOOKBACK_MINS`: how far back catch-up and backfill look
    /// - `PIPELINE_CATCH_UP_WINDOW_HOURS`
    /// - `PIPELINE_BACKFILL_{ANALYSIS,LINEUPS,PREDICTIONS}_WINDOW_HOURS`
    /// - `PIPELINE_BACKFILL_INTERVAL_SECS`, `PIPELINE_STUCK_INTERVAL_SECS`
    /// - `PIPELINE_SCHEDULED_GRACE_MINS`, `PIPELINE_LIVE_MAX_DURATION_MINS`,
    ///   `PIPELINE_SETTLEMENT_WINDOW_HOURS`
    /// - `PIPELINE_MAX_ATTEMPTS`, `PIPELINE_BACKOFF_BASE_SECS`, `PIPELINE_BACKOFF_MAX_SECS`
    /// - `PIPELINE_{QUEUE}_CONCURRENCY`, `PIPELINE_{QUEUE}_RATE_LIMIT` (`10/60` or `none`)
    /// - `PIPELINE_DLQ_MAX_AGE_HOURS`, `PIPELINE_DLQ_MAX_COUNT`
    /// - `PIPELINE_JOB_RETENTION_HOURS`, `PIPELINE_JOB_RETENTION_COUNT`: finished job records
    /// - `PIPELINE_JOB_TIMEOUT_SECS`, `PIPELINE_LOCK_DURATION_SECS`, `PIPELINE_MAX_STALLED`,
    ///   `PIPELINE_STALLED_CHECK_SECS`, `PIPELINE_POLL_INTERVAL_MS`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        // Connections
        if let Some(val) = env.get("REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = env.get("DATABASE_URL") {
            config.database_url = val;
        }
        if let Some(val) = env.get("PIPELINE_QUEUE_PREFIX") {
            config.queue_prefix = val;
        }
        if let Some(val) = env.get("PIPELINE_WEBHOOK_URL") {
            config.webhook_url = Some(val);
        }
        env.secs("PIPELINE_WEBHOOK_TIMEOUT_SECS", &mut config.webhook_timeout)?;

        // Scheduling
        env.mins("PIPELINE_ANALYSIS_OFFSET_MINS", &mut config.offsets.analysis_before)?;
        env.mins("PIPELINE_LINEUPS_OFFSET_MINS", &mut config.offsets.lineups_before)?;
        env.mins("PIPELINE_PREDICTIONS_OFFSET_MINS", &mut config.offsets.predictions_before)?;
        env.mins("PIPELINE_SETTLEMENT_DELAY_MINS", &mut config.offsets.settlement_after)?;
        env.mins("PIPELINE_PRIORITY_BOOST_WINDOW_MINS", &mut config.priority.boost_window)?;
        if let Some(val) = env.get("PIPELINE_PRIORITY_BOOST") {
            config.priority.boost = parse_env_value(&val, "PIPELINE_PRIORITY_BOOST")?;
        }

        // Recovery
        if let Some(val) = env.get("PIPELINE_LOOKBACK_MINS") {
            let mins: u64 = parse_env_value(&val, "PIPELINE_LOOKBACK_MINS")?;
            config.catch_up.lookback = Duration::from_secs(mins * 60);
            config.backfill.lookback = Duration::from_secs(mins * 60);
        }
        env.hours("PIPELINE_CATCH_UP_WINDOW_HOURS", &mut config.catch_up.lookahead)?;
        env.hours("PIPELINE_BACKFILL_ANALYSIS_WINDOW_HOURS", &mut config.backfill.analysis)?;
        env.hours("PIPELINE_BACKFILL_LINEUPS_WINDOW_HOURS", &mut config.backfill.lineups)?;
        env.hours("PIPELINE_BACKFILL_PREDICTIONS_WINDOW_HOURS", &mut config.backfill.predictions)?;
        env.secs("PIPELINE_BACKFILL_INTERVAL_SECS", &mut config.backfill_interval)?;
        env.secs("PIPELINE_STUCK_INTERVAL_SECS", &mut config.stuck_interval)?;
        env.mins("PIPELINE_SCHEDULED_GRACE_MINS", &mut config.stuck.scheduled_grace)?;
        env.mins("PIPELINE_LIVE_MAX_DURATION_MINS", &mut config.stuck.live_max_duration)?;
        env.hours("PIPELINE_SETTLEMENT_WINDOW_HOURS", &mut config.stuck.settlement_window)?;

        // Retry and retention
        if let Some(val) = env.get("PIPELINE_MAX_ATTEMPTS") {
            config.backoff.max_attempts = parse_env_value(&val, "PIPELINE_MAX_ATTEMPTS")?;
        }
        env.secs("PIPELINE_BACKOFF_BASE_SECS", &mut config.backoff.base_delay)?;
        env.secs("PIPELINE_BACKOFF_MAX_SECS", &mut config.backoff.max_delay)?;
        env.hours("PIPELINE_DLQ_MAX_AGE_HOURS", &mut config.retention.max_age)?;
        if let Some(val) = env.get("PIPELINE_DLQ_MAX_COUNT") {
            config.retention.max_count = parse_env_value(&val, "PIPELINE_DLQ_MAX_COUNT")?;
        }
        env.hours("PIPELINE_JOB_RETENTION_HOURS", &mut config.job_retention.max_age)?;
        if let Some(val) = env.get("PIPELINE_JOB_RETENTION_COUNT") {
            config.job_retention.max_count =
                parse_env_value(&val, "PIPELINE_JOB_RETENTION_COUNT")?;
        }

        // Per-queue workers
        for kind in QueueKind::ALL {
            let settings = config
                .queues
                .entry(kind)
                .or_insert_with(|| QueueSettings::default_for(kind));

            let key = format!("PIPELINE_{}_CONCURRENCY", kind.env_key());
            if let Some(val) = env.get(&key) {
                settings.concurrency = parse_env_value(&val, &key)?;
            }

            let key = format!("PIPELINE_{}_RATE_LIMIT", kind.env_key());
            if let Some(val) = env.get(&key) {
                settings.rate_limit = parse_rate_limit(&val, &key)?;
            }
        }

        env.secs("PIPELINE_JOB_TIMEOUT_SECS", &mut config.job_timeout)?;
        env.secs("PIPELINE_LOCK_DURATION_SECS", &mut config.lock_duration)?;
        if let Some(val) = env.get("PIPELINE_MAX_STALLED") {
            config.max_stalled = parse_env_value(&val, "PIPELINE_MAX_STALLED")?;
        }
        env.secs("PIPELINE_STALLED_CHECK_SECS", &mut config.stalled_check_interval)?;
        if let Some(val) = env.get("PIPELINE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "PIPELINE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.queue_prefix.is_empty() || self.queue_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::ValidationFailed(
                "queue_prefix must be a non-empty word".to_string(),
            ));
        }

        // Stage order relative to kickoff
        let offsets = &self.offsets;
        if !(offsets.analysis_before >= offsets.lineups_before
            && offsets.lineups_before >= offsets.predictions_before)
        {
            return Err(ConfigError::ValidationFailed(
                "stage offsets must satisfy analysis >= lineups >= predictions".to_string(),
            ));
        }

        if self.priority.boost < 0 {
            return Err(ConfigError::ValidationFailed(
                "priority boost cannot be negative".to_string(),
            ));
        }

        if self.catch_up.lookahead.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "catch-up lookahead must be greater than 0".to_string(),
            ));
        }

        if self.backfill_interval.is_zero() || self.stuck_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sweep intervals must be greater than 0".to_string(),
            ));
        }

        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(ConfigError::ValidationFailed(
                "backoff base delay cannot exceed max delay".to_string(),
            ));
        }

        if self.retention.max_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "dead-letter max_count must be greater than 0".to_string(),
            ));
        }

        if self.job_retention.max_count == 0 || self.job_retention.max_age.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "finished-job retention must keep at least one record for a non-zero age"
                    .to_string(),
            ));
        }

        for (kind, settings) in &self.queues {
            if settings.concurrency == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} concurrency must be greater than 0",
                    kind
                )));
            }
            if let Some(limit) = settings.rate_limit {
                if limit.max == 0 || limit.per.is_zero() {
                    return Err(ConfigError::ValidationFailed(format!(
                        "{} rate limit must allow at least one request per non-zero interval",
                        kind
                    )));
                }
            }
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.lock_duration < self.job_timeout {
            return Err(ConfigError::ValidationFailed(
                "lock_duration cannot be shorter than job_timeout".to_string(),
            ));
        }

        if self.poll_interval.is_zero() || self.stalled_check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll and stalled-check intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Settings of one queue, falling back to its defaults.
    pub fn queue(&self, kind: QueueKind) -> QueueSettings {
        self.queues
            .get(&kind)
            .copied()
            .unwrap_or_else(|| QueueSettings::default_for(kind))
    }

    /// The webhook base URL.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when no URL is configured.
    pub fn require_webhook_url(&self) -> Result<&str, ConfigError> {
        self.webhook_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("PIPELINE_WEBHOOK_URL".to_string()))
    }

    pub fn timing(&self) -> Timing {
        Timing::new(self.offsets, self.priority)
    }

    /// Worker pool settings for one queue.
    pub fn pool_config(&self, kind: QueueKind) -> WorkerPoolConfig {
        let settings = self.queue(kind);
        WorkerPoolConfig::new(settings.concurrency)
            .with_rate_limit(settings.rate_limit)
            .with_backoff(self.backoff)
            .with_retention(self.retention)
            .with_job_timeout(self.job_timeout)
            .with_lock_duration(self.lock_duration)
            .with_max_stalled(self.max_stalled)
            .with_stalled_check_interval(self.stalled_check_interval)
            .with_poll_interval(self.poll_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the webhook base URL.
    pub fn with_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    /// Builder method to set the settings of one queue.
    pub fn with_queue(mut self, kind: QueueKind, settings: QueueSettings) -> Self {
        self.queues.insert(kind, settings);
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Builder method to set the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the lock duration.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }
}

/// Reads optional variables and parses duration units.
struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn scaled(&self, key: &str, unit_secs: u64, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(val) = self.get(key) {
            let n: u64 = parse_env_value(&val, key)?;
            *target = Duration::from_secs(n.saturating_mul(unit_secs));
        }
        Ok(())
    }

    fn secs(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        self.scaled(key, 1, target)
    }

    fn mins(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        self.scaled(key, 60, target)
    }

    fn hours(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        self.scaled(key, 3600, target)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a rate limit, where `none` or `off` disables limiting.
fn parse_rate_limit(value: &str, key: &str) -> Result<Option<RateLimit>, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "none" | "off" => Ok(None),
        other => other
            .parse::<RateLimit>()
            .map(Some)
            .map_err(|message| ConfigError::InvalidValue {
                key: key.to_string(),
                message,
            }),
    }
}
