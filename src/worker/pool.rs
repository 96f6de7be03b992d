//! Worker pool for processing jobs from one stage queue.
//!
//! Each worker runs as an independent async task that waits on the pool's
//! rate limiter, claims a job from the shared queue, and runs the handler
//! under a timeout. A separate task returns jobs with expired locks to the queue.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Optional per-queue rate limit
//! - Graceful shutdown with broadcast channel
//! - Exponential backoff for transient failures
//! - Dead letter store for terminal failures, exhausted retries and stalls
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handler::{HandlerOutcome, JobHandler};
use super::rate_limit::JobRateLimiter;
use crate::config::RateLimit;
use crate::error::JobError;
use crate::metrics::MetricsCollector;
use crate::model::QueueKind;
use crate::queue::{
    BackoffPolicy, DeadLetterEntry, Job, JobQueue, QueueError, RetentionPolicy,
};
use crate::scheduler::timing::to_chrono;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue backend failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Job starts allowed per interval, shared by all workers of the pool.
    pub rate_limit: Option<RateLimit>,
    /// Retry schedule for transient failures.
    pub backoff: BackoffPolicy,
    /// Dead-letter retention applied on every push.
    pub retention: RetentionPolicy,
    /// Maximum time allowed for processing a single job.
    pub job_timeout: Duration,
    /// How long a claimed job stays locked to its worker.
    pub lock_duration: Duration,
    /// Stalls tolerated before a job is dead-lettered.
    pub max_stalled: u32,
    /// How often expired locks are checked.
    pub stalled_check_interval: Duration,
    /// How often to poll for new jobs when the queue is empty.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            rate_limit: None,
            backoff: BackoffPolicy::default(),
            retention: RetentionPolicy::default(),
            job_timeout: Duration::from_secs(300),
            lock_duration: Duration::from_secs(600),
            max_stalled: 1,
            stalled_check_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: Option<RateLimit>) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_max_stalled(mut self, max_stalled: u32) -> Self {
        self.max_stalled = max_stalled;
        self
    }

    pub fn with_stalled_check_interval(mut self, interval: Duration) -> Self {
        self.stalled_check_interval = interval;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Completed without doing work.
    Skipped(String),
    /// Moved back to delayed after a transient failure.
    Retried { run_at: DateTime<Utc> },
    /// Failed and dead-lettered.
    Failed,
    /// Exceeded the job timeout; left active for stalled-job recovery.
    TimedOut,
}

impl JobOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Skipped(_) => "skipped",
            JobOutcome::Retried { .. } => "retried",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Jobs completed, including skipped ones.
    pub jobs_completed: u64,
    /// Jobs failed permanently.
    pub jobs_failed: u64,
    /// Attempts that ended in a scheduled retry.
    pub jobs_retried: u64,
    /// Jobs dead-lettered after stalling too often.
    pub jobs_stalled: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_stalled: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn record(&self, outcome: &JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Completed | JobOutcome::Skipped(_) => &self.jobs_completed,
            JobOutcome::Failed => &self.jobs_failed,
            JobOutcome::Retried { .. } => &self.jobs_retried,
            JobOutcome::TimedOut => &self.attempts,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        if !matches!(outcome, JobOutcome::TimedOut) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_stalled(&self, count: usize) {
        self.jobs_stalled.fetch_add(count as u64, Ordering::SeqCst);
        self.jobs_failed.fetch_add(count as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            jobs_stalled: self.jobs_stalled.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Claims and processes jobs from one queue.
///
/// Shared by every worker of a pool; also usable on its own to drain a queue
/// step by step.
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<JobRateLimiter>,
    config: WorkerPoolConfig,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
}

impl JobRunner {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let limiter = config.rate_limit.and_then(|limit| {
            let limiter = JobRateLimiter::new(limit);
            if limiter.is_none() {
                warn!(queue = %queue.kind(), limit = %limit, "Ignoring empty rate limit");
            }
            limiter
        });

        Self {
            queue,
            handler,
            limiter,
            config,
            stats: SharedPoolStats::default(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.queue.kind()
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Claims one eligible job and processes it.
    ///
    /// The rate-limit permit is taken before the claim so the lock only
    /// covers handler time. A poll that finds nothing still spends a permit.
    ///
    /// Returns `None` when no job is eligible.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobOutcome>, PoolError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let Some(mut job) = self.queue.claim(Utc::now(), self.config.lock_duration).await? else {
            return Ok(None);
        };

        job.increment_attempts();

        info!(
            worker_id = %worker_id,
            job_id = %job.id,
            queue = %self.kind(),
            attempt = job.attempts,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_active_workers();
        let start_time = Instant::now();

        let result = tokio::time::timeout(self.config.job_timeout, self.handler.handle(&job)).await;

        let duration = start_time.elapsed();
        self.stats.decrement_active();
        self.metrics.dec_active_workers();

        let outcome = match result {
            Ok(Ok(handled)) => self.finish(&job, handled, worker_id).await,
            Ok(Err(e)) => self.handle_failure(job.clone(), e, worker_id).await,
            Err(_) => {
                warn!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    timeout_secs = self.config.job_timeout.as_secs(),
                    "Job timed out, leaving it for stalled-job recovery"
                );
                JobOutcome::TimedOut
            }
        };

        self.stats.record(&outcome, duration);
        self.metrics
            .record_job_processed(self.kind().as_str(), outcome.as_str(), duration);

        Ok(Some(outcome))
    }

    async fn finish(&self, job: &Job, handled: HandlerOutcome, worker_id: &str) -> JobOutcome {
        if let Err(e) = self.queue.complete(job, Utc::now()).await {
            error!(worker_id = %worker_id, job_id = %job.id, error = %e, "Failed to mark job complete");
        }

        match handled {
            HandlerOutcome::Done => {
                info!(worker_id = %worker_id, job_id = %job.id, "Job completed successfully");
                JobOutcome::Completed
            }
            HandlerOutcome::Skipped(reason) => {
                info!(worker_id = %worker_id, job_id = %job.id, reason = %reason, "Job skipped");
                JobOutcome::Skipped(reason)
            }
        }
    }

    async fn handle_failure(&self, mut job: Job, err: JobError, worker_id: &str) -> JobOutcome {
        let now = Utc::now();
        job.last_error = Some(err.to_string());

        if err.is_retryable() && job.should_retry() {
            let mut delay = self.config.backoff.delay_for(job.attempts);
            if let JobError::RateLimited {
                retry_after: Some(retry_after),
            } = &err
            {
                delay = delay.max(*retry_after);
            }
            job.run_at = now + to_chrono(delay);

            warn!(
                worker_id = %worker_id,
                job_id = %job.id,
                error = %err,
                remaining_attempts = job.remaining_attempts(),
                retry_in_secs = delay.as_secs(),
                "Job failed, scheduling retry"
            );

            match self.queue.retry_later(&job, now).await {
                Ok(()) => return JobOutcome::Retried { run_at: job.run_at },
                Err(e) => {
                    error!(worker_id = %worker_id, job_id = %job.id, error = %e, "Failed to schedule retry");
                }
            }
        }

        error!(
            worker_id = %worker_id,
            job_id = %job.id,
            error = %err,
            attempts = job.attempts,
            "Job failed, moving to dead letter store"
        );

        if let Err(e) = self.queue.fail(&job, now).await {
            error!(worker_id = %worker_id, job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        self.dead_letter(job, err.to_string(), now).await;

        JobOutcome::Failed
    }

    async fn dead_letter(&self, job: Job, error: String, now: DateTime<Utc>) {
        let job_id = job.id.clone();
        let entry = DeadLetterEntry::new(job, error, now);
        match self.queue.push_dead_letter(entry, &self.config.retention).await {
            Ok(()) => self.metrics.record_dead_letter(self.kind().as_str()),
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to store dead letter entry"),
        }
    }

    /// Returns jobs with expired locks to the queue and dead-letters those
    /// that stalled too often. Returns how many were requeued.
    pub async fn recover_stalled(&self, now: DateTime<Utc>) -> Result<usize, PoolError> {
        let recovery = self
            .queue
            .recover_stalled(now, self.config.max_stalled)
            .await?;

        if recovery.requeued > 0 {
            info!(queue = %self.kind(), requeued = recovery.requeued, "Recovered stalled jobs");
        }

        let exhausted = recovery.exhausted.len();
        for job in recovery.exhausted {
            warn!(job_id = %job.id, stalled = job.stalled_count, "Job stalled too often");
            let error = format!("job stalled more than {} times", self.config.max_stalled);
            self.dead_letter(job, error, now).await;
        }
        self.stats.record_stalled(exhausted);

        Ok(recovery.requeued)
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    runner: Arc<JobRunner>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool for `queue`, running `handler` for every job.
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            runner: Arc::new(JobRunner::new(config.clone(), queue, handler)),
            config,
            shutdown_tx,
            worker_handles: Vec::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the stalled-job checker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Jobs left active by a previous process are picked up once their lock expires
        if let Err(e) = self.runner.recover_stalled(Utc::now()).await {
            warn!(queue = %self.runner.kind(), error = %e, "Failed to recover stalled jobs");
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("{}-worker-{}", self.runner.kind(), i),
                runner: Arc::clone(&self.runner),
                shutdown_rx: self.shutdown_tx.subscribe(),
                poll_interval: self.config.poll_interval,
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let runner = Arc::clone(&self.runner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.stalled_check_interval;
        self.worker_handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = runner.recover_stalled(Utc::now()).await {
                            error!(queue = %runner.kind(), error = %e, "Stalled-job check failed");
                        }
                    }
                }
            }
        }));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            queue = %self.runner.kind(),
            num_workers = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal to all workers and waits for them to finish
    /// their current jobs.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(queue = %self.runner.kind(), "Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(queue = %self.runner.kind(), "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.runner.stats()
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn kind(&self) -> QueueKind {
        self.runner.kind()
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    runner: Arc<JobRunner>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Interval between poll attempts when queue is empty.
    poll_interval: Duration,
}

impl Worker {
    /// Claims and processes jobs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let idle = match self.runner.run_once(&self.id).await {
                Ok(Some(_)) => false,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                    true
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stage;
    use crate::queue::{JobId, JobPayload, JobState, MatchJob, MemoryQueue};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct Scripted {
        results: Mutex<Vec<Result<HandlerOutcome, JobError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(results: Vec<Result<HandlerOutcome, JobError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        async fn handle(&self, _job: &Job) -> Result<HandlerOutcome, JobError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(HandlerOutcome::Done)
            } else {
                results.remove(0)
            }
        }
    }

    struct Sleepy;

    #[async_trait]
    impl JobHandler for Sleepy {
        async fn handle(&self, _job: &Job) -> Result<HandlerOutcome, JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HandlerOutcome::Done)
        }
    }

    fn lineups_job(match_id: i64) -> Job {
        let payload = MatchJob {
            match_id,
            external_id: match_id + 1000,
            kickoff: Utc::now() + chrono::Duration::hours(1),
            allow_retroactive: false,
        };
        Job::new(
            JobId::for_stage(Stage::Lineups, match_id),
            JobPayload::for_stage(Stage::Lineups, payload),
            4,
            Utc::now() - chrono::Duration::seconds(1),
        )
    }

    async fn runner_with(
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> (JobRunner, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new(QueueKind::Lineups));
        queue.enqueue_unique(lineups_job(1), Utc::now()).await.unwrap();
        (JobRunner::new(config, queue.clone(), handler), queue)
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_rate_limit(Some(RateLimit::new(10, Duration::from_secs(60))))
            .with_poll_interval(Duration::from_secs(5))
            .with_job_timeout(Duration::from_secs(3600))
            .with_max_stalled(2)
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.rate_limit.map(|l| l.max), Some(10));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_stalled, 2);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            jobs_completed: 80,
            jobs_failed: 20,
            ..Default::default()
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::default();

        stats.record(&JobOutcome::Completed, Duration::from_secs(10));
        stats.record(&JobOutcome::Skipped("finished".into()), Duration::from_secs(20));
        stats.record(&JobOutcome::Failed, Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);
        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    /// Records whether the job's lock was still held when the handler ran.
    struct LockObserver {
        queue: Arc<MemoryQueue>,
        held: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl JobHandler for LockObserver {
        async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
            let record = self.queue.get(&job.id).await?;
            let held = record
                .and_then(|r| r.locked_until)
                .is_some_and(|until| until > Utc::now());
            self.held.lock().unwrap().push(held);
            Ok(HandlerOutcome::Done)
        }
    }

    #[tokio::test]
    async fn test_rate_limit_wait_does_not_eat_into_lock() {
        let queue = Arc::new(MemoryQueue::new(QueueKind::Lineups));
        for id in [1, 2] {
            queue.enqueue_unique(lineups_job(id), Utc::now()).await.unwrap();
        }
        let observer = Arc::new(LockObserver {
            queue: queue.clone(),
            held: Mutex::default(),
        });
        // The second permit arrives well after a lock taken at claim time would expire
        let config = WorkerPoolConfig::new(1)
            .with_rate_limit(Some(RateLimit::new(1, Duration::from_millis(400))))
            .with_lock_duration(Duration::from_millis(150));
        let runner = JobRunner::new(config, queue.clone(), observer.clone());

        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(*observer.held.lock().unwrap(), vec![true, true]);
    }

    #[tokio::test]
    async fn test_run_once_on_empty_queue() {
        let queue = Arc::new(MemoryQueue::new(QueueKind::Lineups));
        let runner = JobRunner::new(WorkerPoolConfig::new(1), queue, Scripted::new(vec![]));
        assert_eq!(runner.run_once("w").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let (runner, queue) = runner_with(Scripted::new(vec![]), WorkerPoolConfig::new(1)).await;

        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Completed));
        let record = queue.get(&JobId::for_stage(Stage::Lineups, 1)).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(runner.stats().jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_with_backoff() {
        let handler = Scripted::new(vec![Err(JobError::upstream(503, "unavailable"))]);
        let (runner, queue) = runner_with(handler, WorkerPoolConfig::new(1)).await;

        let before = Utc::now();
        let outcome = runner.run_once("w").await.unwrap().unwrap();
        let JobOutcome::Retried { run_at } = outcome else {
            panic!("expected retry, got {:?}", outcome);
        };
        assert!(run_at >= before + chrono::Duration::seconds(30));

        let record = queue.get(&JobId::for_stage(Stage::Lineups, 1)).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert_eq!(record.job.attempts, 1);
        assert!(record.job.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_terminal_error_is_dead_lettered() {
        let handler = Scripted::new(vec![Err(JobError::MatchCancelled(1))]);
        let (runner, queue) = runner_with(handler, WorkerPoolConfig::new(1)).await;

        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Failed));

        let record = queue.get(&JobId::for_stage(Stage::Lineups, 1)).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Failed);
        let entries = queue.dead_letters(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].match_id, Some(1));
        assert!(entries[0].error.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let handler = Scripted::new(vec![Err(JobError::Unavailable("down".into()))]);
        let queue = Arc::new(MemoryQueue::new(QueueKind::Lineups));
        queue
            .enqueue_unique(lineups_job(2).with_max_attempts(1), Utc::now())
            .await
            .unwrap();
        let runner = JobRunner::new(WorkerPoolConfig::new(1), queue.clone(), handler);

        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::Failed));
        assert_eq!(queue.counts().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn test_timed_out_job_stays_active_until_stalled_recovery() {
        let config = WorkerPoolConfig::new(1)
            .with_job_timeout(Duration::from_millis(20))
            .with_lock_duration(Duration::from_secs(60))
            .with_max_stalled(1);
        let (runner, queue) = runner_with(Arc::new(Sleepy), config).await;

        assert_eq!(runner.run_once("w").await.unwrap(), Some(JobOutcome::TimedOut));
        let id = JobId::for_stage(Stage::Lineups, 1);
        assert_eq!(queue.get(&id).await.unwrap().unwrap().state, JobState::Active);

        // Lock still held
        assert_eq!(runner.recover_stalled(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(2);
        assert_eq!(runner.recover_stalled(later).await.unwrap(), 1);
        assert_eq!(queue.get(&id).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_repeated_stall_is_dead_lettered() {
        let config = WorkerPoolConfig::new(1)
            .with_lock_duration(Duration::from_secs(1))
            .with_max_stalled(0);
        let (runner, queue) = runner_with(Scripted::new(vec![]), config).await;

        queue.claim(Utc::now(), Duration::from_secs(1)).await.unwrap().unwrap();
        let later = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(runner.recover_stalled(later).await.unwrap(), 0);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.dead_letter, 1);
        assert_eq!(runner.stats().jobs_stalled, 1);
    }

    #[tokio::test]
    async fn test_pool_processes_and_shuts_down() {
        let queue = Arc::new(MemoryQueue::new(QueueKind::Lineups));
        for id in 1..=3 {
            queue.enqueue_unique(lineups_job(id), Utc::now()).await.unwrap();
        }
        let handler = Scripted::new(vec![]);
        let config = WorkerPoolConfig::new(2).with_poll_interval(Duration::from_millis(10));
        let mut pool = WorkerPool::new(config, queue.clone(), handler.clone());

        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        for _ in 0..100 {
            if queue.counts().await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().jobs_completed, 3);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
