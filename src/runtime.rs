//! Process wiring: worker pools, startup catch-up, periodic sweeps.
//!
//! ```text
//! start ─► catch-up ─► pools (5 stage queues + backfill) ─► sweep tickers
//!                                                             │
//!             backfill queue ◄── gap-scan / stuck-scan jobs ◄─┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::ingestion::FixtureIngestor;
use crate::model::QueueKind;
use crate::queue::{QueueError, QueueSet, SweepKind};
use crate::recovery::{
    enqueue_sweep, Backfill, CatchUp, CatchUpReport, RecoveryHandler, StuckDetector,
};
use crate::scheduler::Scheduler;
use crate::storage::{FixtureStore, StoreError};
use crate::worker::{JobHandler, MatchGuard, PoolError, PoolStats, WorkerPool};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Runtime is already running")]
    AlreadyRunning,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Everything a scheduler process runs.
///
/// Queues and store are built by the caller and shared; there is no global
/// state, so several runtimes can coexist in one test.
pub struct PipelineRuntime {
    config: PipelineConfig,
    store: Arc<dyn FixtureStore>,
    queues: QueueSet,
    scheduler: Scheduler,
    pools: Vec<WorkerPool>,
    tickers: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PipelineRuntime {
    pub fn new(config: PipelineConfig, store: Arc<dyn FixtureStore>, queues: QueueSet) -> Self {
        let scheduler = Scheduler::new(queues.clone(), config.timing())
            .with_max_attempts(config.backoff.max_attempts);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            queues,
            scheduler,
            pools: Vec::new(),
            tickers: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn catch_up(&self) -> CatchUp {
        CatchUp::new(self.store.clone(), self.scheduler.clone(), self.config.catch_up)
    }

    pub fn backfill(&self) -> Backfill {
        Backfill::new(self.store.clone(), self.scheduler.clone(), self.config.backfill)
    }

    pub fn stuck_detector(&self) -> StuckDetector {
        StuckDetector::new(self.store.clone(), self.scheduler.clone(), self.config.stuck)
    }

    pub fn ingestor(&self) -> FixtureIngestor {
        FixtureIngestor::new(self.store.clone(), self.scheduler.clone())
    }

    pub fn is_running(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Runs catch-up, then starts every worker pool and the sweep tickers.
    ///
    /// `stage_handler` does the domain work of the five stage queues; each
    /// stage pool wraps it in a [`MatchGuard`].
    pub async fn start(
        &mut self,
        stage_handler: Arc<dyn JobHandler>,
    ) -> Result<CatchUpReport, RuntimeError> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyRunning);
        }

        let report = self.catch_up().run().await?;

        for kind in QueueKind::ALL {
            let handler: Arc<dyn JobHandler> = match kind {
                QueueKind::Backfill => Arc::new(RecoveryHandler::new(
                    self.backfill(),
                    self.stuck_detector(),
                )),
                _ => Arc::new(MatchGuard::new(self.store.clone(), stage_handler.clone())),
            };

            let mut pool = WorkerPool::new(
                self.config.pool_config(kind),
                self.queues.get(kind).clone(),
                handler,
            );
            pool.start().await?;
            self.pools.push(pool);
        }

        self.spawn_sweep_ticker(SweepKind::GapScan, self.config.backfill_interval);
        self.spawn_sweep_ticker(SweepKind::StuckScan, self.config.stuck_interval);

        info!(
            pools = self.pools.len(),
            catch_up_created = report.jobs_created,
            "Pipeline runtime started"
        );

        Ok(report)
    }

    fn spawn_sweep_ticker(&mut self, sweep: SweepKind, every: Duration) {
        let queues = self.queues.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.tickers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = enqueue_sweep(&queues, sweep, Utc::now()).await {
                            error!(sweep = sweep.as_str(), error = %e, "Failed to enqueue sweep");
                        }
                    }
                }
            }
        }));
    }

    /// Per-queue pool statistics.
    pub fn stats(&self) -> Vec<(QueueKind, PoolStats)> {
        self.pools.iter().map(|p| (p.kind(), p.stats())).collect()
    }

    /// Stops the tickers, then all pools at once. Pools that miss their
    /// shutdown timeout are logged; the first such error is returned.
    pub async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        let _ = self.shutdown_tx.send(());
        for ticker in self.tickers.drain(..) {
            if let Err(e) = ticker.await {
                error!(error = %e, "Sweep ticker panicked during shutdown");
            }
        }

        let mut pools: Vec<WorkerPool> = self.pools.drain(..).collect();
        let results = join_all(pools.iter_mut().map(|pool| async move {
            let kind = pool.kind();
            (kind, pool.shutdown().await)
        }))
        .await;

        let mut first_error = None;
        for (kind, result) in results {
            if let Err(e) = result {
                warn!(queue = %kind, error = %e, "Worker pool did not stop cleanly");
                first_error.get_or_insert(e);
            }
        }

        info!("Pipeline runtime stopped");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Starts the runtime and runs until `signal` resolves.
    pub async fn run_until(
        mut self,
        stage_handler: Arc<dyn JobHandler>,
        signal: impl Future<Output = ()>,
    ) -> Result<(), RuntimeError> {
        self.start(stage_handler).await?;
        signal.await;
        info!("Shutdown requested");
        self.shutdown().await
    }
}
