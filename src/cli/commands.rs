//! CLI command definitions for fixture-pipeline.
//!
//! `run` is the long-running scheduler process. The other subcommands run
//! one recovery pass or operator action against the shared backends and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::ingestion::read_batch;
use crate::metrics::{export_metrics, init_metrics};
use crate::model::QueueKind;
use crate::queue::{connect_manager, QueueSet};
use crate::runtime::PipelineRuntime;
use crate::status::{collect_status, purge_dead_letters, replay_dead_letter, StatusReport};
use crate::storage::{Database, FixtureStore};
use crate::worker::WebhookHandler;

/// Dead-letter entries shown per queue by default.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

/// Scheduling, backfill and recovery of per-match pipeline jobs.
#[derive(Parser)]
#[command(name = "fixture-pipeline")]
#[command(about = "Schedule, backfill and recover pipeline jobs for sporting fixtures")]
#[command(version)]
#[command(
    long_about = "fixture-pipeline schedules per-match stage jobs (analysis, lineups, predictions, live monitor, settlement) relative to kickoff, and closes gaps through startup catch-up, periodic backfill and stuck-match recovery.\n\nSettings come from PIPELINE_* environment variables; connection URLs may be given as flags.\n\nExample usage:\n  fixture-pipeline migrate\n  fixture-pipeline run\n  fixture-pipeline status --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL of the queue backend.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// PostgreSQL URL of the fixture store.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Base URL of the stage handler service.
    #[arg(long, env = "PIPELINE_WEBHOOK_URL", global = true)]
    pub webhook_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler: catch-up, worker pools and periodic sweeps.
    Run,

    /// Re-schedule every match in the catch-up window once.
    #[command(name = "catch-up")]
    CatchUp,

    /// Run one gap-detection pass.
    Backfill,

    /// Run one stuck-match scan.
    #[command(name = "detect-stuck")]
    DetectStuck,

    /// Store and schedule a JSON array of fixture updates.
    Ingest(IngestArgs),

    /// Show per-queue job counts and recent dead letters.
    Status(StatusArgs),

    /// Inspect, replay or purge dead-letter entries.
    #[command(name = "dead-letter")]
    DeadLetter(DeadLetterArgs),

    /// Apply database migrations.
    Migrate,
}

#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// Path to a JSON file holding an array of fixture updates.
    pub file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Output Prometheus metrics after refreshing queue gauges.
    #[arg(long, conflicts_with = "json")]
    pub metrics: bool,

    /// Dead-letter entries shown per queue.
    #[arg(long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
    pub dead_letters: usize,
}

#[derive(Parser, Debug)]
pub struct DeadLetterArgs {
    #[command(subcommand)]
    pub command: DeadLetterCommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum DeadLetterCommand {
    /// List entries, newest first.
    List {
        /// Only this queue.
        #[arg(short, long)]
        queue: Option<QueueKind>,

        #[arg(long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
        limit: usize,
    },

    /// Re-enqueue an entry as a fresh job.
    Replay {
        queue: QueueKind,
        entry_id: Uuid,
    },

    /// Drop entries.
    Purge {
        /// Only this queue.
        #[arg(short, long)]
        queue: Option<QueueKind>,
    },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => run_scheduler(config).await,
        Commands::CatchUp => {
            let report = runtime(&config).await?.catch_up().run().await?;
            print_json(&report)
        }
        Commands::Backfill => {
            let report = runtime(&config).await?.backfill().run().await?;
            print_json(&report)
        }
        Commands::DetectStuck => {
            let report = runtime(&config).await?.stuck_detector().run().await?;
            print_json(&report)
        }
        Commands::Ingest(args) => {
            let updates = read_batch(&args.file)
                .await
                .with_context(|| format!("reading {}", args.file.display()))?;
            let report = runtime(&config).await?.ingestor().ingest(updates).await;
            print_json(&report)
        }
        Commands::Status(args) => run_status(&config, args).await,
        Commands::DeadLetter(args) => run_dead_letter(&config, args.command).await,
        Commands::Migrate => {
            let db = Database::connect(&config.database_url).await?;
            let applied = db.run_migrations().await?;
            println!("Applied {} migration(s)", applied);
            for migration in db.applied_migrations().await? {
                println!(
                    "  {:>3}  {:<24} {}",
                    migration.version,
                    migration.name,
                    migration.applied_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
    }
}

/// Environment configuration with connection flags applied on top.
fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("loading configuration")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url.clone());
    }
    if let Some(url) = &cli.webhook_url {
        config = config.with_webhook_url(url.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn open_queues(config: &PipelineConfig) -> anyhow::Result<QueueSet> {
    let conn = connect_manager(&config.redis_url)
        .await
        .context("connecting to the queue backend")?;
    Ok(QueueSet::redis(conn, &config.queue_prefix, config.job_retention))
}

async fn runtime(config: &PipelineConfig) -> anyhow::Result<PipelineRuntime> {
    let queues = open_queues(config).await?;
    let db = Database::connect(&config.database_url)
        .await
        .context("connecting to the fixture store")?;
    let store: Arc<dyn FixtureStore> = Arc::new(db);
    Ok(PipelineRuntime::new(config.clone(), store, queues))
}

async fn run_scheduler(config: PipelineConfig) -> anyhow::Result<()> {
    init_metrics()?;

    let webhook_url = config.require_webhook_url()?.to_string();
    let handler = Arc::new(WebhookHandler::new(webhook_url, config.webhook_timeout)?);
    let runtime = runtime(&config).await?;

    info!(
        redis = %config.redis_url,
        prefix = %config.queue_prefix,
        "Starting fixture pipeline"
    );

    runtime
        .run_until(handler, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

async fn run_status(config: &PipelineConfig, args: StatusArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics()?;
    }

    let queues = open_queues(config).await?;
    let report = collect_status(&queues, args.dead_letters).await?;

    if args.metrics {
        print!("{}", export_metrics());
    } else if args.json {
        print_json(&report)?;
    } else {
        print_status_table(&report);
    }
    Ok(())
}

async fn run_dead_letter(config: &PipelineConfig, command: DeadLetterCommand) -> anyhow::Result<()> {
    let queues = open_queues(config).await?;

    match command {
        DeadLetterCommand::List { queue, limit } => {
            let mut entries = Vec::new();
            for (kind, q) in queues.iter() {
                if queue.map_or(true, |wanted| wanted == kind) {
                    entries.extend(q.dead_letters(limit).await?);
                }
            }
            entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
            print_json(&entries)
        }
        DeadLetterCommand::Replay { queue, entry_id } => {
            let job_id = replay_dead_letter(&queues, queue, entry_id, Utc::now()).await?;
            println!("Replayed {} as {}", entry_id, job_id);
            Ok(())
        }
        DeadLetterCommand::Purge { queue } => {
            let purged = purge_dead_letters(&queues, queue).await?;
            println!("Purged {} dead letter entr{}", purged, if purged == 1 { "y" } else { "ies" });
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status_table(report: &StatusReport) {
    println!(
        "{:<14} {:>8} {:>8} {:>8} {:>10} {:>8} {:>8}",
        "QUEUE", "WAITING", "DELAYED", "ACTIVE", "COMPLETED", "FAILED", "DEAD"
    );
    for q in &report.queues {
        let c = &q.counts;
        println!(
            "{:<14} {:>8} {:>8} {:>8} {:>10} {:>8} {:>8}",
            q.queue.as_str(),
            c.waiting,
            c.delayed,
            c.active,
            c.completed,
            c.failed,
            c.dead_letter
        );
    }

    for q in report.queues.iter().filter(|q| !q.dead_letters.is_empty()) {
        println!();
        println!("Dead letters ({}):", q.queue);
        for entry in &q.dead_letters {
            println!(
                "  {}  {}  {}  {}",
                entry.entry_id,
                entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
                entry.job.id,
                entry.error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_status_flags() {
        let cli = Cli::try_parse_from(["fixture-pipeline", "status", "--json"]).expect("should parse");
        match cli.command {
            Commands::Status(args) => {
                assert!(args.json);
                assert!(!args.metrics);
                assert_eq!(args.dead_letters, DEFAULT_DEAD_LETTER_LIMIT);
            }
            _ => panic!("Expected Status command"),
        }

        assert!(Cli::try_parse_from(["fixture-pipeline", "status", "--json", "--metrics"]).is_err());
    }

    #[test]
    fn test_dead_letter_replay_args() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "fixture-pipeline",
            "dead-letter",
            "replay",
            "live-monitor",
            &id.to_string(),
        ])
        .expect("should parse");

        match cli.command {
            Commands::DeadLetter(DeadLetterArgs {
                command: DeadLetterCommand::Replay { queue, entry_id },
            }) => {
                assert_eq!(queue, QueueKind::LiveMonitor);
                assert_eq!(entry_id, id);
            }
            _ => panic!("Expected dead-letter replay"),
        }

        assert!(Cli::try_parse_from(["fixture-pipeline", "dead-letter", "replay", "scores", &id.to_string()]).is_err());
    }

    #[test]
    fn test_global_connection_flags() {
        let cli = Cli::try_parse_from([
            "fixture-pipeline",
            "backfill",
            "--redis-url",
            "redis://queue:6379",
            "--log-level",
            "debug",
        ])
        .expect("should parse");

        assert!(matches!(cli.command, Commands::Backfill));
        assert_eq!(cli.redis_url.as_deref(), Some("redis://queue:6379"));
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_ingest_requires_file() {
        assert!(Cli::try_parse_from(["fixture-pipeline", "ingest"]).is_err());
        let cli = Cli::try_parse_from(["fixture-pipeline", "ingest", "fixtures.json"]).expect("should parse");
        match cli.command {
            Commands::Ingest(args) => assert_eq!(args.file, PathBuf::from("fixtures.json")),
            _ => panic!("Expected Ingest command"),
        }
    }
}
