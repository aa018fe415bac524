//! CLI command definitions for the log analysis queue.
//!
//! Runs the worker pool and offers one-shot commands for submitting and
//! inspecting tasks. Every inspection command prints pretty JSON.

use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::scheduler::{QueueService, SubmitOptions, TaskFilter, TaskStatus, TaskType};

/// Default page size for `list`.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Persistent task queue and worker pool for asynchronous log analysis.
#[derive(Parser, Debug)]
#[command(name = "loganalysis")]
#[command(about = "Run and inspect the log analysis task queue")]
#[command(version)]
#[command(
    long_about = "loganalysis runs a pool of workers that analyze log records submitted through a Redis-backed task queue.\n\nExample usage:\n  loganalysis worker --workers 4\n  loganalysis submit --log-id 42 --log-id 43 --priority 5\n  loganalysis list --status failed"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL (overrides REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Prefix for every queue key (overrides QUEUE_KEY_PREFIX).
    #[arg(long, global = true)]
    pub key_prefix: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the worker pool until interrupted.
    Worker(WorkerArgs),

    /// Submit a log analysis task.
    Submit(SubmitArgs),

    /// Show one task.
    Get {
        /// Task id.
        id: Uuid,
    },

    /// List tasks matching a filter.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show the queue counters from the store.
    Stats,

    /// Delete a task from the queue.
    Delete {
        /// Task id.
        id: Uuid,
    },

    /// Delete tasks older than the 24h TTL.
    Cleanup,

    /// Release tasks whose processing lease expired.
    Reclaim,

    /// Print a Prometheus snapshot of the queue depth.
    Metrics,
}

/// Arguments for `loganalysis worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (overrides QUEUE_WORKERS).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Reclaim expired leases during maintenance passes.
    #[arg(long)]
    pub reclaim_leases: bool,
}

/// Arguments for `loganalysis submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Id of a log record to analyze; repeat for several.
    #[arg(long = "log-id", required = true)]
    pub log_ids: Vec<String>,

    /// Task priority; higher runs first.
    #[arg(short, long)]
    pub priority: Option<i32>,

    /// Maximum number of retries after a failure.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for `loganalysis list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only tasks in this status.
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Only tasks of this type.
    #[arg(long = "type")]
    pub task_type: Option<TaskType>,

    /// Maximum number of tasks; 0 for all.
    #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
    pub limit: usize,

    /// Number of tasks to skip.
    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

impl ListArgs {
    fn to_filter(&self) -> TaskFilter {
        let mut filter = TaskFilter::new()
            .with_limit(self.limit)
            .with_offset(self.offset);
        if let Some(status) = self.status {
            filter = filter.with_status(status);
        }
        if let Some(task_type) = self.task_type {
            filter = filter.with_task_type(task_type);
        }
        filter
    }
}

#[derive(Debug, Serialize)]
struct CountOutput {
    status: &'static str,
    count: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Worker(_) => run_worker_command(config).await,
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Get { id } => {
            let service = QueueService::connect(&config).await?;
            print_json(&service.get_task(id).await?)
        }
        Commands::List(args) => {
            let service = QueueService::connect(&config).await?;
            print_json(&service.get_tasks(&args.to_filter()).await?)
        }
        Commands::Stats => {
            // Scheduler counters are per process; only the store counters
            // describe the shared queue
            let service = QueueService::connect(&config).await?;
            print_json(&service.get_queue_stats().await?)
        }
        Commands::Delete { id } => {
            let service = QueueService::connect(&config).await?;
            service.delete_task(id).await?;
            print_json(&serde_json::json!({ "status": "deleted", "id": id }))
        }
        Commands::Cleanup => {
            let service = QueueService::connect(&config).await?;
            let count = service.cleanup_expired_tasks().await?;
            print_json(&CountOutput {
                status: "cleaned",
                count,
            })
        }
        Commands::Reclaim => {
            let service = QueueService::connect(&config).await?;
            let count = service.reclaim_expired_leases().await?;
            print_json(&CountOutput {
                status: "reclaimed",
                count,
            })
        }
        Commands::Metrics => run_metrics_command(&config).await,
    }
}

/// Loads configuration from the environment and applies CLI overrides.
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::from_env()?;
    apply_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut AppConfig) {
    if let Some(url) = &cli.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(prefix) = &cli.key_prefix {
        config.key_prefix = prefix.clone();
    }
    if let Commands::Worker(args) = &cli.command {
        if let Some(workers) = args.workers {
            config.scheduler.num_workers = workers;
        }
        if args.reclaim_leases {
            config.scheduler.reclaim_leases = true;
        }
    }
}

/// Worker flags are folded into `config` by `load_config`.
async fn run_worker_command(config: AppConfig) -> anyhow::Result<()> {
    init_metrics()?;

    let mut service = QueueService::connect(&config).await?;
    let shutdown = CancellationToken::new();
    service.start(&shutdown)?;

    info!(
        workers = config.scheduler.num_workers,
        reclaim_leases = config.scheduler.reclaim_leases,
        "Worker pool running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    service.stop().await?;

    let stats = service.get_scheduler_stats().await;
    info!(
        processed = stats.processed_tasks,
        failed = stats.failed_tasks,
        retried = stats.retried_tasks,
        "Worker pool stopped"
    );

    Ok(())
}

async fn run_submit_command(config: &AppConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let service = QueueService::connect(config).await?;
    let options = SubmitOptions {
        priority: args.priority,
        max_retries: args.max_retries,
    };

    let task = service
        .schedule_log_analysis_with(args.log_ids, options)
        .await?;
    print_json(&task)
}

async fn run_metrics_command(config: &AppConfig) -> anyhow::Result<()> {
    init_metrics()?;

    let service = QueueService::connect(config).await?;
    let stats = service.get_queue_stats().await?;
    MetricsCollector::new().update_queue_depth(&stats);

    print!("{}", export_metrics());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
