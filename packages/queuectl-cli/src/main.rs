//! QueueCtl command line interface.
//!
//! Thin operator surface over the `queuectl` library: every subcommand opens
//! the database file, builds a [`Queue`] and calls one library operation.
//! Exit code 0 on success, 1 on any error (printed in red).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuectl::{EnqueueRequest, JobState, Queue, SqliteStore, WorkerPool, WorkerPoolConfig};

// =============================================================================
// CLI Arguments (clap)
// =============================================================================

#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "Durable background job queue for shell commands")]
#[command(version)]
struct Cli {
    /// Path to the queue database file
    #[arg(long, global = true, default_value = "queue.db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a job to the queue
    Enqueue {
        /// Shell command, or JSON like {"command": "...", "priority": 5}
        job: String,

        /// Higher priority wins at claim time
        #[arg(long)]
        priority: Option<i64>,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<i64>,

        /// Seconds before the job becomes eligible to run
        #[arg(long)]
        delay: Option<i64>,

        /// Retry ceiling before the job is dead lettered
        #[arg(long)]
        max_retries: Option<i32>,
    },

    /// Worker pool management
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Show state counts and config
    Status,

    /// List jobs
    List {
        /// Filter by state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Dead letter queue inspection and revive
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },

    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Execution statistics
    Metrics,

    /// Start the read-only HTTP dashboard
    Dashboard {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Run the worker pool until interrupted (Ctrl-C drains gracefully)
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 4)]
        count: usize,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead letter entries
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Re-enqueue a dead letter entry as a fresh pending job
    Retry { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a config value
    Get { key: String },

    /// Set a config value
    Set { key: String, value: String },

    /// List all config entries
    List,
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e:#}", style("error:").red().bold());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli) -> Result<()> {
    let store = SqliteStore::open(&cli.db_path).await.with_context(|| {
        format!("failed to open queue database at {}", cli.db_path.display())
    })?;
    let queue = Queue::new(store);

    match cli.command {
        Commands::Enqueue {
            job,
            priority,
            timeout,
            delay,
            max_retries,
        } => enqueue(&queue, job, priority, timeout, delay, max_retries).await,
        Commands::Worker {
            action: WorkerAction::Start { count },
        } => worker_start(queue, count).await,
        Commands::Status => status(&queue).await,
        Commands::List { state, limit } => list(&queue, state, limit).await,
        Commands::Dlq { action } => match action {
            DlqAction::List { limit } => dlq_list(&queue, limit).await,
            DlqAction::Retry { id } => dlq_retry(&queue, &id).await,
        },
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => config_get(&queue, &key).await,
            ConfigAction::Set { key, value } => config_set(&queue, &key, &value).await,
            ConfigAction::List => config_list(&queue).await,
        },
        Commands::Metrics => metrics(&queue).await,
        Commands::Dashboard { port } => dashboard(queue, port).await,
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn enqueue(
    queue: &Queue,
    job: String,
    priority: Option<i64>,
    timeout: Option<i64>,
    delay: Option<i64>,
    max_retries: Option<i32>,
) -> Result<()> {
    let mut request: EnqueueRequest = if job.trim_start().starts_with('{') {
        serde_json::from_str(&job).context("invalid job JSON")?
    } else {
        EnqueueRequest::builder().command(job).build()
    };

    // Flags win over JSON fields.
    if priority.is_some() {
        request.priority = priority;
    }
    if timeout.is_some() {
        request.timeout_seconds = timeout;
    }
    if max_retries.is_some() {
        request.max_retries = max_retries;
    }
    if let Some(delay) = delay {
        request.run_at = Some(Utc::now() + chrono::Duration::seconds(delay));
    }

    let job = queue.enqueue(request).await?;
    println!(
        "{} {} ({})",
        style("enqueued").green().bold(),
        job.id,
        job.command
    );
    Ok(())
}

async fn worker_start(queue: Queue, count: usize) -> Result<()> {
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        token.cancel();
    });

    let pool = WorkerPool::with_config(Arc::new(queue), WorkerPoolConfig::with_count(count));
    pool.run(shutdown).await?;
    Ok(())
}

async fn status(queue: &Queue) -> Result<()> {
    let stats = queue.stats().await?;

    println!("{}", style("Jobs").bold());
    println!("  pending     {}", stats.pending);
    println!("  processing  {}", stats.processing);
    println!("  completed   {}", stats.completed);
    println!("  failed      {}", stats.failed);
    println!("  dead        {}", stats.dead);

    let config = queue.all_config().await?;
    if !config.is_empty() {
        println!();
        println!("{}", style("Config").bold());
        for (key, value) in config {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

async fn list(queue: &Queue, state: Option<String>, limit: i64) -> Result<()> {
    let state = state.as_deref().map(str::parse::<JobState>).transpose()?;
    let jobs = queue.list(state, limit).await?;

    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }

    println!(
        "{}",
        style(format!(
            "{:<36}  {:<10}  {:>8}  {:>8}  COMMAND",
            "ID", "STATE", "ATTEMPTS", "PRIORITY"
        ))
        .dim()
    );
    for job in jobs {
        println!(
            "{:<36}  {:<10}  {:>8}  {:>8}  {}",
            job.id,
            job.state.to_string(),
            format!("{}/{}", job.attempts, job.max_retries),
            job.priority,
            job.command
        );
    }
    Ok(())
}

async fn dlq_list(queue: &Queue, limit: i64) -> Result<()> {
    let entries = queue.get_dlq(limit).await?;

    if entries.is_empty() {
        println!("dead letter queue is empty");
        return Ok(());
    }

    println!(
        "{}",
        style(format!(
            "{:<36}  {:>8}  {:<20}  ERROR",
            "ID", "ATTEMPTS", "FAILED AT"
        ))
        .dim()
    );
    for entry in entries {
        println!(
            "{:<36}  {:>8}  {:<20}  {}",
            entry.id,
            format!("{}/{}", entry.attempts, entry.max_retries),
            entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.error_message.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn dlq_retry(queue: &Queue, id: &str) -> Result<()> {
    let job = queue.retry_dead(id).await?;
    println!(
        "{} {} ({})",
        style("requeued").green().bold(),
        job.id,
        job.command
    );
    Ok(())
}

async fn config_get(queue: &Queue, key: &str) -> Result<()> {
    match queue.get_config(key).await? {
        Some(value) => println!("{value}"),
        None => println!("(unset)"),
    }
    Ok(())
}

async fn config_set(queue: &Queue, key: &str, value: &str) -> Result<()> {
    queue.set_config(key, value).await?;
    println!("{} {key} = {value}", style("set").green().bold());
    Ok(())
}

async fn config_list(queue: &Queue) -> Result<()> {
    let config = queue.all_config().await?;
    if config.is_empty() {
        println!("no config set");
        return Ok(());
    }
    for (key, value) in config {
        println!("{key} = {value}");
    }
    Ok(())
}

async fn metrics(queue: &Queue) -> Result<()> {
    let metrics = queue.metrics().await?;
    println!("total completed     {}", metrics.total_completed);
    println!("avg execution time  {:.0} ms", metrics.avg_execution_time_ms);
    println!("success rate        {}%", metrics.success_rate);
    Ok(())
}

async fn dashboard(queue: Queue, port: u16) -> Result<()> {
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        token.cancel();
    });

    println!("dashboard on http://localhost:{port}");
    queuectl::serve_dashboard(Arc::new(queue), port, shutdown).await?;
    Ok(())
}
