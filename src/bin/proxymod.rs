//! proxymod CLI: run the receiver and workers, inspect and prune tasks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use proxymod_dispatcher::api::{self, AppState};
use proxymod_dispatcher::config::Config;
use proxymod_dispatcher::db::{Db, PgmqQueue};
use proxymod_dispatcher::error::Error;
use proxymod_dispatcher::model::{State, TaskId};
use proxymod_dispatcher::processor::{CommandProcessor, Processor};
use proxymod_dispatcher::receiver::Receiver;
use proxymod_dispatcher::store::{TaskFilter, TaskStore};
use proxymod_dispatcher::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use proxymod_dispatcher::worker::{Worker, WorkerConfig, WorkerPool};
use secrecy::ExposeSecret;
use tracing::info;

#[derive(Parser)]
#[command(name = "proxymod", about = "Idempotent dispatch of proxy-model receive tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP receiver, optionally with embedded workers
    Serve {
        /// TOML file overriding environment configuration
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Embedded worker loops (0 = receiver only)
        #[arg(long, default_value_t = 0)]
        workers: usize,
    },
    /// Run the worker pool and sweeper only
    Work {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Task inspection
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Delete completed and failed tasks past retention
    Prune {
        /// Overrides RETENTION_DAYS
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Show one task
    Show {
        /// Task ID (UUID)
        id: String,
    },
    /// List tasks, newest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            host,
            port,
            workers,
        } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            cmd_serve(config, workers).await
        }
        Command::Work {
            config,
            concurrency,
        } => cmd_work(load_config(config)?, concurrency).await,
        Command::Task { action } => {
            let config = load_config(None)?;
            let db = connect(&config).await?;
            match action {
                TaskAction::Show { id } => cmd_task_show(&db, &id).await,
                TaskAction::List { state, limit } => cmd_task_list(&db, state, limit).await,
            }
        }
        Command::Prune { older_than_days } => {
            let config = load_config(None)?;
            let db = connect(&config).await?;
            cmd_prune(&db, older_than_days.unwrap_or(config.retention_days)).await
        }
    }
}

fn load_config(file: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = Config::from_env()?;
    Ok(match file {
        Some(path) => config.with_file(&path)?,
        None => config,
    })
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "proxymod-dispatcher".to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret(), config.db_max_connections)
        .await
        .context("task store unreachable")?;
    db.migrate().await?;
    Ok(db)
}

/// The pgmq queue lives on the broker database when one is configured.
async fn open_queue(config: &Config, db: &Db) -> anyhow::Result<PgmqQueue> {
    let broker = match &config.broker_url {
        Some(url) => Db::connect(url.expose_secret(), config.db_max_connections)
            .await
            .context("queue broker unreachable")?,
        None => db.clone(),
    };
    let queue = PgmqQueue::new(broker, config.queue_name.clone());
    queue.create().await.context("cannot create dispatch queue")?;
    Ok(queue)
}

fn processor(config: &Config) -> anyhow::Result<Arc<dyn Processor>> {
    let command = config.processor_command.as_ref().ok_or_else(|| {
        Error::Config("PROCESSOR_COMMAND must be set to run workers".to_string())
    })?;
    Ok(Arc::new(CommandProcessor::new(command)))
}

async fn cmd_serve(config: Config, workers: usize) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;

    let db = connect(&config).await?;
    let queue = Arc::new(open_queue(&config, &db).await?);
    let store: Arc<dyn TaskStore> = Arc::new(db);

    let pool = if workers > 0 {
        let worker = Worker::new(
            Arc::clone(&store),
            queue.clone(),
            processor(&config)?,
            WorkerConfig::from_config(&config),
        );
        Some(WorkerPool::new(Arc::new(worker), workers))
    } else {
        None
    };

    let app = api::router(AppState::new(Receiver::new(store, queue)));
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("cannot bind {}", config.bind_addr()))?;
    info!(addr = %config.bind_addr(), workers, "receiver listening");

    let signal_pool = pool.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        if let Some(pool) = signal_pool {
            pool.shutdown();
        }
    });

    match pool {
        Some(pool) => {
            let (served, worked) = tokio::join!(async { server.await }, pool.run());
            served?;
            worked?;
        }
        None => server.await?,
    }
    Ok(())
}

async fn cmd_work(config: Config, concurrency: usize) -> anyhow::Result<()> {
    let _guard = telemetry(&config)?;

    let db = connect(&config).await?;
    let queue = Arc::new(open_queue(&config, &db).await?);
    let worker = Worker::new(
        Arc::new(db),
        queue,
        processor(&config)?,
        WorkerConfig::from_config(&config),
    );
    let pool = WorkerPool::new(Arc::new(worker), concurrency);

    let signal_pool = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal_pool.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_task_show(db: &Db, id: &str) -> anyhow::Result<()> {
    let id: TaskId = id.parse()?;
    let task = db.get(id).await?;

    println!("ID:          {}", task.id);
    println!("Fingerprint: {}", task.fingerprint);
    println!("State:       {}", task.state);
    println!("Attempts:    {}", task.attempt_count);
    println!("Created:     {}", task.created_at);
    println!("Updated:     {}", task.updated_at);
    if let Some(ref err) = task.last_error {
        println!("Last Error:  {err}");
    }
    println!("Payload:     {}", serde_json::to_string_pretty(&task.payload)?);
    Ok(())
}

async fn cmd_task_list(db: &Db, state: Option<String>, limit: i64) -> anyhow::Result<()> {
    let state: Option<State> = state.map(|s| s.parse()).transpose()?;
    let tasks = db.list(&TaskFilter { state, limit }).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<8}  {:<16}  CREATED",
        "ID", "STATE", "ATTEMPTS", "FINGERPRINT"
    );
    println!("{}", "-".repeat(96));
    for task in &tasks {
        println!(
            "{:<36}  {:<10}  {:<8}  {:<16}  {}",
            task.id,
            task.state,
            task.attempt_count,
            task.fingerprint.short(),
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_prune(db: &Db, older_than_days: u32) -> anyhow::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let purged = db.purge_terminal(cutoff).await?;
    println!("Pruned {purged} task(s) last updated before {}", cutoff.format("%Y-%m-%d %H:%M"));
    Ok(())
}
