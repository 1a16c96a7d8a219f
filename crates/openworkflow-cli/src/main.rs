//! `openworkflow worker start`: boots a [`WorkerPool`] against a configured
//! backend and runs it until SIGINT/SIGTERM.
//!
//! This binary deliberately does not register any workflows itself —
//! workflow implementations are application code that links the
//! `openworkflow` library, builds a [`Client`], and calls
//! `client.registry()` to hand the same registry to a `WorkerPool`. This
//! CLI exists for the minimal, dependency-free boot path: point it at a
//! backend URL and it runs whatever the embedding process has already
//! registered through the shared registry. For a genuinely standalone
//! deployment, a consumer binary embeds `openworkflow` directly rather than
//! shelling out to this one.

mod config;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use openworkflow::backend::{open_sqlite_pool, Backend, InMemoryBackend, PostgresBackend, SqliteBackend};
use openworkflow::registry::WorkflowRegistry;
use openworkflow::worker::{WorkerPool, WorkerPoolConfig};
use parking_lot::RwLock;
use tracing_subscriber::EnvFilter;

use config::WorkerConfig;

#[derive(Parser)]
#[command(name = "openworkflow", about = "Durable workflow engine worker CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a worker pool that claims and executes runs until stopped.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    Start {
        /// Overrides OPENWORKFLOW_CONCURRENCY / openworkflow.toml.
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Worker { command: WorkerCommand::Start { concurrency } } => {
            run_worker(concurrency).await
        }
    }
}

async fn run_worker(concurrency_override: Option<usize>) -> anyhow::Result<()> {
    let config = WorkerConfig::load(concurrency_override)?;
    tracing::info!(
        namespace = %config.namespace,
        concurrency = config.concurrency,
        "booting openworkflow worker"
    );

    let backend = connect_backend(&config.backend_url).await?;
    backend.migrate().await?;

    let registry = Arc::new(RwLock::new(WorkflowRegistry::new()));
    let pool_config = WorkerPoolConfig {
        concurrency: config.concurrency,
        lease_duration_ms: config.lease_duration_ms,
    };
    let pool = WorkerPool::new(backend, registry, config.namespace.clone(), pool_config);

    pool.start().await?;
    tracing::info!("worker pool running, waiting for shutdown signal");

    wait_for_shutdown_signal().await;

    tracing::info!("shutdown signal received, draining in-flight executions");
    pool.stop().await?;
    tracing::info!("worker pool stopped cleanly");

    Ok(())
}

async fn connect_backend(backend_url: &str) -> anyhow::Result<Arc<dyn Backend>> {
    if backend_url.starts_with("postgres://") || backend_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(backend_url)
            .await?;
        let backend = PostgresBackend::new(pool);
        backend.migrate().await?;
        Ok(Arc::new(backend))
    } else if backend_url.starts_with("sqlite:") {
        let pool = open_sqlite_pool(backend_url).await?;
        Ok(Arc::new(SqliteBackend::new(pool)))
    } else if backend_url == "memory" {
        Ok(Arc::new(InMemoryBackend::new()))
    } else {
        anyhow::bail!("unrecognized backend url scheme: {backend_url:?} (expected postgres://, sqlite:, or \"memory\")")
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
