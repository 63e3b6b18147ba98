//! Launch a worker pool bound to one queue, with the demo handlers
//! registered.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration errors, 2 on
//! unrecoverable store/broker failures.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::PgPool;
use taskq::{
    BrokerConfig, CLAIM_GRACE, MemoryBroker, QueueManager, Runner, StoreConfig, TaskRegistry,
    sample_tasks, schema::DEFAULT_TIMEOUT_SECS, setup_database,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Longest per-attempt timeout this process can hand out when nothing
/// is claimed: the crate default or any handler-declared timeout,
/// whichever is larger.
fn longest_declared_timeout(registry: &TaskRegistry<()>) -> Duration {
    registry
        .hints()
        .values()
        .filter_map(|hints| hints.declared_timeout)
        .max()
        .unwrap_or_default()
        .max(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
}

#[derive(Debug, Parser)]
#[command(name = "run_worker", about = "Run task queue workers for a queue")]
struct Args {
    /// Queue to process.
    #[arg(long, default_value = "default")]
    queue: String,

    /// Number of workers running in parallel.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Stop each worker after this many attempts; 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    max_tasks: usize,

    /// Seconds idle workers wait between polls.
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,

    /// Log level: DEBUG, INFO, WARNING or ERROR.
    #[arg(long, default_value = "INFO")]
    log_level: String,
}

fn log_directive(level: &str) -> Option<&'static str> {
    match level.to_uppercase().as_str() {
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARNING" => Some("warn"),
        "ERROR" => Some("error"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let Some(directive) = log_directive(&args.log_level) else {
        eprintln!("invalid log level: {}", args.log_level);
        return ExitCode::from(1);
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();

    if args.workers < 1 {
        error!("--workers must be at least 1");
        return ExitCode::from(1);
    }
    if args.poll_interval == 0 {
        error!("--poll-interval must be greater than zero");
        return ExitCode::from(1);
    }

    let store_config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(config_error) => {
            error!("{config_error}");
            return ExitCode::from(1);
        }
    };
    // Parsed for parity with networked broker backends; the bundled
    // in-memory broker does not use it.
    if let Err(config_error) = BrokerConfig::from_env() {
        error!("{config_error}");
        return ExitCode::from(1);
    }

    let pool = match PgPool::connect(&store_config.database_url()).await {
        Ok(pool) => pool,
        Err(connect_error) => {
            error!("metadata store unavailable: {connect_error}");
            return ExitCode::from(2);
        }
    };
    if let Err(migrate_error) = setup_database(&pool).await {
        error!("metadata store migration failed: {migrate_error}");
        return ExitCode::from(2);
    }

    let mut registry = TaskRegistry::new();
    if let Err(registry_error) = sample_tasks::register_sample_tasks(&mut registry) {
        error!("task registration failed: {registry_error}");
        return ExitCode::from(1);
    }
    let registry = Arc::new(registry);

    let broker = Arc::new(MemoryBroker::new());
    let manager = Arc::new(QueueManager::new(pool, broker).with_registry(&registry));

    let handle = Runner::new(Arc::clone(&manager), Arc::clone(&registry), ())
        .configure_queue(&args.queue, |queue| {
            queue
                .num_workers(args.workers)
                .poll_interval(Duration::from_secs(args.poll_interval))
                .max_tasks(args.max_tasks)
        })
        .start();
    info!(
        queue = %args.queue,
        workers = args.workers,
        "worker pool started"
    );

    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        info!("termination signal received, shutting down…");
        trigger.shutdown();
    });

    // Runs until the signal fires the trigger or the pool stops on its
    // own (attempt limit reached, or a worker failed unrecoverably).
    handle.shutdown_requested().await;

    // Bound the drain on the longest claimed timeout plus grace, not a
    // fixed number: submissions can carry arbitrarily large timeouts.
    let fallback = longest_declared_timeout(&registry);
    let limit = match manager.shutdown_bound(&args.queue, fallback).await {
        Ok(limit) => limit,
        Err(bound_error) => {
            warn!("could not size the shutdown grace from claimed tasks: {bound_error}");
            fallback + CLAIM_GRACE
        }
    };

    match handle.shutdown_with_timeout(limit).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(shutdown_error) => {
            error!("worker pool did not shut down cleanly: {shutdown_error:#}");
            ExitCode::from(2)
        }
    }
}

async fn wait_for_termination_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm() => {}
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending().await
}
