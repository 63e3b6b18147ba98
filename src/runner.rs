use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

use crate::manager::QueueManager;
use crate::registry::TaskRegistry;
use crate::schema::DEFAULT_QUEUE;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// How many poll intervals pass between stale-claim sweeps.
const RECLAIM_EVERY: u32 = 5;

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Configuration for the workers bound to one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    max_tasks: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            max_tasks: 0,
        }
    }
}

impl QueueConfig {
    /// Set the number of workers for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Set how often idle workers poll for new tasks. Also the cadence
    /// of the delayed-promotion sweep.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll sleeps.
    ///
    /// Jitter spreads out polling when many workers watch the same
    /// queue. The applied jitter is uniform in `0..=jitter`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Stop each worker after this many attempts; 0 means unbounded.
    pub fn max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }
}

/// The worker pool supervisor: spawns workers per queue, owns their
/// lifecycle and runs the per-queue maintenance loops.
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    manager: Arc<QueueManager>,
    registry: Arc<TaskRegistry<Context>>,
    context: Context,
    queues: HashMap<String, QueueConfig>,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a runner over a queue manager and a task registry.
    pub fn new(
        manager: Arc<QueueManager>,
        registry: Arc<TaskRegistry<Context>>,
        context: Context,
    ) -> Self {
        Self {
            manager,
            registry,
            context,
            queues: HashMap::new(),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Configure workers for `queue_name`.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(QueueConfig) -> QueueConfig,
    ) -> Runner<Context, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(QueueConfig::default()));

        Runner {
            manager: self.manager,
            registry: self.registry,
            context: self.context,
            queues: self.queues,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Configure workers for the `"default"` queue.
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(QueueConfig) -> QueueConfig,
    ) -> Runner<Context, Configured> {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Stop workers once their queue has no pending tasks left.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the workers and maintenance loops.
    ///
    /// Returns a [`RunHandle`] used to wait for or request shutdown.
    /// The pool also signals its own shutdown once the last worker
    /// stops, or as soon as any worker fails unrecoverably, so
    /// [`RunHandle::shutdown_requested`] observes pool termination.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let host = hostname();
        let pid = std::process::id();

        let total_workers: usize = self.queues.values().map(|config| config.num_workers).sum();
        let active_workers = Arc::new(AtomicUsize::new(total_workers));

        let mut workers = Vec::new();
        let mut maintenance = Vec::new();
        let mut ordinal = 0;

        for (queue_name, config) in &self.queues {
            for _ in 0..config.num_workers {
                let worker_id = format!("{host}:{pid}:{ordinal}");
                ordinal += 1;
                info!(worker.id = %worker_id, queue = %queue_name, "starting worker…");

                let worker = Worker {
                    manager: Arc::clone(&self.manager),
                    registry: Arc::clone(&self.registry),
                    context: self.context.clone(),
                    queue: queue_name.clone(),
                    worker_id: worker_id.clone(),
                    poll_interval: config.poll_interval,
                    jitter: config.jitter,
                    max_tasks: config.max_tasks,
                    stop_when_empty: self.shutdown_when_queue_empty,
                    shutdown: shutdown_rx.clone(),
                };

                let span = info_span!("worker", worker.id = %worker_id);
                let worker_future = worker.run().instrument(span);
                let signal_tx = shutdown_tx.clone();
                let active = Arc::clone(&active_workers);
                workers.push(tokio::spawn(async move {
                    let result = worker_future.await;
                    // A fatal worker takes the pool down; the last
                    // clean exit does too.
                    if result.is_err() || active.fetch_sub(1, Ordering::SeqCst) == 1 {
                        let _ = signal_tx.send(true);
                    }
                    result
                }));
            }

            // One maintenance loop per queue per process.
            let span = info_span!("maintenance", queue = %queue_name);
            maintenance.push(tokio::spawn(
                maintenance_loop(
                    Arc::clone(&self.manager),
                    queue_name.clone(),
                    config.poll_interval,
                    shutdown_rx.clone(),
                )
                .instrument(span),
            ));
        }

        RunHandle {
            shutdown_tx,
            workers,
            maintenance,
        }
    }
}

/// Promote due retries every poll interval; reclaim expired claims and
/// recover broker-lost entries every [`RECLAIM_EVERY`] intervals.
async fn maintenance_loop(
    manager: Arc<QueueManager>,
    queue: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if let Err(sweep_error) = manager.promote_delayed(&queue).await {
                    error!("delayed promotion failed: {sweep_error}");
                }

                ticks += 1;
                if ticks % RECLAIM_EVERY == 0 {
                    if let Err(sweep_error) = manager.reclaim_stale(&queue).await {
                        error!("stale-claim reclaim failed: {sweep_error}");
                    }
                    if let Err(sweep_error) = manager.recover_lost(&queue).await {
                        error!("lost-entry recovery failed: {sweep_error}");
                    }
                }
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<anyhow::Result<()>>>,
    maintenance: Vec<JoinHandle<()>>,
}

/// Requests pool shutdown from outside the handle's owner, e.g. a
/// signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Stop issuing new claims.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl RunHandle {
    /// Stop issuing new claims. In-flight attempts keep running; wait
    /// for them with [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// A cloneable trigger for requesting shutdown elsewhere.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Wait until pool shutdown has been requested, through a trigger
    /// or because the workers stopped on their own. Does not consume
    /// the handle; follow up with
    /// [`shutdown_with_timeout`](Self::shutdown_with_timeout) to drain.
    pub async fn shutdown_requested(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for every worker to stop. Returns the first unrecoverable
    /// worker error, if any.
    pub async fn wait_for_shutdown(self) -> anyhow::Result<()> {
        let mut first_error = None;

        for join_result in join_all(self.workers).await {
            match join_result {
                Ok(Ok(())) => {}
                Ok(Err(worker_error)) => {
                    error!("worker reported an unrecoverable failure: {worker_error:#}");
                    first_error.get_or_insert(worker_error);
                }
                Err(join_error) => {
                    warn!(%join_error, "worker task panicked");
                }
            }
        }

        for handle in self.maintenance {
            handle.abort();
        }

        match first_error {
            None => Ok(()),
            Some(worker_error) => Err(worker_error),
        }
    }

    /// Request shutdown and wait for in-flight attempts to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.wait_for_shutdown().await
    }

    /// Request shutdown and wait at most `limit` for in-flight attempts.
    ///
    /// Attempts still running when the limit elapses are abandoned and
    /// reported as an error; their claims expire and a future reclaim
    /// sweep retries them.
    pub async fn shutdown_with_timeout(self, limit: Duration) -> anyhow::Result<()> {
        self.request_shutdown();
        match tokio::time::timeout(limit, self.wait_for_shutdown()).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!("shutdown grace elapsed, abandoning in-flight attempts");
                Err(anyhow::anyhow!("workers still busy after {limit:?} shutdown grace"))
            }
        }
    }
}
