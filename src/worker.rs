use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::errors::QueueError;
use crate::manager::QueueManager;
use crate::registry::TaskRegistry;
use crate::schema::TaskRecord;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};

/// After this many consecutive store/broker failures the worker gives
/// up and reports an unrecoverable error.
const MAX_CONSECUTIVE_INFRA_ERRORS: u32 = 5;

pub(crate) struct Worker<Context> {
    pub(crate) manager: Arc<QueueManager>,
    pub(crate) registry: Arc<TaskRegistry<Context>>,
    pub(crate) context: Context,
    pub(crate) queue: String,
    pub(crate) worker_id: String,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) max_tasks: usize,
    pub(crate) stop_when_empty: bool,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and run tasks until shutdown, the attempt limit, or an
    /// unrecoverable infrastructure failure.
    ///
    /// A worker holds at most one claim at a time; shutdown is only
    /// honoured between attempts, never mid-execution.
    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        let mut processed: usize = 0;
        let mut infra_errors: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if self.max_tasks > 0 && processed >= self.max_tasks {
                info!(max_tasks = self.max_tasks, "worker reached its attempt limit");
                break;
            }

            trace!("looking for the next task…");
            match self.manager.claim_next(&self.queue, &self.worker_id).await {
                Ok(Some(task)) => {
                    processed += 1;
                    match self.run_task(task).await {
                        Ok(()) => infra_errors = 0,
                        Err(infra_error) => {
                            // The task state is untouched; the claim
                            // will expire and the sweep retries it.
                            infra_errors += 1;
                            error!("failed to record task outcome: {infra_error}");
                            if infra_errors >= MAX_CONSECUTIVE_INFRA_ERRORS {
                                return Err(anyhow!(infra_error)
                                    .context("repeated store/broker failures"));
                            }
                            self.idle_sleep().await;
                        }
                    }
                }
                Ok(None) if self.stop_when_empty => {
                    debug!("no pending tasks found, shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    infra_errors = 0;
                    self.idle_sleep().await;
                }
                Err(infra_error) => {
                    infra_errors += 1;
                    error!("failed to claim next task: {infra_error}");
                    if infra_errors >= MAX_CONSECUTIVE_INFRA_ERRORS {
                        return Err(
                            anyhow!(infra_error).context("repeated store/broker failures")
                        );
                    }
                    self.idle_sleep().await;
                }
            }
        }

        info!(processed, "worker stopped");
        Ok(())
    }

    /// Run one claimed task: resolve the handler, execute it under the
    /// task's timeout with panic capture, and report the outcome.
    async fn run_task(&self, task: TaskRecord) -> Result<(), QueueError> {
        let span = info_span!("task", task.id = %task.id, task.name = %task.task_name);

        let handler = match self.registry.resolve(&task.task_name) {
            Ok(handler) => handler.clone(),
            Err(registry_error) => {
                // Non-retryable: the name will not resolve on the next
                // attempt either.
                let _enter = span.enter();
                return self
                    .manager
                    .fail_permanently(&task, &registry_error.to_string())
                    .await;
            }
        };

        let context = self.context.clone();
        let args = task.args.0.clone();
        let kwargs = task.kwargs.0.clone();
        let task_name = task.task_name.clone();

        debug!(parent: &span, "running task…");

        let attempt = with_sentry_transaction(&task_name, async || {
            AssertUnwindSafe(handler.call(context, args, kwargs))
                .catch_unwind()
                .await
                .map_err(|panic_info| try_to_extract_panic_info(&*panic_info))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        });

        let outcome = tokio::time::timeout(task.execution_timeout(), attempt)
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let _enter = span.enter();
        match outcome {
            Ok(Ok(value)) => self.manager.complete(&task, value).await,
            Ok(Err(handler_error)) => {
                warn!("task attempt failed: {handler_error:#}");
                self.manager.fail(&task, &format!("{handler_error:#}")).await
            }
            Err(_elapsed) => {
                // The attempt future is dropped here, which cancels
                // cooperative handlers; the worker does not wait for
                // uncooperative ones.
                warn!(timeout = task.timeout, "task attempt timed out");
                self.manager.fail(&task, "timeout").await
            }
        }
    }

    /// Sleep one poll interval, waking early on shutdown.
    async fn idle_sleep(&mut self) {
        let sleep_duration = self.sleep_duration_with_jitter();
        tokio::select! {
            _ = self.shutdown.changed() => {}
            _ = sleep(sleep_duration) => {}
        }
    }
}
