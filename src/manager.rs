//! The queue manager: the only component that writes to the metadata
//! store and to the broker.
//!
//! The durable record is always written first and the broker second;
//! the recovery sweeps ([`QueueManager::reclaim_stale`],
//! [`QueueManager::recover_lost`]) bring the broker back into agreement
//! with the store after crashes or partial failures. The store is
//! authoritative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerCounts, BrokerZone};
use crate::clock::{Clock, SystemClock};
use crate::errors::{EnqueueError, QueueError};
use crate::registry::{HandlerHints, TaskRegistry};
use crate::schema::{
    DEFAULT_MAX_RETRIES, DEFAULT_QUEUE, DEFAULT_RETRY_DELAY_SECS, DEFAULT_TIMEOUT_SECS,
    EnqueueSpec, TaskRecord, TaskStatus,
};
use crate::{storage, util};

/// Extra slack on top of a task's timeout before its claim is
/// considered abandoned. Also the slack a graceful shutdown adds on
/// top of the longest in-flight timeout.
pub const CLAIM_GRACE: Duration = Duration::from_secs(30);

/// Ceiling for the exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Stored error messages are bounded to this many bytes.
const ERROR_MESSAGE_LIMIT: usize = 2000;

/// Rows younger than this are skipped by the recovery sweep, so it
/// cannot race an enqueue whose broker push is still in flight.
const RECOVERY_MIN_AGE: Duration = Duration::from_secs(60);

/// Delay before attempt `retry_count + 1`: `base * 2^(retry_count - 1)`,
/// capped at one hour. Deterministic; no jitter.
pub(crate) fn backoff(retry_count: u32, base: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(MAX_BACKOFF)
}

/// Snapshot of one queue, combining broker zone sizes with durable
/// status counts.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// The queue the snapshot describes.
    pub queue_name: String,
    /// Broker zone sizes.
    pub broker: BrokerCounts,
    /// Number of durable records per status.
    pub statuses: Vec<(TaskStatus, i64)>,
}

/// Mediates between the metadata store and the broker, enforcing the
/// lifecycle invariants. Safe to share across workers.
pub struct QueueManager {
    pool: PgPool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    known_tasks: Option<HashMap<String, HandlerHints>>,
}

impl QueueManager {
    /// Create a manager over `pool` and `broker`, using the system
    /// clock.
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        Self {
            pool,
            broker,
            clock: Arc::new(SystemClock),
            known_tasks: None,
        }
    }

    /// Replace the time source. Tests inject a
    /// [`ManualClock`](crate::ManualClock) here.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Teach the manager which tasks this process has registered, so
    /// enqueue can warn about unknown names and apply declared
    /// defaults. Registries may legitimately differ between producer
    /// and worker hosts, so this is a soft check only.
    pub fn with_registry<Context>(mut self, registry: &TaskRegistry<Context>) -> Self {
        self.known_tasks = Some(registry.hints());
        self
    }

    /// The connection pool this manager writes through.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Validate a submission, insert the durable record and push the id
    /// to the broker. Returns the new task id.
    pub async fn enqueue(&self, spec: EnqueueSpec) -> Result<Uuid, EnqueueError> {
        let task_name = spec.task_name.trim().to_string();
        if task_name.is_empty() {
            return Err(EnqueueError::Validation(
                "task_name must not be blank".to_string(),
            ));
        }

        let hints = match self.known_tasks.as_ref() {
            Some(known) => match known.get(&task_name) {
                Some(hints) => Some(*hints),
                None => {
                    warn!(
                        task_name = %task_name,
                        "enqueueing a task this process has not registered"
                    );
                    None
                }
            },
            None => None,
        };
        let hints = hints.unwrap_or_default();

        let timeout = spec
            .timeout
            .or(hints.declared_timeout.map(|t| t.as_secs()))
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(EnqueueError::Validation(
                "timeout must be greater than zero".to_string(),
            ));
        }
        let max_retries = spec
            .max_retries
            .or(hints.declared_max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_delay = spec.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_SECS);

        let now = self.clock.now();
        let record = TaskRecord {
            id: Uuid::new_v4(),
            task_name,
            args: Json(spec.args),
            kwargs: Json(spec.kwargs),
            priority: spec.priority.unwrap_or_default(),
            status: TaskStatus::Pending,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: max_retries.min(i32::MAX as u32) as i32,
            retry_delay: retry_delay.min(i64::MAX as u64) as i64,
            timeout: timeout.min(i64::MAX as u64) as i64,
            queue_name: spec
                .queue_name
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
        };

        storage::insert_task(&self.pool, &record).await?;

        // Durable first, broker second. On push failure the record
        // stays pending and the recovery sweep re-pushes it.
        if let Err(broker_error) = self
            .broker
            .push_pending(
                &record.queue_name,
                record.id,
                record.priority,
                record.execution_timeout(),
            )
            .await
        {
            warn!(
                task_id = %record.id,
                error = %broker_error,
                "broker push failed after durable insert; awaiting recovery sweep"
            );
        }

        info!(
            task_id = %record.id,
            task_name = %record.task_name,
            queue = %record.queue_name,
            priority = %record.priority,
            "task enqueued"
        );
        Ok(record.id)
    }

    /// Claim the highest-priority pending task of `queue` for
    /// `worker_id`. Returns `None` when the queue is empty.
    pub async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let now = self.clock.now();
        let Some(claim) = self
            .broker
            .claim_pending(queue, worker_id, now, CLAIM_GRACE)
            .await?
        else {
            return Ok(None);
        };

        match storage::mark_processing(&self.pool, claim.task_id, worker_id, now).await {
            Ok(Some(record)) => {
                debug!(task_id = %record.id, worker_id, "task claimed");
                Ok(Some(record))
            }
            Ok(None) => {
                // The row is gone or not claimable; the marker must not
                // outlive it.
                self.broker.clear_claim(queue, claim.task_id).await?;
                warn!(
                    task_id = %claim.task_id,
                    "claimed id had no claimable metadata row; dropping broker entry"
                );
                Ok(None)
            }
            Err(db_error) => {
                // Compensation: the entry goes back at its original
                // position.
                self.broker.return_claim(queue, &claim).await?;
                Err(db_error.into())
            }
        }
    }

    /// Record a successful attempt and release the claim.
    pub async fn complete(&self, task: &TaskRecord, result: Value) -> Result<(), QueueError> {
        let now = self.clock.now();
        let committed = storage::mark_success(&self.pool, task.id, Json(result), now).await?;
        self.broker.clear_claim(&task.queue_name, task.id).await?;
        if committed {
            info!(task_id = %task.id, task_name = %task.task_name, "task succeeded");
        } else {
            warn!(task_id = %task.id, "success reported for a task no longer processing");
        }
        Ok(())
    }

    /// Record a failed attempt: schedule a retry with backoff while
    /// budget remains, otherwise fail terminally.
    pub async fn fail(&self, task: &TaskRecord, error_message: &str) -> Result<(), QueueError> {
        let message = util::truncate_error(error_message, ERROR_MESSAGE_LIMIT);
        let attempts_used = task.retry_count + 1;
        let now = self.clock.now();

        if attempts_used > task.max_retries {
            storage::mark_failed(&self.pool, task.id, &message, None, now).await?;
            self.broker.clear_claim(&task.queue_name, task.id).await?;
            error!(
                task_id = %task.id,
                task_name = %task.task_name,
                retry_count = task.retry_count,
                "task failed permanently: {message}"
            );
            return Ok(());
        }

        let retry_count = task.retry_count + 1;
        let delay = backoff(retry_count as u32, task.base_retry_delay());
        let next_retry_at = now + chrono::Duration::seconds(delay.as_secs() as i64);

        storage::mark_retry(
            &self.pool,
            task.id,
            retry_count,
            next_retry_at,
            Some(&message),
            now,
        )
        .await?;
        self.broker.clear_claim(&task.queue_name, task.id).await?;
        self.broker
            .push_delayed(
                &task.queue_name,
                task.id,
                task.priority,
                task.execution_timeout(),
                next_retry_at,
            )
            .await?;

        warn!(
            task_id = %task.id,
            task_name = %task.task_name,
            retry_count,
            max_retries = task.max_retries,
            next_retry_at = %next_retry_at,
            "task attempt failed, retry scheduled: {message}"
        );
        Ok(())
    }

    /// Fail a task without consulting the retry budget. Used for
    /// non-retryable failures such as an unknown task name; the stored
    /// `retry_count` is forced to `max_retries`.
    pub async fn fail_permanently(
        &self,
        task: &TaskRecord,
        error_message: &str,
    ) -> Result<(), QueueError> {
        let message = util::truncate_error(error_message, ERROR_MESSAGE_LIMIT);
        let now = self.clock.now();
        storage::mark_failed(&self.pool, task.id, &message, Some(task.max_retries), now).await?;
        self.broker.clear_claim(&task.queue_name, task.id).await?;
        error!(
            task_id = %task.id,
            task_name = %task.task_name,
            "task failed permanently (non-retryable): {message}"
        );
        Ok(())
    }

    /// Push a currently-claimed task back to the delayed set, due after
    /// `delay`, without consuming an attempt.
    pub async fn reschedule(&self, task: &TaskRecord, delay: Duration) -> Result<(), QueueError> {
        let now = self.clock.now();
        let ready_at = now + chrono::Duration::seconds(delay.as_secs().min(i64::MAX as u64) as i64);

        storage::mark_retry(&self.pool, task.id, task.retry_count, ready_at, None, now).await?;
        self.broker.clear_claim(&task.queue_name, task.id).await?;
        self.broker
            .push_delayed(
                &task.queue_name,
                task.id,
                task.priority,
                task.execution_timeout(),
                ready_at,
            )
            .await?;

        info!(task_id = %task.id, ready_at = %ready_at, "task rescheduled");
        Ok(())
    }

    /// Move every due delayed entry of `queue` back to the pending
    /// list. Idempotent under concurrent callers: the broker pop
    /// removes each entry once and the store flip is conditional.
    /// Returns the number of promoted tasks.
    pub async fn promote_delayed(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let due = self.broker.pop_due_delayed(queue, now).await?;

        let mut promoted = 0;
        for entry in due {
            if storage::promote_to_pending(&self.pool, entry.task_id, now).await? {
                self.broker
                    .push_pending(queue, entry.task_id, entry.priority, entry.timeout)
                    .await?;
                promoted += 1;
            } else {
                // No retry row behind the entry; recover_lost will
                // re-push if the store still wants it queued.
                warn!(task_id = %entry.task_id, "dropping delayed entry without a retry row");
            }
        }

        if promoted > 0 {
            debug!(queue, promoted, "promoted delayed tasks");
        }
        Ok(promoted)
    }

    /// Treat every expired claim of `queue` as a crashed worker and
    /// route the task through the failure path. Returns the number of
    /// reclaimed tasks.
    pub async fn reclaim_stale(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let expired = self.broker.reap_expired(queue, now).await?;

        let mut reclaimed = 0;
        for claim in expired {
            match storage::find_task(&self.pool, claim.task_id).await? {
                Some(task) if task.status == TaskStatus::Processing => {
                    warn!(
                        task_id = %task.id,
                        worker_id = %claim.worker_id,
                        "reclaiming task from expired claim"
                    );
                    self.fail(&task, &format!("claim expired (worker {})", claim.worker_id))
                        .await?;
                    reclaimed += 1;
                }
                Some(task) => {
                    debug!(
                        task_id = %task.id,
                        status = %task.status,
                        "expired claim for a task that already moved on"
                    );
                }
                None => {
                    warn!(task_id = %claim.task_id, "expired claim without a metadata row");
                }
            }
        }
        Ok(reclaimed)
    }

    /// Re-push pending/retry rows the broker no longer references.
    /// Covers enqueues whose broker push failed and volatile-broker
    /// restarts. Returns the number of restored entries.
    pub async fn recover_lost(&self, queue: &str) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::seconds(RECOVERY_MIN_AGE.as_secs() as i64);
        let rows = storage::recoverable_tasks(&self.pool, queue, cutoff).await?;

        let mut restored = 0;
        for row in rows {
            if self.broker.locate(queue, row.id).await?.is_some() {
                continue;
            }
            let timeout = Duration::from_secs(row.timeout.max(0) as u64);
            match row.status {
                TaskStatus::Pending => {
                    self.broker
                        .push_pending(queue, row.id, row.priority, timeout)
                        .await?;
                    restored += 1;
                }
                TaskStatus::Retry => {
                    let ready_at = row.next_retry_at.unwrap_or(now);
                    self.broker
                        .push_delayed(queue, row.id, row.priority, timeout, ready_at)
                        .await?;
                    restored += 1;
                }
                _ => {}
            }
        }

        if restored > 0 {
            info!(queue, restored, "re-pushed tasks the broker had lost");
        }
        Ok(restored)
    }

    /// How long a graceful shutdown of `queue` may need: the largest
    /// per-attempt timeout among currently claimed tasks (or
    /// `fallback` when nothing is claimed), plus [`CLAIM_GRACE`].
    pub async fn shutdown_bound(
        &self,
        queue: &str,
        fallback: Duration,
    ) -> Result<Duration, QueueError> {
        let longest = storage::max_processing_timeout(&self.pool, queue)
            .await?
            .map(|timeout| Duration::from_secs(timeout.max(0) as u64))
            .unwrap_or(fallback);
        Ok(longest + CLAIM_GRACE)
    }

    /// Combined broker and store statistics for `queue`.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let broker = self.broker.counts(queue).await?;
        let statuses = storage::status_counts(&self.pool, queue).await?;
        Ok(QueueStats {
            queue_name: queue.to_string(),
            broker,
            statuses,
        })
    }

    /// Which broker zone currently references `task_id`, if any.
    pub async fn locate(
        &self,
        queue: &str,
        task_id: Uuid,
    ) -> Result<Option<BrokerZone>, QueueError> {
        Ok(self.broker.locate(queue, task_id).await?)
    }
}
