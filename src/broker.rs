//! Broker protocol and the bundled in-memory implementation.
//!
//! The broker holds only task ids and small scheduling hints, never the
//! durable record. Per queue it keeps a priority-ordered pending list, a
//! time-indexed delayed set and one in-flight marker per claimed task; a
//! task id lives in at most one of the three zones at a time.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::BrokerError;
use crate::schema::TaskPriority;

/// The zone of a queue that currently references a task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerZone {
    /// Waiting to be claimed.
    Pending,
    /// Scheduled for a later attempt.
    Delayed,
    /// Claimed by a worker.
    Inflight,
}

/// An in-flight marker: proof that a worker holds a task.
///
/// Expiry of the claim deadline is what drives crash recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// The claimed task.
    pub task_id: Uuid,
    /// Priority the task was queued with.
    pub priority: TaskPriority,
    /// Position in the FIFO tie-break order; used to restore the entry
    /// on compensation.
    pub seq: u64,
    /// The task's per-attempt execution bound.
    pub timeout: Duration,
    /// The worker holding the claim.
    pub worker_id: String,
    /// When the claim is considered abandoned.
    pub claim_deadline: DateTime<Utc>,
}

/// An entry removed from the delayed set because its time has come.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEntry {
    /// The delayed task.
    pub task_id: Uuid,
    /// Priority to restore the task at.
    pub priority: TaskPriority,
    /// The task's per-attempt execution bound.
    pub timeout: Duration,
    /// When the entry became due.
    pub ready_at: DateTime<Utc>,
}

/// Zone sizes for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BrokerCounts {
    /// Entries waiting to be claimed.
    pub pending: usize,
    /// Entries scheduled for a later attempt.
    pub delayed: usize,
    /// Active claims.
    pub inflight: usize,
}

/// The operations the engine needs from a broker backend.
///
/// [`claim_pending`](Broker::claim_pending) must pop the
/// highest-priority entry and create the in-flight marker as one atomic
/// step; it is the sole synchronization point for claim races.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Append a task to the pending list of `queue`. FIFO within a
    /// priority band.
    async fn push_pending(
        &self,
        queue: &str,
        task_id: Uuid,
        priority: TaskPriority,
        timeout: Duration,
    ) -> Result<(), BrokerError>;

    /// Atomically pop the highest-priority pending entry and mark it
    /// in-flight for `worker_id` with deadline `now + timeout + grace`.
    async fn claim_pending(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Option<Claim>, BrokerError>;

    /// Compensation for a failed metadata transition: drop the in-flight
    /// marker and restore the entry at its original position.
    async fn return_claim(&self, queue: &str, claim: &Claim) -> Result<(), BrokerError>;

    /// Drop the in-flight marker for `task_id`, if any.
    async fn clear_claim(&self, queue: &str, task_id: Uuid) -> Result<(), BrokerError>;

    /// Add a task to the delayed set, due at `ready_at`.
    async fn push_delayed(
        &self,
        queue: &str,
        task_id: Uuid,
        priority: TaskPriority,
        timeout: Duration,
        ready_at: DateTime<Utc>,
    ) -> Result<(), BrokerError>;

    /// Remove and return every delayed entry with `ready_at <= now`.
    async fn pop_due_delayed(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelayedEntry>, BrokerError>;

    /// Remove and return every in-flight marker whose deadline has
    /// passed.
    async fn reap_expired(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>, BrokerError>;

    /// Which zone, if any, currently references `task_id`.
    async fn locate(&self, queue: &str, task_id: Uuid) -> Result<Option<BrokerZone>, BrokerError>;

    /// Zone sizes for `queue`.
    async fn counts(&self, queue: &str) -> Result<BrokerCounts, BrokerError>;
}

/// Pending entries order by (priority rank, enqueue sequence).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PendingEntry {
    rank: i16,
    seq: u64,
    task_id: Uuid,
    timeout_secs: u64,
}

/// Delayed entries order by (ready time, enqueue sequence).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedItem {
    ready_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
    rank: i16,
    timeout_secs: u64,
}

#[derive(Debug, Default)]
struct QueueZones {
    pending: BTreeSet<PendingEntry>,
    delayed: BTreeSet<DelayedItem>,
    inflight: HashMap<Uuid, Claim>,
}

/// In-process broker backed by ordered sets behind a mutex.
///
/// Fast and dependency-free, but volatile: the recovery sweep rebuilds
/// its contents from the metadata store after a restart.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueZones>>,
    seq: AtomicU64,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_pending(
        &self,
        queue: &str,
        task_id: Uuid,
        priority: TaskPriority,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let seq = self.next_seq();
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let zones = queues.entry(queue.to_string()).or_default();
        zones.pending.insert(PendingEntry {
            rank: priority.as_i16(),
            seq,
            task_id,
            timeout_secs: timeout.as_secs(),
        });
        Ok(())
    }

    async fn claim_pending(
        &self,
        queue: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Option<Claim>, BrokerError> {
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let Some(zones) = queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(entry) = zones.pending.pop_first() {
            // A duplicate push (recovery racing enqueue) can leave two
            // entries for one id; the claim already held wins.
            if zones.inflight.contains_key(&entry.task_id) {
                continue;
            }

            let deadline_secs = (entry.timeout_secs + grace.as_secs()).min(i64::MAX as u64);
            let claim = Claim {
                task_id: entry.task_id,
                priority: TaskPriority::try_from(entry.rank)
                    .map_err(BrokerError::Unavailable)?,
                seq: entry.seq,
                timeout: Duration::from_secs(entry.timeout_secs),
                worker_id: worker_id.to_string(),
                claim_deadline: now + chrono::Duration::seconds(deadline_secs as i64),
            };
            zones.inflight.insert(entry.task_id, claim.clone());
            return Ok(Some(claim));
        }

        Ok(None)
    }

    async fn return_claim(&self, queue: &str, claim: &Claim) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let zones = queues.entry(queue.to_string()).or_default();
        zones.inflight.remove(&claim.task_id);
        zones.pending.insert(PendingEntry {
            rank: claim.priority.as_i16(),
            seq: claim.seq,
            task_id: claim.task_id,
            timeout_secs: claim.timeout.as_secs(),
        });
        Ok(())
    }

    async fn clear_claim(&self, queue: &str, task_id: Uuid) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().expect("broker state poisoned");
        if let Some(zones) = queues.get_mut(queue) {
            zones.inflight.remove(&task_id);
        }
        Ok(())
    }

    async fn push_delayed(
        &self,
        queue: &str,
        task_id: Uuid,
        priority: TaskPriority,
        timeout: Duration,
        ready_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let seq = self.next_seq();
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let zones = queues.entry(queue.to_string()).or_default();
        zones.delayed.insert(DelayedItem {
            ready_at,
            seq,
            task_id,
            rank: priority.as_i16(),
            timeout_secs: timeout.as_secs(),
        });
        Ok(())
    }

    async fn pop_due_delayed(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<DelayedEntry>, BrokerError> {
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let Some(zones) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut due = Vec::new();
        while zones
            .delayed
            .first()
            .is_some_and(|item| item.ready_at <= now)
        {
            if let Some(item) = zones.delayed.pop_first() {
                due.push(DelayedEntry {
                    task_id: item.task_id,
                    priority: TaskPriority::try_from(item.rank)
                        .map_err(BrokerError::Unavailable)?,
                    timeout: Duration::from_secs(item.timeout_secs),
                    ready_at: item.ready_at,
                });
            }
        }
        Ok(due)
    }

    async fn reap_expired(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>, BrokerError> {
        let mut queues = self.queues.lock().expect("broker state poisoned");
        let Some(zones) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let expired_ids: Vec<Uuid> = zones
            .inflight
            .iter()
            .filter(|(_, claim)| claim.claim_deadline < now)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(claim) = zones.inflight.remove(&id) {
                expired.push(claim);
            }
        }
        Ok(expired)
    }

    async fn locate(&self, queue: &str, task_id: Uuid) -> Result<Option<BrokerZone>, BrokerError> {
        let queues = self.queues.lock().expect("broker state poisoned");
        let Some(zones) = queues.get(queue) else {
            return Ok(None);
        };

        if zones.inflight.contains_key(&task_id) {
            return Ok(Some(BrokerZone::Inflight));
        }
        if zones.pending.iter().any(|entry| entry.task_id == task_id) {
            return Ok(Some(BrokerZone::Pending));
        }
        if zones.delayed.iter().any(|item| item.task_id == task_id) {
            return Ok(Some(BrokerZone::Delayed));
        }
        Ok(None)
    }

    async fn counts(&self, queue: &str) -> Result<BrokerCounts, BrokerError> {
        let queues = self.queues.lock().expect("broker state poisoned");
        let counts = queues
            .get(queue)
            .map(|zones| BrokerCounts {
                pending: zones.pending.len(),
                delayed: zones.delayed.len(),
                inflight: zones.inflight.len(),
            })
            .unwrap_or_default();
        Ok(counts)
    }
}
