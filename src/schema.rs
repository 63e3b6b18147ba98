//! Durable record and wire payload types for the task queue.
//!
//! [`TaskRecord`] maps one-to-one onto a row of the `tasks` table and is
//! the authoritative representation of a task's lifecycle. [`EnqueueSpec`]
//! is the payload shape accepted from producers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sqlx::FromRow;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::types::Json;
use uuid::Uuid;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Default retry budget for a task submission.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between retries, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

/// Default per-attempt execution bound, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Lifecycle state of a task.
///
/// Tasks move `pending → processing → success | failed`, with `retry` as
/// the re-entry branch for failed attempts that still have budget left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the broker's pending list.
    Pending,
    /// Claimed by a worker; an attempt is running.
    Processing,
    /// Terminal: the handler returned a value.
    Success,
    /// Terminal: retries exhausted or the task was non-retryable.
    Failed,
    /// Waiting in the delayed set for its next attempt.
    Retry,
}

impl TaskStatus {
    /// The lowercase name stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
        }
    }

    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "retry" => Ok(TaskStatus::Retry),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Scheduling priority of a task. Lower numeric value wins.
///
/// Submissions accept either the string form (`"high"`, `"normal"`,
/// `"low"`) or the numeric form; serialization always produces the
/// numeric form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Drained before everything else.
    High,
    /// The default band.
    #[default]
    Normal,
    /// Drained last.
    Low,
}

impl TaskPriority {
    /// The numeric rank stored in the database and on the wire.
    pub fn as_i16(self) -> i16 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 2,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            other => Err(format!("invalid task priority: {other}")),
        }
    }
}

impl TryFrom<i16> for TaskPriority {
    type Error = String;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskPriority::High),
            1 => Ok(TaskPriority::Normal),
            2 => Ok(TaskPriority::Low),
            other => Err(format!("invalid task priority value: {other}")),
        }
    }
}

impl Serialize for TaskPriority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.as_i16())
    }
}

impl<'de> Deserialize<'de> for TaskPriority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PriorityVisitor;

        impl Visitor<'_> for PriorityVisitor {
            type Value = TaskPriority;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"high\", \"normal\", \"low\" or 0..=2")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                i16::try_from(v)
                    .map_err(|_| format!("invalid task priority value: {v}"))
                    .and_then(TaskPriority::try_from)
                    .map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                self.visit_i64(i64::try_from(v).map_err(E::custom)?)
            }
        }

        deserializer.deserialize_any(PriorityVisitor)
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskPriority {
    fn type_info() -> PgTypeInfo {
        <i16 as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <i16 as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskPriority {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <i16 as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
        TaskPriority::try_from(raw).map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskPriority {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <i16 as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_i16(), buf)
    }
}

/// One durable task record, mapping onto a row of the `tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskRecord {
    /// Globally unique task id.
    pub id: Uuid,
    /// Name resolved through the registry at execution time.
    pub task_name: String,
    /// Positional arguments, passed to the handler untouched.
    pub args: Json<Vec<Value>>,
    /// Keyword arguments, passed to the handler untouched.
    pub kwargs: Json<Map<String, Value>>,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Handler return value; present only on success.
    pub result: Option<Json<Value>>,
    /// Message from the most recent failed attempt.
    pub error_message: Option<String>,
    /// Number of completed attempts that failed.
    pub retry_count: i32,
    /// Inclusive retry cap; a task gets `max_retries + 1` attempts.
    pub max_retries: i32,
    /// Base backoff delay in seconds.
    pub retry_delay: i64,
    /// Per-attempt execution bound in seconds.
    pub timeout: i64,
    /// Routing key.
    pub queue_name: String,
    /// Worker currently holding (or last holding) the task.
    pub worker_id: Option<String>,
    /// Set at enqueue.
    pub created_at: DateTime<Utc>,
    /// Set on every state change.
    pub updated_at: DateTime<Utc>,
    /// Set when first transitioned to processing.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while in retry; when the next attempt becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// The per-attempt wall-clock bound.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(0) as u64)
    }

    /// The base delay fed into the backoff calculation.
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay.max(0) as u64)
    }

    /// Whether a failing attempt would still leave retry budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A task submission, matching the producer payload shape.
///
/// Optional fields fall back to the registered handler's declared
/// defaults (when the submitting process knows the task) and then to the
/// crate-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueSpec {
    /// Name of the task to execute.
    pub task_name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Scheduling priority; defaults to normal.
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Retry cap; defaults to 3.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Base backoff delay in seconds; defaults to 60.
    #[serde(default)]
    pub retry_delay: Option<u64>,
    /// Per-attempt execution bound in seconds; defaults to 300.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Target queue; defaults to `"default"`.
    #[serde(default)]
    pub queue_name: Option<String>,
}

impl EnqueueSpec {
    /// Create a submission for `task_name` with empty arguments and all
    /// defaults.
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: None,
            max_retries: None,
            retry_delay: None,
            timeout: None,
            queue_name: None,
        }
    }

    /// Set the positional arguments.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Set the keyword arguments.
    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Set the scheduling priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the retry cap.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the base backoff delay, in seconds.
    pub fn retry_delay(mut self, retry_delay: u64) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    /// Set the per-attempt execution bound, in seconds.
    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the target queue.
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use serde_json::json;

    #[test]
    fn priority_deserializes_from_string_and_number() {
        let high: TaskPriority = serde_json::from_value(json!("high")).unwrap();
        assert_eq!(high, TaskPriority::High);

        let low: TaskPriority = serde_json::from_value(json!(2)).unwrap();
        assert_eq!(low, TaskPriority::Low);

        assert_err!(serde_json::from_value::<TaskPriority>(json!("urgent")));
        assert_err!(serde_json::from_value::<TaskPriority>(json!(7)));
    }

    #[test]
    fn priority_serializes_as_number() {
        assert_eq!(serde_json::to_value(TaskPriority::High).unwrap(), json!(0));
        assert_eq!(serde_json::to_value(TaskPriority::Normal).unwrap(), json!(1));
        assert_eq!(serde_json::to_value(TaskPriority::Low).unwrap(), json!(2));
    }

    #[test]
    fn priority_orders_high_before_low() {
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Low);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Retry,
        ] {
            assert_eq!(assert_ok!(status.as_str().parse::<TaskStatus>()), status);
        }
        assert_err!("cancelled".parse::<TaskStatus>());
    }

    #[test]
    fn enqueue_spec_accepts_minimal_payload() {
        let spec: EnqueueSpec =
            serde_json::from_value(json!({ "task_name": "add_numbers" })).unwrap();
        assert_eq!(spec.task_name, "add_numbers");
        assert!(spec.args.is_empty());
        assert!(spec.kwargs.is_empty());
        assert_eq!(spec.priority, None);
        assert_eq!(spec.max_retries, None);
    }

    #[test]
    fn enqueue_spec_accepts_string_priority() {
        let spec: EnqueueSpec = serde_json::from_value(json!({
            "task_name": "add_numbers",
            "args": [2, 3],
            "priority": "high",
            "max_retries": 0,
        }))
        .unwrap();
        assert_eq!(spec.priority, Some(TaskPriority::High));
        assert_eq!(spec.args, vec![json!(2), json!(3)]);
        assert_eq!(spec.max_retries, Some(0));
    }
}
