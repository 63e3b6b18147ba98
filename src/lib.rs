#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod broker;
mod clock;
mod config;
mod errors;
mod manager;
mod registry;
mod runner;
/// Demo task handlers.
pub mod sample_tasks;
/// Durable record and wire payload types.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The broker protocol and its bundled in-memory implementation.
pub use self::broker::{Broker, BrokerCounts, BrokerZone, Claim, DelayedEntry, MemoryBroker};
/// Time source abstraction used by every engine component.
pub use self::clock::{Clock, ManualClock, SystemClock};
/// Environment configuration.
pub use self::config::{BrokerConfig, ConfigError, StoreConfig};
/// Typed errors per failure class.
pub use self::errors::{BrokerError, EnqueueError, QueueError, RegistryError};
/// The component every state transition funnels through.
pub use self::manager::{CLAIM_GRACE, QueueManager, QueueStats};
/// The task registry and handler descriptors.
pub use self::registry::{Handler, HandlerHints, TaskArgs, TaskKwargs, TaskRegistry};
/// The worker pool supervisor.
pub use self::runner::{
    Configured, QueueConfig, RunHandle, Runner, ShutdownTrigger, Unconfigured,
};
/// The most commonly used payload types.
pub use self::schema::{DEFAULT_QUEUE, EnqueueSpec, TaskPriority, TaskRecord, TaskStatus};
/// Read-side storage helpers for operational tooling.
pub use self::storage::{find_task, list_tasks, setup_database, status_counts};
