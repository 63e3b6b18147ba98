#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use claims::{assert_none, assert_some};
use serde_json::{Value, json};
use sqlx::PgPool;
use taskq::{
    EnqueueSpec, Handler, MemoryBroker, QueueManager, Runner, TaskPriority, TaskRecord,
    TaskRegistry, TaskStatus, find_task, list_tasks, setup_database,
};
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// One worker, fast polls, no jitter.
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        manager: Arc<QueueManager>,
        registry: Arc<TaskRegistry<Context>>,
        context: Context,
    ) -> Runner<Context, taskq::Configured> {
        Runner::new(manager, registry, context).configure_default_queue(|queue| {
            queue
                .num_workers(1)
                .poll_interval(Duration::from_millis(50))
                .jitter(Duration::ZERO)
        })
    }

    /// Poll the store until the task reaches `status`, or panic.
    pub(super) async fn wait_for_status(
        pool: &PgPool,
        task_id: Uuid,
        status: TaskStatus,
        max_wait: Duration,
    ) -> TaskRecord {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(record) = find_task(pool, task_id).await.unwrap() {
                if record.status == status {
                    return record;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task {task_id} did not reach {status} within {max_wait:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn manager_for(pool: &PgPool) -> Arc<QueueManager> {
    Arc::new(QueueManager::new(
        pool.clone(),
        Arc::new(MemoryBroker::new()),
    ))
}

#[tokio::test]
async fn happy_path_runs_a_task_to_success() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "add_numbers",
        Handler::new(|_ctx: (), args, _kwargs| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }),
    )?;

    let task_id = manager
        .enqueue(
            EnqueueSpec::new("add_numbers")
                .args(vec![json!(2), json!(3)])
                .max_retries(0),
        )
        .await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ())
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await?;

    let record = assert_some!(find_task(&pool, task_id).await?);
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.result.as_ref().map(|r| &r.0), Some(&json!(5)));
    assert_eq!(record.retry_count, 0);
    assert_none!(record.error_message);
    assert!(assert_some!(record.started_at) <= assert_some!(record.completed_at));
    assert_some!(record.worker_id);
    Ok(())
}

#[tokio::test]
async fn flaky_task_retries_and_then_succeeds() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let remaining_failures = Arc::new(AtomicU32::new(1));
    let mut registry = TaskRegistry::new();
    let counter = Arc::clone(&remaining_failures);
    registry.register(
        "flaky",
        Handler::new(move |_ctx: (), _args, _kwargs| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
                {
                    anyhow::bail!("first attempt fails");
                }
                Ok(json!("recovered"))
            }
        }),
    )?;

    let task_id = manager
        .enqueue(EnqueueSpec::new("flaky").max_retries(2).retry_delay(1))
        .await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ());
    let handle = runner.start();

    let record =
        test_utils::wait_for_status(&pool, task_id, TaskStatus::Success, Duration::from_secs(15))
            .await;
    handle.shutdown().await?;

    assert_eq!(record.retry_count, 1);
    // The message from the failed first attempt is preserved.
    assert_eq!(record.error_message.as_deref(), Some("first attempt fails"));
    assert_eq!(record.result.as_ref().map(|r| &r.0), Some(&json!("recovered")));
    Ok(())
}

#[tokio::test]
async fn retries_exhaust_into_a_terminal_failure() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "always_fail",
        Handler::new(|_ctx: (), _args, _kwargs| async move { Err(anyhow::anyhow!("boom")) }),
    )?;

    let task_id = manager
        .enqueue(EnqueueSpec::new("always_fail").max_retries(2).retry_delay(0))
        .await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ());
    let handle = runner.start();

    let record =
        test_utils::wait_for_status(&pool, task_id, TaskStatus::Failed, Duration::from_secs(15))
            .await;
    handle.shutdown().await?;

    assert_eq!(record.retry_count, 2);
    assert_eq!(record.error_message.as_deref(), Some("boom"));
    assert_some!(record.completed_at);
    Ok(())
}

#[tokio::test]
async fn unknown_task_fails_without_retries() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "known",
        Handler::new(|_ctx: (), _args, _kwargs| async move { Ok(Value::Null) }),
    )?;

    let task_id = manager.enqueue(EnqueueSpec::new("nope")).await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ())
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await?;

    let record = assert_some!(find_task(&pool, task_id).await?);
    assert_eq!(record.status, TaskStatus::Failed);
    // Non-retryable: the whole budget is consumed at once.
    assert_eq!(record.retry_count, record.max_retries);
    let message = assert_some!(record.error_message.clone());
    assert!(message.contains("unknown task"), "got: {message}");
    Ok(())
}

#[tokio::test]
async fn high_priority_task_runs_before_queued_normals() -> anyhow::Result<()> {
    type SeenTasks = Arc<std::sync::Mutex<Vec<String>>>;

    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let seen: SeenTasks = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    registry.register(
        "label",
        Handler::new(|ctx: SeenTasks, args, _kwargs| async move {
            let label = args[0].as_str().unwrap_or("?").to_string();
            ctx.lock().unwrap().push(label);
            Ok(Value::Null)
        }),
    )?;

    for index in 1..=5 {
        manager
            .enqueue(EnqueueSpec::new("label").args(vec![json!(format!("normal-{index}"))]))
            .await?;
    }
    manager
        .enqueue(
            EnqueueSpec::new("label")
                .args(vec![json!("rush")])
                .priority(TaskPriority::High),
        )
        .await?;

    let runner = test_utils::create_test_runner(
        Arc::clone(&manager),
        Arc::new(registry),
        Arc::clone(&seen),
    )
    .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await?;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert_eq!(seen[0], "rush", "processed order: {seen:?}");
    Ok(())
}

#[tokio::test]
async fn timed_out_attempts_are_failed_with_the_fixed_message() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "sleepy",
        Handler::new(|_ctx: (), _args, _kwargs| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }),
    )?;

    let task_id = manager
        .enqueue(EnqueueSpec::new("sleepy").timeout(1).max_retries(0))
        .await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ());
    let handle = runner.start();

    let record =
        test_utils::wait_for_status(&pool, task_id, TaskStatus::Failed, Duration::from_secs(15))
            .await;
    handle.shutdown().await?;

    assert_eq!(record.error_message.as_deref(), Some("timeout"));
    Ok(())
}

#[tokio::test]
async fn panicking_handler_counts_as_a_failed_attempt() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "panicky",
        Handler::new(|_ctx: (), _args, _kwargs| async move { panic!("handler exploded") }),
    )?;

    let task_id = manager
        .enqueue(EnqueueSpec::new("panicky").max_retries(1).retry_delay(0))
        .await?;

    let runner = test_utils::create_test_runner(Arc::clone(&manager), Arc::new(registry), ());
    let handle = runner.start();

    let record =
        test_utils::wait_for_status(&pool, task_id, TaskStatus::Failed, Duration::from_secs(15))
            .await;
    handle.shutdown().await?;

    assert_eq!(record.retry_count, 1);
    let message = assert_some!(record.error_message.clone());
    assert!(message.contains("task panicked"), "got: {message}");
    assert!(message.contains("handler exploded"), "got: {message}");
    Ok(())
}

#[tokio::test]
async fn max_tasks_bounds_a_workers_attempts() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let mut registry = TaskRegistry::new();
    registry.register(
        "noop",
        Handler::new(|_ctx: (), _args, _kwargs| async move { Ok(Value::Null) }),
    )?;

    for _ in 0..3 {
        manager.enqueue(EnqueueSpec::new("noop")).await?;
    }

    let runner = Runner::new(Arc::clone(&manager), Arc::new(registry), ())
        .configure_default_queue(|queue| {
            queue
                .num_workers(1)
                .poll_interval(Duration::from_millis(50))
                .jitter(Duration::ZERO)
                .max_tasks(1)
        });
    // The worker exits by itself after one attempt.
    runner.start().wait_for_shutdown().await?;

    let succeeded = list_tasks(&pool, Some(TaskStatus::Success), None).await?;
    let pending = list_tasks(&pool, Some(TaskStatus::Pending), None).await?;
    assert_eq!(succeeded.len(), 1);
    assert_eq!(pending.len(), 2);
    Ok(())
}

#[tokio::test]
async fn shutdown_waits_for_the_inflight_attempt() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        task_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    let (pool, _container) = test_utils::setup_test_db().await?;
    let manager = manager_for(&pool);

    let test_context = TestContext {
        task_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let mut registry = TaskRegistry::new();
    registry.register(
        "blocking",
        Handler::new(|ctx: TestContext, _args, _kwargs| async move {
            ctx.task_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(json!("finished"))
        }),
    )?;

    let task_id = manager.enqueue(EnqueueSpec::new("blocking")).await?;

    let runner = test_utils::create_test_runner(
        Arc::clone(&manager),
        Arc::new(registry),
        test_context.clone(),
    );
    let handle = runner.start();

    test_context.task_started_barrier.wait().await;

    // Shutdown must not interrupt the attempt that is mid-execution.
    handle.request_shutdown();
    let still_processing = assert_some!(find_task(&pool, task_id).await?);
    assert_eq!(still_processing.status, TaskStatus::Processing);

    test_context.assertions_finished_barrier.wait().await;
    handle.wait_for_shutdown().await?;

    let record = assert_some!(find_task(&pool, task_id).await?);
    assert_eq!(record.status, TaskStatus::Success);
    Ok(())
}
