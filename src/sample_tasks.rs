//! Demo task handlers registered by the bundled binaries.

use std::time::Duration;

use anyhow::{anyhow, bail};
use serde_json::{Value, json};

use crate::errors::RegistryError;
use crate::registry::{Handler, TaskRegistry};

fn number_arg(args: &[Value], index: usize) -> anyhow::Result<f64> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("argument {index} must be a number"))
}

/// Register the demo handlers: `add_numbers`, `multiply_numbers`,
/// `slow_task`, `process_data` and `failing_task`.
///
/// `slow_task` sleeps for a caller-supplied number of seconds, so a
/// submission whose `timeout` is shorter than its `duration` exercises
/// the per-attempt timeout end to end.
pub fn register_sample_tasks(registry: &mut TaskRegistry<()>) -> Result<(), RegistryError> {
    registry.register(
        "add_numbers",
        Handler::new(|_ctx, args, _kwargs| async move {
            let a = number_arg(&args, 0)?;
            let b = number_arg(&args, 1)?;
            Ok(json!(a + b))
        }),
    )?;

    registry.register(
        "multiply_numbers",
        Handler::new(|_ctx, args, _kwargs| async move {
            let a = number_arg(&args, 0)?;
            let b = number_arg(&args, 1)?;
            Ok(json!(a * b))
        }),
    )?;

    registry.register(
        "slow_task",
        Handler::new(|_ctx, args, kwargs| async move {
            let duration = kwargs
                .get("duration")
                .or_else(|| args.first())
                .and_then(Value::as_u64)
                .unwrap_or(5);
            let message = kwargs
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("processing")
                .to_string();
            tokio::time::sleep(Duration::from_secs(duration)).await;
            Ok(json!(format!("completed: {message} after {duration} seconds")))
        })
        .with_timeout(Duration::from_secs(600)),
    )?;

    registry.register(
        "process_data",
        Handler::new(|_ctx, args, kwargs| async move {
            let data: Vec<f64> = args
                .first()
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("argument 0 must be a list of numbers"))?
                .iter()
                .map(|value| value.as_f64().ok_or_else(|| anyhow!("all data items must be numbers")))
                .collect::<anyhow::Result<_>>()?;
            if data.is_empty() {
                bail!("data list cannot be empty");
            }

            let operation = kwargs
                .get("operation")
                .and_then(Value::as_str)
                .unwrap_or("sum");
            let result = match operation {
                "sum" => data.iter().sum::<f64>(),
                "avg" => data.iter().sum::<f64>() / data.len() as f64,
                "max" => data.iter().copied().fold(f64::MIN, f64::max),
                "min" => data.iter().copied().fold(f64::MAX, f64::min),
                other => bail!("unsupported operation: {other}"),
            };

            Ok(json!({
                "operation": operation,
                "data_count": data.len(),
                "result": result,
            }))
        }),
    )?;

    registry.register(
        "failing_task",
        Handler::new(|_ctx, _args, kwargs| async move {
            let should_fail = kwargs
                .get("should_fail")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if should_fail {
                let message = kwargs
                    .get("error_message")
                    .and_then(Value::as_str)
                    .unwrap_or("task failed intentionally");
                bail!("{message}");
            }
            Ok(json!("task completed successfully"))
        }),
    )?;

    Ok(())
}
