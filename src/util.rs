use std::any::Any;

use anyhow::anyhow;
use sentry_core::{Hub, TransactionContext, protocol};

/// Turn a caught panic payload into a readable error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("task panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("task panicked: {message}")
    } else {
        anyhow!("task panicked")
    }
}

/// Run `callback` inside its own Sentry transaction.
///
/// A no-op when no Sentry client is bound to the current hub.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: AsyncFnOnce() -> Result<R, E>,
{
    let hub = Hub::new_from_top(Hub::current());
    let _scope_guard = hub.push_scope();

    let transaction_context = TransactionContext::new(transaction_name, "taskq.run_task");
    let transaction = sentry_core::start_transaction(transaction_context);
    hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

    let result = callback().await;

    transaction.set_status(match result.is_ok() {
        true => protocol::SpanStatus::Ok,
        false => protocol::SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}

/// Bound an error message before storing it.
pub(crate) fn truncate_error(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} [truncated]", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate_error("boom", 100), "boom");
    }

    #[test]
    fn long_messages_are_bounded() {
        let long = "x".repeat(5000);
        let truncated = truncate_error(&long, 2000);
        assert_eq!(truncated.len(), 2000 + " [truncated]".len());
        assert!(truncated.ends_with(" [truncated]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let message = "é".repeat(100);
        let truncated = truncate_error(&message, 101);
        assert!(truncated.ends_with(" [truncated]"));
        assert!(truncated.starts_with('é'));
    }
}
