//! Process-wide mapping from task names to executable handlers.
//!
//! Producer and worker processes are expected to build the same registry
//! at startup so that every enqueued name resolves on the host that
//! executes it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::errors::RegistryError;

/// Positional arguments handed to a handler.
pub type TaskArgs = Vec<Value>;

/// Keyword arguments handed to a handler.
pub type TaskKwargs = Map<String, Value>;

type RunTaskFn<Context> =
    dyn Fn(Context, TaskArgs, TaskKwargs) -> BoxFuture<'static, anyhow::Result<Value>>
        + Send
        + Sync;

/// Enqueue-time defaults a handler declares at registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerHints {
    /// Per-attempt execution bound to use when a submission omits one.
    pub declared_timeout: Option<Duration>,
    /// Retry cap to use when a submission omits one.
    pub declared_max_retries: Option<u32>,
}

/// An executable task handler plus its declared defaults.
///
/// Handlers receive the application context and the task's positional and
/// keyword argument bundles, and return a serializable result or an
/// error. They are expected to be idempotent: execution is at-least-once.
pub struct Handler<Context> {
    run: Arc<RunTaskFn<Context>>,
    hints: HandlerHints,
}

impl<Context> Clone for Handler<Context> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            hints: self.hints,
        }
    }
}

impl<Context> std::fmt::Debug for Handler<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("hints", &self.hints).finish()
    }
}

impl<Context: 'static> Handler<Context> {
    /// Wrap an async function as a handler.
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(Context, TaskArgs, TaskKwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |ctx, args, kwargs| run(ctx, args, kwargs).boxed()),
            hints: HandlerHints::default(),
        }
    }

    /// Declare a default per-attempt execution bound for this task.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.hints.declared_timeout = Some(timeout);
        self
    }

    /// Declare a default retry cap for this task.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.hints.declared_max_retries = Some(max_retries);
        self
    }

    /// The declared enqueue-time defaults.
    pub fn hints(&self) -> HandlerHints {
        self.hints
    }

    /// Invoke the handler.
    pub fn call(
        &self,
        context: Context,
        args: TaskArgs,
        kwargs: TaskKwargs,
    ) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.run)(context, args, kwargs)
    }
}

/// Name → handler mapping, populated once at startup.
pub struct TaskRegistry<Context> {
    handlers: HashMap<String, Handler<Context>>,
}

impl<Context> Default for TaskRegistry<Context> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Context> TaskRegistry<Context> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `name`.
    ///
    /// Re-registering the same handler under the same name is a no-op;
    /// a different handler under an existing name is a conflict.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Handler<Context>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.handlers.entry(name) {
            Entry::Occupied(entry) => {
                if Arc::ptr_eq(&entry.get().run, &handler.run) {
                    Ok(())
                } else {
                    Err(RegistryError::Conflict(entry.key().clone()))
                }
            }
            Entry::Vacant(entry) => {
                tracing::debug!(task_name = %entry.key(), "registered task");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Look up the handler for `name`.
    pub fn resolve(&self, name: &str) -> Result<&Handler<Context>, RegistryError> {
        self.handlers
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTask(name.to_string()))
    }

    /// All registered names, sorted. For operational tooling.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declared defaults per registered name, for enqueue-time fallback.
    pub fn hints(&self) -> HashMap<String, HandlerHints> {
        self.handlers
            .iter()
            .map(|(name, handler)| (name.clone(), handler.hints))
            .collect()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry has no tasks.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok, assert_ok_eq};
    use serde_json::json;

    fn noop() -> Handler<()> {
        Handler::new(|_ctx, _args, _kwargs| async { Ok(Value::Null) })
    }

    #[tokio::test]
    async fn resolves_registered_handler() {
        let mut registry = TaskRegistry::new();
        assert_ok!(registry.register(
            "double",
            Handler::new(|_ctx: (), args, _kwargs| async move {
                let n = args[0].as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            }),
        ));

        let handler = assert_ok!(registry.resolve("double"));
        let result = handler.call((), vec![json!(21)], Map::new()).await;
        assert_ok_eq!(result, json!(42));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let registry = TaskRegistry::<()>::new();
        assert_err!(registry.resolve("nope"));
    }

    #[test]
    fn re_registering_the_same_handler_is_idempotent() {
        let mut registry = TaskRegistry::new();
        let handler = noop();
        assert_ok!(registry.register("noop", handler.clone()));
        assert_ok!(registry.register("noop", handler));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn conflicting_registration_fails() {
        let mut registry = TaskRegistry::new();
        assert_ok!(registry.register("noop", noop()));
        let error = registry.register("noop", noop()).unwrap_err();
        assert!(matches!(error, RegistryError::Conflict(name) if name == "noop"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = TaskRegistry::new();
        assert_ok!(registry.register("b", noop()));
        assert_ok!(registry.register("a", noop()));
        assert_ok!(registry.register("c", noop()));
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn declared_defaults_show_up_in_hints() {
        let mut registry = TaskRegistry::new();
        assert_ok!(registry.register(
            "slow",
            noop()
                .with_timeout(Duration::from_secs(900))
                .with_max_retries(0),
        ));

        let hints = registry.hints();
        let slow = &hints["slow"];
        assert_eq!(slow.declared_timeout, Some(Duration::from_secs(900)));
        assert_eq!(slow.declared_max_retries, Some(0));
    }
}
