//! Step handlers and the registry that resolves them by name.
//!
//! Follows the same blanket-impl pattern as the other boxed ports:
//! 1. `StepHandler` uses native async fn in traits (RPITIT)
//! 2. `StepHandlerDyn` is the object-safe version with boxed futures
//! 3. `BoxStepHandler` wraps `Box<dyn StepHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;
use waypoint_types::workflow::StepFailure;

// ---------------------------------------------------------------------------
// Input / error
// ---------------------------------------------------------------------------

/// Everything a step handler receives for one invocation.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub workflow_id: Uuid,
    /// Zero-based step index.
    pub index: u32,
    pub step_name: String,
    /// The step's own argument payload from its `StepSpec`.
    pub args: Value,
    /// Workflow-level arguments given to `start`.
    pub workflow_args: Value,
    /// Stable key for this step of this workflow: `"{workflow_id}-{index}"`.
    /// Identical across re-dispatches after a restart.
    pub idempotency_key: String,
}

impl StepInput {
    pub fn new(
        workflow_id: Uuid,
        index: u32,
        step_name: impl Into<String>,
        args: Value,
        workflow_args: Value,
    ) -> Self {
        Self {
            workflow_id,
            index,
            step_name: step_name.into(),
            args,
            workflow_args,
            idempotency_key: format!("{workflow_id}-{index}"),
        }
    }

    /// Deserialize the step's argument payload. `null` deserializes into
    /// types that accept it (e.g. `Option<T>` or structs with all-default
    /// fields via `#[serde(default)]`).
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(self.args.clone()).map_err(|e| StepError::InvalidArgs(e.to_string()))
    }
}

/// Error returned by a step handler.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step body failed (application error).
    #[error("{0}")]
    Failed(String),

    /// The argument payload did not match what the handler expects.
    #[error("invalid step arguments: {0}")]
    InvalidArgs(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    /// Convert into the journaled failure. Bad arguments are an invocation
    /// problem, not something the step body decided.
    pub fn into_failure(self) -> StepFailure {
        match self {
            StepError::Failed(message) => StepFailure::application(message),
            err @ StepError::InvalidArgs(_) => StepFailure::dispatch(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A named unit of work a workflow step invokes.
///
/// # Re-dispatch on recovery
///
/// If the process stops while a step is in flight, the engine has no record
/// of its outcome and dispatches it again from scratch on restart. Handlers
/// for durable-action steps with external side effects must therefore be
/// safe to run more than once for the same [`StepInput::idempotency_key`]
/// (deduplicate on the key, or check for the side effect before repeating
/// it). Handlers have no visibility into cancellation; a dispatched step
/// always runs to completion.
pub trait StepHandler: Send + Sync {
    fn run(&self, input: StepInput) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn run_boxed(
        &self,
        input: StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + '_>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn run_boxed(
        &self,
        input: StepInput,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + '_>> {
        Box::pin(self.run(input))
    }
}

/// Type-erased step handler, so one registry can hold many handler types.
pub struct BoxStepHandler {
    inner: Box<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn run(&self, input: StepInput) -> Result<Value, StepError> {
        self.inner.run_boxed(input).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnStep<F>(F);

impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    fn run(&self, input: StepInput) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.0)(input)
    }
}

/// Build a step handler from an async closure.
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    FnStep(f)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step handlers keyed by the name a `StepSpec.handler` refers to.
#[derive(Debug, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<BoxStepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register<H: StepHandler + 'static>(&mut self, name: impl Into<String>, handler: H) {
        self.handlers
            .insert(name.into(), Arc::new(BoxStepHandler::new(handler)));
    }

    /// Builder-style [`StepRegistry::register`].
    pub fn with<H: StepHandler + 'static>(mut self, name: impl Into<String>, handler: H) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxStepHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use waypoint_types::workflow::FailureKind;

    struct Echo;

    impl StepHandler for Echo {
        async fn run(&self, input: StepInput) -> Result<Value, StepError> {
            Ok(input.args)
        }
    }

    #[test]
    fn idempotency_key_is_workflow_and_index() {
        let id = Uuid::now_v7();
        let input = StepInput::new(id, 2, "wrap-up", Value::Null, Value::Null);
        assert_eq!(input.idempotency_key, format!("{id}-2"));
    }

    #[test]
    fn parse_args_reports_invalid_payload() {
        #[derive(Debug, Deserialize)]
        struct RunArgs {
            secs: u64,
        }

        let ok = StepInput::new(Uuid::nil(), 0, "run", json!({"secs": 5}), Value::Null);
        assert_eq!(ok.parse_args::<RunArgs>().unwrap().secs, 5);

        let bad = StepInput::new(Uuid::nil(), 0, "run", json!({"secs": "five"}), Value::Null);
        let err = bad.parse_args::<RunArgs>().unwrap_err();
        assert!(matches!(err, StepError::InvalidArgs(_)));
        assert_eq!(err.into_failure().kind, FailureKind::Dispatch);
    }

    #[test]
    fn application_error_maps_to_application_failure() {
        let failure = StepError::failed("disk full").into_failure();
        assert_eq!(failure.kind, FailureKind::Application);
        assert_eq!(failure.message, "disk full");
    }

    #[tokio::test]
    async fn registry_resolves_struct_and_closure_handlers() {
        let registry = StepRegistry::new()
            .with("echo", Echo)
            .with("double", step_fn(|input: StepInput| async move {
                let n: i64 = input.parse_args()?;
                Ok::<_, StepError>(json!(n * 2))
            }));

        assert_eq!(registry.names(), vec!["double", "echo"]);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());

        let echo = registry.get("echo").unwrap();
        let out = echo
            .run(StepInput::new(Uuid::nil(), 0, "a", json!({"x": 1}), Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));

        let double = registry.get("double").unwrap();
        let out = double
            .run(StepInput::new(Uuid::nil(), 0, "b", json!(21), Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!(42));
    }
}
