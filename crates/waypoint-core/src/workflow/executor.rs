//! Step executor: resolves a step's handler and runs it.
//!
//! Transactional steps run inline on the driving task. Durable-action steps
//! run on their own spawned task whose `JoinHandle` the caller awaits, so a
//! panicking or aborted action surfaces as a `JoinError` instead of taking
//! the driver down. Either way the result is a [`StepOutcome`]; invocation
//! problems are tagged [`FailureKind::Dispatch`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use uuid::Uuid;
use waypoint_types::workflow::{FailureKind, StepFailure, StepKind, StepOutcome, StepSpec};

use super::step::{StepError, StepInput, StepRegistry};

/// Runs individual steps against a [`StepRegistry`].
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
}

impl StepExecutor {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Execute step `index` of a workflow and report its outcome.
    ///
    /// Never returns an error: every failure, including an unknown handler
    /// or a panic, is folded into `StepOutcome::Failed`.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        index: u32,
        spec: &StepSpec,
        workflow_args: &Value,
    ) -> StepOutcome {
        let Some(handler) = self.registry.get(&spec.handler) else {
            return dispatch_failed(
                workflow_id,
                index,
                &spec.name,
                format!("no step handler registered as '{}'", spec.handler),
            );
        };

        let input = StepInput::new(
            workflow_id,
            index,
            spec.name.clone(),
            spec.args.clone(),
            workflow_args.clone(),
        );

        let result: Result<Result<Value, StepError>, String> = match spec.kind {
            StepKind::Transactional => AssertUnwindSafe(handler.run(input))
                .catch_unwind()
                .await
                .map_err(|payload| format!("step panicked: {}", panic_message(payload.as_ref()))),
            StepKind::DurableAction => {
                let task = tokio::spawn(async move { handler.run(input).await });
                match task.await {
                    Ok(result) => Ok(result),
                    Err(err) if err.is_panic() => Err(format!(
                        "step panicked: {}",
                        panic_message(err.into_panic().as_ref())
                    )),
                    Err(err) => Err(format!("step task did not complete: {err}")),
                }
            }
        };

        match result {
            Ok(Ok(value)) => StepOutcome::Success { value },
            Ok(Err(err)) => {
                let failure = err.into_failure();
                if failure.kind == FailureKind::Dispatch {
                    log_dispatch_failure(workflow_id, index, &spec.name, &failure.message);
                } else {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        step_index = index,
                        step = %spec.name,
                        error = %failure.message,
                        "step failed"
                    );
                }
                StepOutcome::Failed { failure }
            }
            Err(message) => dispatch_failed(workflow_id, index, &spec.name, message),
        }
    }
}

fn dispatch_failed(workflow_id: Uuid, index: u32, step: &str, message: String) -> StepOutcome {
    log_dispatch_failure(workflow_id, index, step, &message);
    StepOutcome::Failed {
        failure: StepFailure::dispatch(message),
    }
}

fn log_dispatch_failure(workflow_id: Uuid, index: u32, step: &str, message: &str) {
    tracing::error!(
        workflow_id = %workflow_id,
        step_index = index,
        step,
        failure_kind = "dispatch",
        error = message,
        "step dispatch failed"
    );
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
