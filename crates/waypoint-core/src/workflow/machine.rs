//! Workflow state machine: drives one instance to a terminal status.
//!
//! # Loop
//!
//! For each step index `i`, starting at the instance's `current_step_index`:
//!
//! 1. Checkpoint the boundary (`Running` unless already `Cancelling`) and
//!    read back the cancellation flag in the same journal operation.
//! 2. If step `i` already has a journaled result (resume), reuse it.
//! 3. Otherwise, if cancellation was requested, stop as `Cancelled` before
//!    dispatching step `i`; else dispatch it and journal its result.
//! 4. A failed result ends the workflow as `Failed`; success of the last
//!    step ends it as `Completed`; otherwise continue with `i + 1`.
//!
//! The terminal status is checkpointed only after every step result is
//! persisted, then the instance is handed to the completion dispatcher.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;
use waypoint_types::error::DefinitionError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{StepOutcome, WorkflowInstance, WorkflowStatus};

use crate::event::EventBus;
use crate::repository::workflow::WorkflowJournal;

use super::checkpoint::CheckpointManager;
use super::completion::CompletionDispatcher;
use super::error::EngineError;
use super::executor::StepExecutor;

/// Drives workflow instances through their steps.
pub struct StateMachine<J: WorkflowJournal> {
    checkpoints: Arc<CheckpointManager<J>>,
    executor: StepExecutor,
    dispatcher: CompletionDispatcher<J>,
    events: EventBus,
}

impl<J: WorkflowJournal> StateMachine<J> {
    pub fn new(
        checkpoints: Arc<CheckpointManager<J>>,
        executor: StepExecutor,
        dispatcher: CompletionDispatcher<J>,
        events: EventBus,
    ) -> Self {
        Self {
            checkpoints,
            executor,
            dispatcher,
            events,
        }
    }

    /// Run instance `id` from its current boundary to a terminal status and
    /// deliver its completion.
    ///
    /// An instance that is already terminal goes straight to the dispatcher
    /// (which does nothing if delivery was already claimed). Journal errors
    /// abort the drive and leave the record resumable.
    pub async fn drive(&self, id: Uuid) -> Result<WorkflowStatus, EngineError> {
        let mut instance = self.checkpoints.load(id).await?;

        if !instance.status.is_terminal() {
            let status = self.run_steps(&mut instance).await?;
            instance.status = status;

            let result = instance
                .classify()
                .ok_or(EngineError::NotTerminal(id))?;
            self.checkpoints.finish(id, status, &result).await?;
            instance.result = Some(result);

            tracing::info!(
                workflow_id = %id,
                workflow = %instance.definition.name,
                status = ?status,
                steps_run = instance.step_results.len(),
                "workflow finished"
            );
            self.events.publish(WorkflowEvent::Finished {
                workflow_id: id,
                status,
            });
        }

        self.dispatcher.dispatch(&instance).await?;
        Ok(instance.status)
    }

    /// Step loop. Returns the terminal status to record; appends every
    /// newly journaled result to `instance.step_results`.
    async fn run_steps(&self, instance: &mut WorkflowInstance) -> Result<WorkflowStatus, EngineError> {
        let id = instance.id;
        let last = instance
            .definition
            .last_index()
            .ok_or_else(|| DefinitionError::NoSteps(instance.definition.name.clone()))?;
        let mut index = instance.current_step_index;

        loop {
            let boundary = self.checkpoints.begin_step(id, index).await?;

            let journaled = instance.step_result(index).map(|r| r.outcome.clone());

            let outcome = match journaled {
                Some(outcome) => {
                    tracing::debug!(
                        workflow_id = %id,
                        step_index = index,
                        "reusing journaled step result"
                    );
                    outcome
                }
                None if boundary.cancel_requested => {
                    tracing::info!(
                        workflow_id = %id,
                        step_index = index,
                        "cancellation observed at step boundary"
                    );
                    return Ok(WorkflowStatus::Cancelled);
                }
                None => {
                    let spec = instance
                        .definition
                        .step_at(index)
                        .cloned()
                        .ok_or_else(|| {
                            EngineError::Definition(DefinitionError::NoSteps(
                                instance.definition.name.clone(),
                            ))
                        })?;

                    self.events.publish(WorkflowEvent::StepDispatched {
                        workflow_id: id,
                        index,
                        step_name: spec.name.clone(),
                        kind: spec.kind,
                    });
                    tracing::debug!(
                        workflow_id = %id,
                        step_index = index,
                        step = %spec.name,
                        kind = %spec.kind,
                        "dispatching step"
                    );

                    let started = Instant::now();
                    let outcome = self
                        .executor
                        .execute(id, index, &spec, &instance.args)
                        .await;
                    let result = self
                        .checkpoints
                        .record_step(id, index, &spec.name, outcome)
                        .await?;

                    self.events.publish(WorkflowEvent::StepFinished {
                        workflow_id: id,
                        index,
                        step_name: spec.name,
                        success: result.outcome.is_success(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });

                    let outcome = result.outcome.clone();
                    instance.step_results.push(result);
                    outcome
                }
            };

            match outcome {
                StepOutcome::Failed { .. } => return Ok(WorkflowStatus::Failed),
                StepOutcome::Success { .. } if index >= last => {
                    return Ok(WorkflowStatus::Completed);
                }
                StepOutcome::Success { .. } => index += 1,
            }
        }
    }
}
