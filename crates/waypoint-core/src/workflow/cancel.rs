//! Cancellation coordinator.
//!
//! Records cancellation intent and returns immediately. The driver observes
//! the flag at the next step boundary; a dispatched step is never
//! interrupted.

use std::sync::Arc;

use uuid::Uuid;
use waypoint_types::event::WorkflowEvent;

use crate::event::EventBus;
use crate::repository::workflow::{CancelOutcome, WorkflowJournal};

use super::checkpoint::CheckpointManager;
use super::error::EngineError;

pub struct CancellationCoordinator<J: WorkflowJournal> {
    checkpoints: Arc<CheckpointManager<J>>,
    events: EventBus,
}

impl<J: WorkflowJournal> CancellationCoordinator<J> {
    pub fn new(checkpoints: Arc<CheckpointManager<J>>, events: EventBus) -> Self {
        Self {
            checkpoints,
            events,
        }
    }

    /// Record cancellation intent for `id`.
    ///
    /// Idempotent. Unknown ids and terminal instances are no-ops reported
    /// through the returned [`CancelOutcome`], not errors.
    pub async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, EngineError> {
        let outcome = self.checkpoints.journal().request_cancel(&id).await?;

        match outcome {
            CancelOutcome::Recorded => {
                tracing::info!(workflow_id = %id, "cancellation requested");
                self.events
                    .publish(WorkflowEvent::CancelRequested { workflow_id: id });
            }
            CancelOutcome::AlreadyRequested => {
                tracing::debug!(workflow_id = %id, "cancellation already requested");
            }
            CancelOutcome::AlreadyTerminal => {
                tracing::debug!(workflow_id = %id, "cancel ignored, workflow already finished");
            }
            CancelOutcome::NotFound => {
                tracing::debug!(workflow_id = %id, "cancel ignored, no such workflow");
            }
        }

        Ok(outcome)
    }
}
