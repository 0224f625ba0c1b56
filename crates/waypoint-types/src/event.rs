//! Event types for the Waypoint workflow event bus.
//!
//! `WorkflowEvent` is broadcast as instances move through their lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{StepKind, WorkflowStatus};

/// Lifecycle events emitted by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow instance was created and its driver spawned.
    Started {
        workflow_id: Uuid,
        workflow_name: String,
        steps: u32,
    },

    /// A step was handed to the step executor.
    StepDispatched {
        workflow_id: Uuid,
        index: u32,
        step_name: String,
        kind: StepKind,
    },

    /// A step returned (successfully or not) and its result was journaled.
    StepFinished {
        workflow_id: Uuid,
        index: u32,
        step_name: String,
        success: bool,
        duration_ms: u64,
    },

    /// Cancellation intent was recorded.
    CancelRequested { workflow_id: Uuid },

    /// The instance reached a terminal status.
    Finished {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    /// The completion handler ran successfully.
    CompletionDelivered { workflow_id: Uuid, kind: String },

    /// The completion handler failed; the record was retained.
    CompletionFailed { workflow_id: Uuid, error: String },

    /// The instance record was removed from the journal.
    CleanedUp { workflow_id: Uuid },
}

impl WorkflowEvent {
    /// The workflow this event belongs to.
    pub fn workflow_id(&self) -> Uuid {
        match self {
            WorkflowEvent::Started { workflow_id, .. }
            | WorkflowEvent::StepDispatched { workflow_id, .. }
            | WorkflowEvent::StepFinished { workflow_id, .. }
            | WorkflowEvent::CancelRequested { workflow_id }
            | WorkflowEvent::Finished { workflow_id, .. }
            | WorkflowEvent::CompletionDelivered { workflow_id, .. }
            | WorkflowEvent::CompletionFailed { workflow_id, .. }
            | WorkflowEvent::CleanedUp { workflow_id } => *workflow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::Finished {
            workflow_id: id,
            status: WorkflowStatus::Cancelled,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["status"], "cancelled");
        assert_eq!(event.workflow_id(), id);
    }
}
