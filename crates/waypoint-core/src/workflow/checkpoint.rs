//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps a `WorkflowJournal` with the higher-level calls the driver loop
//! makes: crossing a step boundary, recording a step's result, and moving
//! to a terminal status. Each call is persisted before the driver moves
//! forward, so a crashed process resumes from the last recorded boundary.

use chrono::Utc;
use uuid::Uuid;
use waypoint_types::workflow::{
    StepOutcome, StepResult, WorkflowInstance, WorkflowResult, WorkflowStatus,
};

use crate::repository::workflow::{StepBoundary, WorkflowJournal};

use super::error::EngineError;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow instances.
///
/// Generic over `J: WorkflowJournal` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<J: WorkflowJournal> {
    journal: J,
}

impl<J: WorkflowJournal> CheckpointManager<J> {
    /// Create a new checkpoint manager backed by the given journal.
    pub fn new(journal: J) -> Self {
        Self { journal }
    }

    /// Access the underlying journal.
    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// Load an instance, failing with `NotFound` if it has no record.
    pub async fn load(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.journal
            .get(&id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint the boundary before step `index`, reading back the
    /// cancellation flag in the same journal operation.
    pub async fn begin_step(&self, id: Uuid, index: u32) -> Result<StepBoundary, EngineError> {
        let boundary = self.journal.begin_step(&id, index).await?;

        tracing::debug!(
            workflow_id = %id,
            step_index = index,
            status = ?boundary.status,
            cancel_requested = boundary.cancel_requested,
            "checkpointed step boundary"
        );

        Ok(boundary)
    }

    /// Checkpoint a step's outcome.
    pub async fn record_step(
        &self,
        id: Uuid,
        index: u32,
        step_name: &str,
        outcome: StepOutcome,
    ) -> Result<StepResult, EngineError> {
        let result = StepResult {
            index,
            step_name: step_name.to_string(),
            outcome,
            recorded_at: Utc::now(),
        };

        self.journal.append_step_result(&id, &result).await?;

        tracing::debug!(
            workflow_id = %id,
            step_index = index,
            step = step_name,
            success = result.outcome.is_success(),
            "checkpointed step result"
        );

        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Instance-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint the terminal status together with its classification.
    pub async fn finish(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        result: &WorkflowResult,
    ) -> Result<(), EngineError> {
        self.journal.finish(&id, status, result).await?;

        tracing::debug!(
            workflow_id = %id,
            status = ?status,
            kind = result.kind(),
            "checkpointed terminal status"
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_types::error::RepositoryError;
    use waypoint_types::workflow::{StartOptions, StepSpec, WorkflowDefinition};

    use crate::repository::memory::MemoryJournal;

    async fn seeded() -> (CheckpointManager<MemoryJournal>, Uuid) {
        let def = WorkflowDefinition::new("two")
            .step(StepSpec::transactional("a", "a"))
            .step(StepSpec::transactional("b", "b"));
        let inst = WorkflowInstance::new(def, json!({}), StartOptions::new("log"));
        let journal = MemoryJournal::new();
        journal.create(&inst).await.unwrap();
        (CheckpointManager::new(journal), inst.id)
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let (checkpoints, _) = seeded().await;
        let missing = Uuid::now_v7();
        let err = checkpoints.load(missing).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn records_steps_then_finishes() {
        let (checkpoints, id) = seeded().await;

        checkpoints.begin_step(id, 0).await.unwrap();
        checkpoints
            .record_step(id, 0, "a", StepOutcome::Success { value: json!(1) })
            .await
            .unwrap();
        checkpoints.begin_step(id, 1).await.unwrap();
        checkpoints
            .record_step(id, 1, "b", StepOutcome::Success { value: json!(2) })
            .await
            .unwrap();
        checkpoints
            .finish(
                id,
                WorkflowStatus::Completed,
                &WorkflowResult::Success {
                    return_value: json!(2),
                },
            )
            .await
            .unwrap();

        let inst = checkpoints.load(id).await.unwrap();
        assert_eq!(inst.status, WorkflowStatus::Completed);
        assert_eq!(inst.step_results.len(), 2);
        assert_eq!(inst.current_step_index, 1);
    }

    #[tokio::test]
    async fn out_of_order_result_is_conflict() {
        let (checkpoints, id) = seeded().await;
        let err = checkpoints
            .record_step(id, 1, "b", StepOutcome::Success { value: json!(null) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Journal(RepositoryError::Conflict(_))
        ));
    }
}
