//! In-memory workflow journal.
//!
//! Backed by a `DashMap`; each mutation runs under the map's per-entry write
//! lock, which makes it atomic with respect to every other operation on the
//! same record. Cloning the journal shares the underlying map, so a second
//! manager built over a clone sees the same records (used to simulate a
//! process restart in tests).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    DeliveryState, StepResult, WorkflowInstance, WorkflowResult, WorkflowStatus,
};

use super::workflow::{CancelOutcome, StepBoundary, WorkflowJournal, lease_deadline};

/// Process-local journal. Not durable across real restarts.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    records: Arc<DashMap<Uuid, WorkflowInstance>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted(&self, filter: impl Fn(&WorkflowInstance) -> bool) -> Vec<WorkflowInstance> {
        let mut out: Vec<WorkflowInstance> = self
            .records
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

impl WorkflowJournal for MemoryJournal {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        match self.records.entry(instance.id) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "workflow {} already exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn list(&self, limit: u32) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut all = self.sorted(|_| true);
        all.reverse();
        all.truncate(limit as usize);
        Ok(all)
    }

    async fn list_unfinished(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        Ok(self.sorted(|inst| {
            !inst.status.is_terminal() || inst.delivery == DeliveryState::Undelivered
        }))
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.records.remove(id).is_some())
    }

    async fn begin_step(&self, id: &Uuid, index: u32) -> Result<StepBoundary, RepositoryError> {
        let mut entry = self.records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let inst = entry.value_mut();

        if inst.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "workflow {id} is already {}",
                inst.status
            )));
        }
        if index < inst.current_step_index {
            return Err(RepositoryError::Conflict(format!(
                "step index cannot move backward ({} -> {index})",
                inst.current_step_index
            )));
        }

        if inst.status != WorkflowStatus::Cancelling {
            inst.status = WorkflowStatus::Running;
        }
        inst.current_step_index = index;
        inst.updated_at = Utc::now();

        Ok(StepBoundary {
            status: inst.status,
            cancel_requested: inst.cancel_requested,
        })
    }

    async fn append_step_result(
        &self,
        id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let mut entry = self.records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let inst = entry.value_mut();

        let expected = inst.next_result_index();
        if result.index != expected {
            return Err(RepositoryError::Conflict(format!(
                "expected step result {expected}, got {}",
                result.index
            )));
        }

        inst.step_results.push(result.clone());
        inst.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(
        &self,
        id: &Uuid,
        status: WorkflowStatus,
        result: &WorkflowResult,
    ) -> Result<(), RepositoryError> {
        let mut entry = self.records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let inst = entry.value_mut();

        if !status.is_terminal() || !inst.status.can_transition_to(status) {
            return Err(RepositoryError::Conflict(format!(
                "cannot move workflow {id} from {} to {status}",
                inst.status
            )));
        }

        inst.status = status;
        inst.result = Some(result.clone());
        inst.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, id: &Uuid) -> Result<CancelOutcome, RepositoryError> {
        let Some(mut entry) = self.records.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let inst = entry.value_mut();

        if inst.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        if inst.cancel_requested {
            return Ok(CancelOutcome::AlreadyRequested);
        }

        inst.cancel_requested = true;
        if inst.status == WorkflowStatus::Running {
            inst.status = WorkflowStatus::Cancelling;
        }
        inst.updated_at = Utc::now();
        Ok(CancelOutcome::Recorded)
    }

    async fn claim_delivery(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let Some(mut entry) = self.records.get_mut(id) else {
            return Ok(false);
        };
        let inst = entry.value_mut();

        if !inst.status.is_terminal() || inst.delivery != DeliveryState::Undelivered {
            return Ok(false);
        }

        inst.delivery = DeliveryState::Dispatching;
        inst.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_callback_failure(&self, id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut entry = self.records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let inst = entry.value_mut();
        inst.delivery = DeliveryState::CallbackFailed;
        inst.callback_error = Some(error.to_string());
        inst.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_driver(
        &self,
        id: &Uuid,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let mut entry = self.records.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let inst = entry.value_mut();

        let now = Utc::now();
        if !inst.lease_available_to(owner, now) {
            return Ok(false);
        }
        inst.lease_owner = Some(owner.to_string());
        inst.lease_expires_at = Some(lease_deadline(now, ttl)?);
        Ok(true)
    }

    async fn release_driver(&self, id: &Uuid, owner: &str) -> Result<(), RepositoryError> {
        if let Some(mut entry) = self.records.get_mut(id) {
            let inst = entry.value_mut();
            if inst.lease_owner.as_deref() == Some(owner) {
                inst.lease_owner = None;
                inst.lease_expires_at = None;
            }
        }
        Ok(())
    }
}
