//! Workflow manager: the public entry point of the engine.
//!
//! Constructed once with its journal, registries and event bus injected.
//! `start` persists a `Pending` instance and spawns one driver task per
//! instance; `cancel`, `cleanup`, `status` and `list` act on the journal;
//! `recover` re-drives whatever a previous process left unfinished.
//!
//! The `drivers` map keeps one driver per instance inside this process; the
//! journal's driver lease keeps one across processes sharing a journal.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use uuid::Uuid;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    StartOptions, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};

use crate::event::EventBus;
use crate::repository::workflow::{CancelOutcome, WorkflowJournal, lease_deadline};

use super::cancel::CancellationCoordinator;
use super::checkpoint::CheckpointManager;
use super::completion::{CompletionDispatcher, CompletionRegistry};
use super::error::EngineError;
use super::executor::StepExecutor;
use super::lease::{self, LeaseSettings};
use super::machine::StateMachine;
use super::step::StepRegistry;

struct Inner<J: WorkflowJournal> {
    checkpoints: Arc<CheckpointManager<J>>,
    machine: StateMachine<J>,
    coordinator: CancellationCoordinator<J>,
    events: EventBus,
    lease: LeaseSettings,
    /// Instances this process is currently driving.
    drivers: DashMap<Uuid, AbortHandle>,
    /// Number of live driver tasks.
    active: watch::Sender<usize>,
}

/// Starts, cancels, inspects and recovers workflow instances.
///
/// Cheap to clone; clones share the same journal and driver set.
pub struct WorkflowManager<J: WorkflowJournal + 'static> {
    inner: Arc<Inner<J>>,
}

impl<J: WorkflowJournal + 'static> Clone for WorkflowManager<J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<J: WorkflowJournal + 'static> WorkflowManager<J> {
    pub fn new(
        journal: J,
        steps: StepRegistry,
        completions: CompletionRegistry,
        events: EventBus,
    ) -> Self {
        Self::with_lease(journal, steps, completions, events, LeaseSettings::default())
    }

    /// Like [`WorkflowManager::new`] with explicit driver lease settings.
    pub fn with_lease(
        journal: J,
        steps: StepRegistry,
        completions: CompletionRegistry,
        events: EventBus,
        lease: LeaseSettings,
    ) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(journal));
        let dispatcher =
            CompletionDispatcher::new(Arc::clone(&checkpoints), Arc::new(completions), events.clone());
        let machine = StateMachine::new(
            Arc::clone(&checkpoints),
            StepExecutor::new(Arc::new(steps)),
            dispatcher,
            events.clone(),
        );
        let coordinator = CancellationCoordinator::new(Arc::clone(&checkpoints), events.clone());
        let (active, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                checkpoints,
                machine,
                coordinator,
                events,
                lease,
                drivers: DashMap::new(),
                active,
            }),
        }
    }

    /// Access the underlying journal.
    pub fn journal(&self) -> &J {
        self.inner.checkpoints.journal()
    }

    /// Owner name this manager writes into driver leases.
    pub fn lease_owner(&self) -> &str {
        &self.inner.lease.owner
    }

    /// Subscribe to lifecycle events of every workflow this manager drives.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Validate and persist a new instance, spawn its driver, and return its
    /// id without waiting for any step to run.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        args: Value,
        options: StartOptions,
    ) -> Result<Uuid, EngineError> {
        definition.validate()?;

        let mut instance = WorkflowInstance::new(definition, args, options);
        let id = instance.id;
        instance.lease_owner = Some(self.inner.lease.owner.clone());
        instance.lease_expires_at = Some(lease_deadline(instance.created_at, self.inner.lease.ttl)?);
        self.inner.checkpoints.journal().create(&instance).await?;

        tracing::info!(
            workflow_id = %id,
            workflow = %instance.definition.name,
            steps = instance.definition.steps.len(),
            on_complete = %instance.on_complete,
            "workflow started"
        );
        self.inner.events.publish(WorkflowEvent::Started {
            workflow_id: id,
            workflow_name: instance.definition.name.clone(),
            steps: instance.definition.steps.len() as u32,
        });

        self.spawn_driver(id);
        Ok(id)
    }

    /// Record cancellation intent. Returns immediately; takes effect at the
    /// next step boundary.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, EngineError> {
        self.inner.coordinator.request_cancel(id).await
    }

    /// Delete an instance's persisted state. Idempotent; returns whether a
    /// record was removed.
    ///
    /// A driver still running a non-terminal instance is aborted (an
    /// in-flight durable action keeps running detached). Terminal instances
    /// are left to their driver, which is at most delivering the completion,
    /// and a driver never aborts itself, so completion handlers may clean up
    /// their own record.
    pub async fn cleanup(&self, id: Uuid) -> Result<bool, EngineError> {
        let journal = self.inner.checkpoints.journal();
        let terminal = journal
            .get(&id)
            .await?
            .is_some_and(|instance| instance.status.is_terminal());

        if !terminal {
            let current = tokio::task::try_id();
            if let Some((_, handle)) = self
                .inner
                .drivers
                .remove_if(&id, |_, handle| Some(handle.id()) != current)
            {
                handle.abort();
                tracing::warn!(workflow_id = %id, "aborted active driver during cleanup");
            }
        }

        let removed = journal.delete(&id).await?;
        if removed {
            tracing::info!(workflow_id = %id, "workflow cleaned up");
            self.inner
                .events
                .publish(WorkflowEvent::CleanedUp { workflow_id: id });
        } else {
            tracing::debug!(workflow_id = %id, "cleanup found no record");
        }
        Ok(removed)
    }

    /// The persisted record, if it still exists.
    pub async fn status(&self, id: Uuid) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.inner.checkpoints.journal().get(&id).await?)
    }

    /// Most recently created records first.
    pub async fn list(&self, limit: u32) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.inner.checkpoints.journal().list(limit).await?)
    }

    /// Resume every unfinished instance in the journal and dispatch
    /// undelivered completions. Instances whose driver lease is held live
    /// by another manager are skipped. Returns the ids a driver was spawned
    /// for.
    pub async fn recover(&self) -> Result<Vec<Uuid>, EngineError> {
        let unfinished = self.inner.checkpoints.journal().list_unfinished().await?;
        let mut resumed = Vec::with_capacity(unfinished.len());
        let now = Utc::now();

        for instance in unfinished {
            let id = instance.id;
            if !instance.lease_available_to(&self.inner.lease.owner, now) {
                tracing::debug!(
                    workflow_id = %id,
                    owner = instance.lease_owner.as_deref().unwrap_or_default(),
                    "driver lease held elsewhere, not recovering"
                );
                continue;
            }
            let in_flight = matches!(
                instance.status,
                WorkflowStatus::Running | WorkflowStatus::Cancelling
            ) && instance.step_result(instance.current_step_index).is_none();
            if in_flight {
                tracing::warn!(
                    workflow_id = %id,
                    step_index = instance.current_step_index,
                    "re-dispatching step that was in flight before restart"
                );
            }
            if self.spawn_driver(id) {
                resumed.push(id);
            }
        }

        tracing::info!(count = resumed.len(), "recovered unfinished workflows");
        Ok(resumed)
    }

    /// Wait until every driver task this manager spawned has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    /// Number of instances currently being driven.
    pub fn active_drivers(&self) -> usize {
        self.inner.drivers.len()
    }

    // -----------------------------------------------------------------------
    // Driver tasks
    // -----------------------------------------------------------------------

    /// Spawn the driver for `id` unless one is already running. Returns
    /// whether a new driver was spawned.
    fn spawn_driver(&self, id: Uuid) -> bool {
        match self.inner.drivers.entry(id) {
            Entry::Occupied(_) => {
                tracing::debug!(workflow_id = %id, "driver already active");
                false
            }
            Entry::Vacant(slot) => {
                self.inner.active.send_modify(|n| *n += 1);
                let guard = DriverGuard {
                    inner: Arc::clone(&self.inner),
                    id,
                };
                let task = tokio::spawn(async move {
                    let guard = guard;
                    let inner = &guard.inner;
                    let journal = inner.checkpoints.journal();
                    let settings = &inner.lease;

                    match journal.claim_driver(&id, &settings.owner, settings.ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::info!(workflow_id = %id, "driver lease held by another process");
                            return;
                        }
                        Err(err) => {
                            tracing::warn!(workflow_id = %id, error = %err, "could not claim driver lease");
                            return;
                        }
                    }

                    let outcome = tokio::select! {
                        result = inner.machine.drive(id) => Some(result),
                        () = lease::keep_alive(journal, id, settings) => None,
                    };
                    match outcome {
                        Some(Ok(status)) => {
                            tracing::debug!(workflow_id = %id, status = ?status, "driver finished");
                        }
                        // Already logged and recorded by the dispatcher.
                        Some(Err(EngineError::Callback { .. })) => {}
                        Some(Err(err)) => {
                            tracing::warn!(
                                workflow_id = %id,
                                error = %err,
                                "workflow driver stopped"
                            );
                        }
                        None => {
                            tracing::warn!(workflow_id = %id, "driver lease lost, stopped driving");
                        }
                    }

                    if let Err(err) = journal.release_driver(&id, &settings.owner).await {
                        tracing::debug!(workflow_id = %id, error = %err, "could not release driver lease");
                    }
                });
                slot.insert(task.abort_handle());
                true
            }
        }
    }
}

/// Removes the driver entry and decrements the live count when the driver
/// task ends, including when it is aborted.
struct DriverGuard<J: WorkflowJournal> {
    inner: Arc<Inner<J>>,
    id: Uuid,
}

impl<J: WorkflowJournal> Drop for DriverGuard<J> {
    fn drop(&mut self) {
        self.inner.drivers.remove(&self.id);
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
