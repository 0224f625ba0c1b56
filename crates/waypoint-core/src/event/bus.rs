//! Lifecycle event fan-out.
//!
//! The manager and its components publish every `WorkflowEvent` on one
//! `tokio::sync::broadcast` channel. Observers either take the whole stream
//! or a [`WorkflowSubscription`] narrowed to a single instance. Events are
//! notifications only; the journal stays the source of truth, so a lagging
//! or absent subscriber never affects a workflow.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;
use waypoint_types::event::WorkflowEvent;

/// Sender side shared by every component of one manager.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// `capacity` is how many events a slow subscriber may fall behind
    /// before it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Events of one workflow instance published from now on.
    pub fn subscribe_workflow(&self, workflow_id: Uuid) -> WorkflowSubscription {
        WorkflowSubscription::new(self.sender.subscribe(), workflow_id)
    }

    pub fn publish(&self, event: WorkflowEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("workflow event dropped, no subscribers");
        }
    }
}

/// Receiver that yields only the events of one workflow instance.
///
/// Wrap a receiver taken before `start` to see the instance's `Started`
/// event; its id is only known once `start` returns.
#[derive(Debug)]
pub struct WorkflowSubscription {
    rx: broadcast::Receiver<WorkflowEvent>,
    workflow_id: Uuid,
}

impl WorkflowSubscription {
    pub fn new(rx: broadcast::Receiver<WorkflowEvent>, workflow_id: Uuid) -> Self {
        Self { rx, workflow_id }
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Next event for this instance. `Lagged` counts skipped events of
    /// every instance, not only this one.
    pub async fn recv(&mut self) -> Result<WorkflowEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if event.workflow_id() == self.workflow_id {
                return Ok(event);
            }
        }
    }

    /// Non-blocking [`WorkflowSubscription::recv`].
    pub fn try_recv(&mut self) -> Result<WorkflowEvent, TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if event.workflow_id() == self.workflow_id {
                return Ok(event);
            }
        }
    }
}
