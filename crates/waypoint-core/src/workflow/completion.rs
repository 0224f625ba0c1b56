//! Completion handlers and the dispatcher that delivers terminal results.
//!
//! Handlers are registered by name and referenced from each instance by a
//! [`HandlerRef`](waypoint_types::workflow::HandlerRef), so the reference
//! survives restarts. The dispatcher claims delivery in the journal before
//! invoking the handler, which makes delivery at-most-once: a crash between
//! the claim and the delete yields zero deliveries, never two.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use waypoint_types::error::RepositoryError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{CompletionRecord, WorkflowInstance};

use crate::event::EventBus;
use crate::repository::workflow::WorkflowJournal;

use super::checkpoint::CheckpointManager;
use super::error::EngineError;
use super::executor::panic_message;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Error returned by a completion handler.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no completion handler registered as '{0}'")]
    NotRegistered(String),

    #[error("{0}")]
    Failed(String),

    #[error("completion handler panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    pub fn failed(message: impl Into<String>) -> Self {
        CallbackError::Failed(message.into())
    }
}

/// Receives the terminal result of a workflow, once.
pub trait CompletionHandler: Send + Sync {
    fn on_complete(
        &self,
        record: &CompletionRecord,
    ) -> impl Future<Output = Result<(), CallbackError>> + Send;
}

/// Object-safe version of [`CompletionHandler`] with boxed futures.
pub trait CompletionHandlerDyn: Send + Sync {
    fn on_complete_boxed<'a>(
        &'a self,
        record: &'a CompletionRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send + 'a>>;
}

impl<T: CompletionHandler> CompletionHandlerDyn for T {
    fn on_complete_boxed<'a>(
        &'a self,
        record: &'a CompletionRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallbackError>> + Send + 'a>> {
        Box::pin(self.on_complete(record))
    }
}

/// Type-erased completion handler.
pub struct BoxCompletionHandler {
    inner: Box<dyn CompletionHandlerDyn>,
}

impl BoxCompletionHandler {
    pub fn new<T: CompletionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub async fn on_complete(&self, record: &CompletionRecord) -> Result<(), CallbackError> {
        self.inner.on_complete_boxed(record).await
    }
}

impl std::fmt::Debug for BoxCompletionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCompletionHandler").finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a [`CompletionHandler`]. The
/// closure receives its own copy of the record.
pub struct FnCompletion<F>(F);

impl<F, Fut> CompletionHandler for FnCompletion<F>
where
    F: Fn(CompletionRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send,
{
    fn on_complete(
        &self,
        record: &CompletionRecord,
    ) -> impl Future<Output = Result<(), CallbackError>> + Send {
        (self.0)(record.clone())
    }
}

/// Build a completion handler from an async closure.
pub fn completion_fn<F, Fut>(f: F) -> FnCompletion<F>
where
    F: Fn(CompletionRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send,
{
    FnCompletion(f)
}

/// Completion handlers keyed by the name an instance's `on_complete` refers to.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    handlers: HashMap<String, Arc<BoxCompletionHandler>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: CompletionHandler + 'static>(&mut self, name: impl Into<String>, handler: H) {
        self.handlers
            .insert(name.into(), Arc::new(BoxCompletionHandler::new(handler)));
    }

    pub fn with<H: CompletionHandler + 'static>(
        mut self,
        name: impl Into<String>,
        handler: H,
    ) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxCompletionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What happened when a completion was handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler ran and the record was deleted.
    Delivered,
    /// Another dispatch already claimed this completion; nothing was done.
    AlreadyClaimed,
}

/// Delivers terminal results to their completion handlers.
pub struct CompletionDispatcher<J: WorkflowJournal> {
    checkpoints: Arc<CheckpointManager<J>>,
    registry: Arc<CompletionRegistry>,
    events: EventBus,
}

impl<J: WorkflowJournal> CompletionDispatcher<J> {
    pub fn new(
        checkpoints: Arc<CheckpointManager<J>>,
        registry: Arc<CompletionRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            checkpoints,
            registry,
            events,
        }
    }

    /// Deliver the completion of a terminal instance.
    ///
    /// On success the instance is deleted from the journal. On failure the
    /// record is kept with `delivery = callback_failed` and the error is
    /// returned as [`EngineError::Callback`]; the callback is not retried.
    pub async fn dispatch(&self, instance: &WorkflowInstance) -> Result<DeliveryOutcome, EngineError> {
        let id = instance.id;
        let record = instance
            .completion_record()
            .ok_or(EngineError::NotTerminal(id))?;
        let journal = self.checkpoints.journal();

        if !journal.claim_delivery(&id).await? {
            tracing::debug!(workflow_id = %id, "completion already claimed, skipping");
            return Ok(DeliveryOutcome::AlreadyClaimed);
        }

        let handler_name = instance.on_complete.as_str();
        let outcome = match self.registry.get(handler_name) {
            Some(handler) => AssertUnwindSafe(handler.on_complete(&record))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(CallbackError::Panicked(panic_message(payload.as_ref())))
                }),
            None => Err(CallbackError::NotRegistered(handler_name.to_string())),
        };

        match outcome {
            Ok(()) => {
                // The handler may already have cleaned the record up itself.
                let removed = journal.delete(&id).await?;
                tracing::info!(
                    workflow_id = %id,
                    kind = record.result.kind(),
                    handler = handler_name,
                    "completion delivered"
                );
                self.events.publish(WorkflowEvent::CompletionDelivered {
                    workflow_id: id,
                    kind: record.result.kind().to_string(),
                });
                if removed {
                    self.events
                        .publish(WorkflowEvent::CleanedUp { workflow_id: id });
                }
                Ok(DeliveryOutcome::Delivered)
            }
            Err(err) => {
                let message = err.to_string();
                match journal.record_callback_failure(&id, &message).await {
                    Ok(()) => {}
                    Err(RepositoryError::NotFound) => {
                        tracing::debug!(workflow_id = %id, "record cleaned up during completion handler");
                    }
                    Err(err) => return Err(err.into()),
                }
                tracing::warn!(
                    workflow_id = %id,
                    handler = handler_name,
                    error = %message,
                    "completion handler failed, record retained"
                );
                self.events.publish(WorkflowEvent::CompletionFailed {
                    workflow_id: id,
                    error: message.clone(),
                });
                Err(EngineError::Callback {
                    workflow_id: id,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use waypoint_types::workflow::{
        DeliveryState, StartOptions, StepSpec, WorkflowDefinition, WorkflowResult, WorkflowStatus,
    };

    use crate::repository::memory::MemoryJournal;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<CompletionRecord>>>);

    impl CompletionHandler for Collect {
        async fn on_complete(&self, record: &CompletionRecord) -> Result<(), CallbackError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    async fn cancelled_instance(journal: &MemoryJournal, handler: &str) -> WorkflowInstance {
        let def = WorkflowDefinition::new("one").step(StepSpec::transactional("a", "a"));
        let inst = WorkflowInstance::new(
            def,
            json!({}),
            StartOptions::new(handler).with_context(json!({"ticket": 7})),
        );
        journal.create(&inst).await.unwrap();
        journal.begin_step(&inst.id, 0).await.unwrap();
        journal
            .finish(&inst.id, WorkflowStatus::Cancelled, &WorkflowResult::Canceled)
            .await
            .unwrap();
        journal.get(&inst.id).await.unwrap().unwrap()
    }

    fn dispatcher(
        journal: &MemoryJournal,
        registry: CompletionRegistry,
    ) -> CompletionDispatcher<MemoryJournal> {
        CompletionDispatcher::new(
            Arc::new(CheckpointManager::new(journal.clone())),
            Arc::new(registry),
            EventBus::new(16),
        )
    }

    #[tokio::test]
    async fn delivers_once_and_deletes_record() {
        let journal = MemoryJournal::new();
        let collect = Collect::default();
        let dispatcher = dispatcher(&journal, CompletionRegistry::new().with("log", collect.clone()));
        let inst = cancelled_instance(&journal, "log").await;

        assert_eq!(
            dispatcher.dispatch(&inst).await.unwrap(),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            dispatcher.dispatch(&inst).await.unwrap(),
            DeliveryOutcome::AlreadyClaimed
        );

        let seen = collect.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].result, WorkflowResult::Canceled);
        assert_eq!(seen[0].context, json!({"ticket": 7}));
        assert!(journal.is_empty());
    }

    #[tokio::test]
    async fn failing_handler_retains_record() {
        let journal = MemoryJournal::new();
        let registry = CompletionRegistry::new().with(
            "flaky",
            completion_fn(|_record: CompletionRecord| async move {
                Err::<(), _>(CallbackError::failed("mailer down"))
            }),
        );
        let dispatcher = dispatcher(&journal, registry);
        let inst = cancelled_instance(&journal, "flaky").await;

        let err = dispatcher.dispatch(&inst).await.unwrap_err();
        assert!(matches!(err, EngineError::Callback { ref message, .. } if message == "mailer down"));

        let kept = journal.get(&inst.id).await.unwrap().unwrap();
        assert_eq!(kept.delivery, DeliveryState::CallbackFailed);
        assert_eq!(kept.callback_error.as_deref(), Some("mailer down"));

        // Not re-delivered.
        assert_eq!(
            dispatcher.dispatch(&kept).await.unwrap(),
            DeliveryOutcome::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn unknown_handler_is_callback_error() {
        let journal = MemoryJournal::new();
        let dispatcher = dispatcher(&journal, CompletionRegistry::new());
        let inst = cancelled_instance(&journal, "ghost").await;

        let err = dispatcher.dispatch(&inst).await.unwrap_err();
        assert!(err.to_string().contains("'ghost'"));
        assert!(journal.get(&inst.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn panicking_handler_is_caught() {
        let journal = MemoryJournal::new();
        let registry = CompletionRegistry::new().with(
            "panics",
            completion_fn(|_record: CompletionRecord| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), CallbackError>(())
            }),
        );
        let dispatcher = dispatcher(&journal, registry);
        let inst = cancelled_instance(&journal, "panics").await;

        let err = dispatcher.dispatch(&inst).await.unwrap_err();
        assert!(err.to_string().contains("handler exploded"));
    }

    #[tokio::test]
    async fn non_terminal_instance_is_rejected() {
        let journal = MemoryJournal::new();
        let dispatcher = dispatcher(&journal, CompletionRegistry::new());
        let def = WorkflowDefinition::new("one").step(StepSpec::transactional("a", "a"));
        let inst = WorkflowInstance::new(def, json!({}), StartOptions::new("log"));
        journal.create(&inst).await.unwrap();

        let err = dispatcher.dispatch(&inst).await.unwrap_err();
        assert!(matches!(err, EngineError::NotTerminal(_)));
    }
}
