//! Workflow domain types for Waypoint.
//!
//! Defines the immutable workflow shape (`WorkflowDefinition`, `StepSpec`),
//! the persisted execution record (`WorkflowInstance`) with its status
//! machine, per-step results, and the terminal classification handed to
//! completion handlers (`WorkflowResult`, `CompletionRecord`).

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DefinitionError;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An ordered sequence of steps.
///
/// A definition is snapshotted into every instance created from it, so a
/// running workflow never observes later edits and survives restarts
/// without a separate definition store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    /// Create an empty definition. Add steps with [`WorkflowDefinition::step`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Append a step (builder style).
    pub fn step(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    /// Set the description (builder style).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check that the definition can be executed.
    ///
    /// Rejects an empty name, an empty step list, steps without a handler
    /// reference, and duplicate step names.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.handler.trim().is_empty() {
                return Err(DefinitionError::MissingHandler {
                    step: step.name.clone(),
                    index: index as u32,
                });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(())
    }

    /// Index of the final step, or `None` for an empty definition.
    pub fn last_index(&self) -> Option<u32> {
        self.steps.len().checked_sub(1).map(|i| i as u32)
    }

    /// Look up a step by index.
    pub fn step_at(&self, index: u32) -> Option<&StepSpec> {
        self.steps.get(index as usize)
    }
}

// ---------------------------------------------------------------------------
// Step Specification
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within a definition (e.g. "prep").
    pub name: String,
    /// Execution kind.
    pub kind: StepKind,
    /// Registered step handler this step invokes.
    pub handler: String,
    /// Argument payload passed to the handler unchanged.
    #[serde(default)]
    pub args: Value,
}

impl StepSpec {
    /// A short, atomic step that runs inline on the workflow's driver.
    pub fn transactional(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Transactional,
            handler: handler.into(),
            args: Value::Null,
        }
    }

    /// A potentially long-running, side-effecting step.
    pub fn durable_action(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::DurableAction,
            handler: handler.into(),
            args: Value::Null,
        }
    }

    /// Attach an argument payload (builder style).
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// How a step is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Atomic, idempotent-safe to re-execute, never suspends.
    Transactional,
    /// May run for an unbounded duration and have external side effects.
    DurableAction,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Transactional => write!(f, "transactional"),
            StepKind::DurableAction => write!(f, "durable_action"),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler references
// ---------------------------------------------------------------------------

/// Name of a registered completion handler.
///
/// Persisted with the instance instead of a closure so the reference can be
/// resolved again after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerRef(pub String);

impl HandlerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options supplied when starting a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOptions {
    /// Handler invoked once the workflow reaches a terminal status.
    pub on_complete: HandlerRef,
    /// Opaque payload passed through unchanged to the handler.
    #[serde(default)]
    pub context: Value,
}

impl StartOptions {
    pub fn new(on_complete: impl Into<String>) -> Self {
        Self {
            on_complete: HandlerRef::new(on_complete),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
///
/// ```text
/// Pending -> Running -> Completed | Failed | Cancelled
///               |
///               +-> Cancelling -> Cancelled | Completed | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    /// Cancel intent recorded while a step was running; takes effect at the
    /// next step boundary.
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` follows an allowed edge.
    ///
    /// Staying in `Running` or `Cancelling` is allowed (step advancement).
    /// Terminal statuses have no outgoing edges.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Running | Cancelling | Completed | Failed | Cancelled) => true,
            (Cancelling, Cancelling | Cancelled | Completed | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Cancelling => "cancelling",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "cancelling" => Ok(WorkflowStatus::Cancelling),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

/// Delivery state of the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Not yet handed to the completion dispatcher.
    Undelivered,
    /// Claimed by a dispatcher; the callback is running or has run.
    Dispatching,
    /// The callback failed; the record is kept for inspection.
    CallbackFailed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Undelivered => "undelivered",
            DeliveryState::Dispatching => "dispatching",
            DeliveryState::CallbackFailed => "callback_failed",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undelivered" => Ok(DeliveryState::Undelivered),
            "dispatching" => Ok(DeliveryState::Dispatching),
            "callback_failed" => Ok(DeliveryState::CallbackFailed),
            other => Err(format!("invalid delivery state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Which layer a step failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step body reported an error.
    Application,
    /// The engine could not invoke the step (unknown handler, panicked task).
    Dispatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Application => write!(f, "application"),
            FailureKind::Dispatch => write!(f, "dispatch"),
        }
    }
}

/// A failed step's cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn application(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Dispatch,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { value: Value },
    Failed { failure: StepFailure },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

/// Journaled result of one executed step. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Zero-based step index.
    pub index: u32,
    /// Step name (denormalized for display).
    pub step_name: String,
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Terminal classification
// ---------------------------------------------------------------------------

/// Terminal result handed to the completion handler.
///
/// Serializes as `{"kind": "success", "returnValue": ..}`,
/// `{"kind": "failed", "error": ".."}` or `{"kind": "canceled"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowResult {
    Success {
        #[serde(rename = "returnValue")]
        return_value: Value,
    },
    Failed {
        error: String,
    },
    Canceled,
}

impl WorkflowResult {
    /// The `kind` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowResult::Success { .. } => "success",
            WorkflowResult::Failed { .. } => "failed",
            WorkflowResult::Canceled => "canceled",
        }
    }
}

/// Everything the completion dispatcher hands to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub workflow_id: Uuid,
    pub result: WorkflowResult,
    pub context: Value,
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition, as persisted in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 workflow id.
    pub id: Uuid,
    /// Snapshot of the definition this instance runs.
    pub definition: WorkflowDefinition,
    /// Workflow-level arguments given to `start`.
    #[serde(default)]
    pub args: Value,
    /// Index of the step at (or before) the current boundary. Only moves forward.
    pub current_step_index: u32,
    pub status: WorkflowStatus,
    /// One entry per executed step, in index order.
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// Set-once cancellation intent.
    pub cancel_requested: bool,
    pub on_complete: HandlerRef,
    /// Opaque payload passed through to the completion handler.
    #[serde(default)]
    pub context: Value,
    /// Terminal classification, set together with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
    pub delivery: DeliveryState,
    /// Error raised by the completion handler, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_error: Option<String>,
    /// Process currently holding the driver lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// When the driver lease lapses unless renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a new `Pending` instance.
    pub fn new(definition: WorkflowDefinition, args: Value, options: StartOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            definition,
            args,
            current_step_index: 0,
            status: WorkflowStatus::Pending,
            step_results: Vec::new(),
            cancel_requested: false,
            on_complete: options.on_complete,
            context: options.context,
            result: None,
            delivery: DeliveryState::Undelivered,
            callback_error: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `owner` may take (or keep) the driver lease at `now`: the
    /// lease is free, already held by `owner`, or has lapsed.
    pub fn lease_available_to(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (None, _) => true,
            (Some(holder), _) if holder == owner => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        }
    }

    /// The journaled result for a step index, if any.
    pub fn step_result(&self, index: u32) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.index == index)
    }

    /// Index the next journaled result must carry.
    pub fn next_result_index(&self) -> u32 {
        self.step_results.len() as u32
    }

    /// Derive the terminal classification from the status and step log.
    ///
    /// Returns `None` while the instance is not terminal.
    pub fn classify(&self) -> Option<WorkflowResult> {
        match self.status {
            WorkflowStatus::Completed => {
                let return_value = match self.step_results.last().map(|r| &r.outcome) {
                    Some(StepOutcome::Success { value }) => value.clone(),
                    _ => Value::Null,
                };
                Some(WorkflowResult::Success { return_value })
            }
            WorkflowStatus::Failed => {
                let error = self
                    .step_results
                    .iter()
                    .find_map(|r| match &r.outcome {
                        StepOutcome::Failed { failure } => Some(format!(
                            "step {} ('{}') failed: {failure}",
                            r.index, r.step_name
                        )),
                        StepOutcome::Success { .. } => None,
                    })
                    .unwrap_or_else(|| "workflow failed".to_string());
                Some(WorkflowResult::Failed { error })
            }
            WorkflowStatus::Cancelled => Some(WorkflowResult::Canceled),
            _ => None,
        }
    }

    /// Build the completion record from the stored (or derived) result.
    pub fn completion_record(&self) -> Option<CompletionRecord> {
        let result = self.result.clone().or_else(|| self.classify())?;
        Some(CompletionRecord {
            workflow_id: self.id,
            result,
            context: self.context.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_step() -> WorkflowDefinition {
        WorkflowDefinition::new("prep-run-wrap")
            .step(StepSpec::transactional("prep", "prep"))
            .step(StepSpec::durable_action("run", "run").with_args(json!({"secs": 5})))
            .step(StepSpec::transactional("wrap-up", "wrap_up"))
    }

    fn result(index: u32, name: &str, outcome: StepOutcome) -> StepResult {
        StepResult {
            index,
            step_name: name.to_string(),
            outcome,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn definition_validates() {
        assert!(three_step().validate().is_ok());
        assert_eq!(three_step().last_index(), Some(2));
    }

    #[test]
    fn empty_definition_rejected() {
        let err = WorkflowDefinition::new("empty").validate().unwrap_err();
        assert!(matches!(err, DefinitionError::NoSteps(_)));
        assert_eq!(WorkflowDefinition::new("x").last_index(), None);
    }

    #[test]
    fn duplicate_step_names_rejected() {
        let def = WorkflowDefinition::new("dup")
            .step(StepSpec::transactional("a", "h"))
            .step(StepSpec::transactional("a", "h"));
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::DuplicateStep(name)) if name == "a"
        ));
    }

    #[test]
    fn blank_handler_rejected() {
        let def = WorkflowDefinition::new("blank").step(StepSpec::transactional("a", " "));
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::MissingHandler { index: 0, .. })
        ));
    }

    #[test]
    fn status_edges() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Running.can_transition_to(Failed));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(!Cancelling.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Cancelling, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Cancelling,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<WorkflowStatus>().unwrap(), status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, json!(status.as_str()));
        }
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn workflow_result_wire_shape() {
        let success = WorkflowResult::Success {
            return_value: json!({"ok": true}),
        };
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({"kind": "success", "returnValue": {"ok": true}})
        );
        assert_eq!(
            serde_json::to_value(WorkflowResult::Canceled).unwrap(),
            json!({"kind": "canceled"})
        );
        let failed = WorkflowResult::Failed {
            error: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"kind": "failed", "error": "boom"})
        );
        assert_eq!(failed.kind(), "failed");
    }

    #[test]
    fn new_instance_is_pending() {
        let inst = WorkflowInstance::new(
            three_step(),
            json!({}),
            StartOptions::new("log").with_context(json!({"user": "a"})),
        );
        assert_eq!(inst.status, WorkflowStatus::Pending);
        assert_eq!(inst.current_step_index, 0);
        assert!(!inst.cancel_requested);
        assert_eq!(inst.delivery, DeliveryState::Undelivered);
        assert!(inst.classify().is_none());
        assert!(inst.completion_record().is_none());
    }

    #[test]
    fn classify_completed_uses_final_value() {
        let mut inst = WorkflowInstance::new(three_step(), Value::Null, StartOptions::new("log"));
        inst.step_results = vec![
            result(0, "prep", StepOutcome::Success { value: json!(1) }),
            result(1, "run", StepOutcome::Success { value: json!(2) }),
            result(2, "wrap-up", StepOutcome::Success { value: json!("done") }),
        ];
        inst.status = WorkflowStatus::Completed;
        assert_eq!(
            inst.classify(),
            Some(WorkflowResult::Success {
                return_value: json!("done")
            })
        );
    }

    #[test]
    fn classify_failed_names_failing_step() {
        let mut inst = WorkflowInstance::new(three_step(), Value::Null, StartOptions::new("log"));
        inst.step_results = vec![
            result(0, "prep", StepOutcome::Success { value: Value::Null }),
            result(
                1,
                "run",
                StepOutcome::Failed {
                    failure: StepFailure::application("disk full"),
                },
            ),
        ];
        inst.status = WorkflowStatus::Failed;
        let Some(WorkflowResult::Failed { error }) = inst.classify() else {
            panic!("expected failed classification");
        };
        assert!(error.contains("'run'"));
        assert!(error.contains("application error: disk full"));
    }

    #[test]
    fn classify_cancelled() {
        let mut inst = WorkflowInstance::new(three_step(), Value::Null, StartOptions::new("log"));
        inst.status = WorkflowStatus::Cancelled;
        let record = inst.completion_record().unwrap();
        assert_eq!(record.result, WorkflowResult::Canceled);
        assert_eq!(record.workflow_id, inst.id);
    }

    #[test]
    fn instance_json_roundtrip() {
        let inst = WorkflowInstance::new(three_step(), json!({"a": 1}), StartOptions::new("log"));
        let text = serde_json::to_string(&inst).unwrap();
        let back: WorkflowInstance = serde_json::from_str(&text).unwrap();
        assert_eq!(back, inst);
    }

    #[test]
    fn lease_availability() {
        let now = Utc::now();
        let mut inst = WorkflowInstance::new(three_step(), Value::Null, StartOptions::new("log"));
        assert!(inst.lease_available_to("a", now));

        inst.lease_owner = Some("a".to_string());
        inst.lease_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(inst.lease_available_to("a", now));
        assert!(!inst.lease_available_to("b", now));

        // Lapsed leases can be taken over.
        inst.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(inst.lease_available_to("b", now));
    }
}
