//! The prep / run / wrap-up demo workflow and its handlers.
//!
//! `prep` and `wrap-up` are quick transactional steps. `run` is a durable
//! action that works for a configurable number of seconds, logging once per
//! second, and can be told to fail.

use std::time::Duration;

use console::style;
use serde::Deserialize;
use serde_json::{Value, json};
use waypoint_core::workflow::{
    CallbackError, CompletionRegistry, StepError, StepInput, StepRegistry, completion_fn, step_fn,
};
use waypoint_types::workflow::{CompletionRecord, StepSpec, WorkflowDefinition, WorkflowResult};

pub const WORKFLOW_NAME: &str = "prep-run-wrap";

/// Completion handler every demo instance reports to.
pub const COMPLETION_HANDLER: &str = "demo.report";

pub fn definition(run_secs: u64) -> WorkflowDefinition {
    WorkflowDefinition::new(WORKFLOW_NAME)
        .with_description("Prepare, run a long action, then wrap up")
        .step(StepSpec::transactional("prep", "demo.prep"))
        .step(StepSpec::durable_action("run", "demo.run").with_args(json!({ "secs": run_secs })))
        .step(StepSpec::transactional("wrap-up", "demo.wrap_up"))
}

/// Workflow-level arguments for a demo instance.
#[derive(Debug, Default, Deserialize)]
struct DemoArgs {
    #[serde(default)]
    fail_run: bool,
}

#[derive(Debug, Deserialize)]
struct RunArgs {
    #[serde(default)]
    secs: u64,
}

pub fn workflow_args(fail_run: bool) -> Value {
    json!({ "fail_run": fail_run })
}

/// Null workflow args mean no flags; anything else must parse.
fn demo_flags(input: &StepInput) -> Result<DemoArgs, StepError> {
    if input.workflow_args.is_null() {
        return Ok(DemoArgs::default());
    }
    serde_json::from_value(input.workflow_args.clone())
        .map_err(|e| StepError::InvalidArgs(format!("workflow args: {e}")))
}

pub fn step_registry() -> StepRegistry {
    StepRegistry::new()
        .with("demo.prep", step_fn(prep))
        .with("demo.run", step_fn(run))
        .with("demo.wrap_up", step_fn(wrap_up))
}

async fn prep(input: StepInput) -> Result<Value, StepError> {
    tracing::info!(workflow_id = %input.workflow_id, "prep: preparing workspace");
    Ok(json!({ "prepared": true, "key": input.idempotency_key }))
}

async fn run(input: StepInput) -> Result<Value, StepError> {
    let args: RunArgs = input.parse_args()?;
    let flags = demo_flags(&input)?;

    for elapsed in 1..=args.secs {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracing::info!(
            workflow_id = %input.workflow_id,
            elapsed_secs = elapsed,
            total_secs = args.secs,
            "run: working"
        );
    }

    if flags.fail_run {
        return Err(StepError::failed("run: simulated failure"));
    }
    Ok(json!({ "ran_secs": args.secs }))
}

async fn wrap_up(input: StepInput) -> Result<Value, StepError> {
    tracing::info!(workflow_id = %input.workflow_id, "wrap-up: tidying up");
    Ok(json!({ "wrapped": true, "workflow_id": input.workflow_id }))
}

pub fn completion_registry(json: bool) -> CompletionRegistry {
    CompletionRegistry::new().with(
        COMPLETION_HANDLER,
        completion_fn(move |record: CompletionRecord| async move {
            report(&record, json).map_err(|e| CallbackError::failed(e.to_string()))
        }),
    )
}

fn report(record: &CompletionRecord, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string(record)?);
        return Ok(());
    }

    let (mark, detail) = match &record.result {
        WorkflowResult::Success { return_value } => (
            style("*").green().bold(),
            format!("completed, returned {return_value}"),
        ),
        WorkflowResult::Failed { error } => (style("x").red().bold(), format!("failed: {error}")),
        WorkflowResult::Canceled => (style("-").yellow().bold(), "canceled".to_string()),
    };
    println!();
    println!("  {mark} Workflow {} {detail}", style(record.workflow_id).cyan());
    if !record.context.is_null() {
        println!("  Context: {}", record.context);
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::event::EventBus;
    use waypoint_core::repository::memory::MemoryJournal;
    use waypoint_core::workflow::WorkflowManager;
    use waypoint_types::event::WorkflowEvent;
    use uuid::Uuid;
    use waypoint_types::workflow::{StartOptions, WorkflowStatus};

    fn manager() -> WorkflowManager<MemoryJournal> {
        WorkflowManager::new(
            MemoryJournal::new(),
            step_registry(),
            completion_registry(true),
            EventBus::new(64),
        )
    }

    fn finished_status(
        rx: &mut tokio::sync::broadcast::Receiver<WorkflowEvent>,
    ) -> Option<WorkflowStatus> {
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::Finished { status, .. } = event {
                return Some(status);
            }
        }
        None
    }

    #[test]
    fn definition_is_valid() {
        let def = definition(3);
        def.validate().unwrap();
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[1].args, json!({ "secs": 3 }));
        for step in &def.steps {
            assert!(step_registry().contains(&step.handler));
        }
    }

    #[tokio::test]
    async fn demo_completes() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let id = manager
            .start(
                definition(0),
                workflow_args(false),
                StartOptions::new(COMPLETION_HANDLER),
            )
            .await
            .unwrap();
        manager.wait_idle().await;

        assert_eq!(finished_status(&mut rx), Some(WorkflowStatus::Completed));
        // Delivered, so the record is gone.
        assert!(manager.status(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn demo_fail_run_fails() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager
            .start(
                definition(0),
                workflow_args(true),
                StartOptions::new(COMPLETION_HANDLER),
            )
            .await
            .unwrap();
        manager.wait_idle().await;

        assert_eq!(finished_status(&mut rx), Some(WorkflowStatus::Failed));
    }

    #[tokio::test]
    async fn demo_cancel_during_run_skips_wrap_up() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let id = manager
            .start(
                definition(1),
                workflow_args(false),
                StartOptions::new(COMPLETION_HANDLER),
            )
            .await
            .unwrap();

        let mut dispatched = Vec::new();
        while let Ok(event) = rx.recv().await {
            if let WorkflowEvent::StepDispatched { step_name, .. } = event {
                let is_run = step_name == "run";
                dispatched.push(step_name);
                if is_run {
                    break;
                }
            }
        }
        manager.cancel(id).await.unwrap();
        manager.wait_idle().await;

        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkflowEvent::StepDispatched { step_name, .. } => dispatched.push(step_name),
                WorkflowEvent::Finished { status, .. } => finished = Some(status),
                _ => {}
            }
        }
        assert_eq!(dispatched, vec!["prep", "run"]);
        assert_eq!(finished, Some(WorkflowStatus::Cancelled));
    }

    #[tokio::test]
    async fn run_rejects_malformed_workflow_args() {
        let input = StepInput::new(
            Uuid::now_v7(),
            1,
            "run",
            json!({ "secs": 0 }),
            json!({ "fail_run": "yes" }),
        );
        let err = run(input).await.unwrap_err();
        assert!(matches!(err, StepError::InvalidArgs(ref msg) if msg.contains("workflow args")));

        let no_flags = StepInput::new(Uuid::now_v7(), 1, "run", json!({ "secs": 0 }), Value::Null);
        assert_eq!(run(no_flags).await.unwrap(), json!({ "ran_secs": 0 }));
    }

    #[tokio::test]
    async fn malformed_workflow_args_fail_the_workflow() {
        let manager = manager();
        let mut rx = manager.subscribe();
        manager
            .start(
                definition(0),
                json!({ "fail_run": "yes" }),
                StartOptions::new(COMPLETION_HANDLER),
            )
            .await
            .unwrap();
        manager.wait_idle().await;

        assert_eq!(finished_status(&mut rx), Some(WorkflowStatus::Failed));
    }
}
