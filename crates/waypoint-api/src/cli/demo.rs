//! `wpt demo`: start the prep / run / wrap-up workflow and follow it to the end.
//!
//! Optionally schedules a cancellation after a delay. Ctrl+C also requests
//! cancellation instead of killing the process, so the workflow still ends
//! through a step boundary and reports `canceled`.

use std::time::Duration;

use anyhow::Result;
use console::style;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use waypoint_core::event::WorkflowSubscription;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::StartOptions;

use crate::demo;
use crate::state::AppState;

pub async fn handle_demo(
    state: &AppState,
    run_secs: u64,
    cancel_after_ms: Option<u64>,
    fail_run: bool,
    json: bool,
) -> Result<()> {
    let manager = &state.manager;
    // Taken before `start` so the `started` event is not missed.
    let rx = manager.subscribe();

    if state.config.recover_on_start {
        let resumed = manager
            .recover()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to recover workflows: {e}"))?;
        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "resumed workflows from a previous run");
        }
    }

    let id = manager
        .start(
            demo::definition(run_secs),
            demo::workflow_args(fail_run),
            StartOptions::new(demo::COMPLETION_HANDLER).with_context(json!({ "source": "wpt demo" })),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start workflow: {e}"))?;
    // Recovered instances share the bus; print only this one.
    let mut events = WorkflowSubscription::new(rx, id);

    if !json {
        println!();
        println!(
            "  {} Started '{}' as {}",
            style("*").green().bold(),
            style(demo::WORKFLOW_NAME).cyan(),
            id
        );
        println!("  {}", style("Press Ctrl+C to request cancellation").dim());
        println!();
    }

    if let Some(ms) = cancel_after_ms {
        let manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Err(e) = manager.cancel(id).await {
                tracing::warn!(workflow_id = %id, error = %e, "scheduled cancel failed");
            }
        });
    }

    let idle = manager.wait_idle();
    tokio::pin!(idle);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut idle => break,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                manager
                    .cancel(id)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to cancel workflow: {e}"))?;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, json)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged");
                }
                Err(RecvError::Closed) => {}
            },
        }
    }

    while let Ok(event) = events.try_recv() {
        print_event(&event, json)?;
    }
    Ok(())
}

fn print_event(event: &WorkflowEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let line = match event {
        WorkflowEvent::Started { steps, .. } => format!("started ({steps} steps)"),
        WorkflowEvent::StepDispatched {
            index,
            step_name,
            kind,
            ..
        } => format!("step {index} '{step_name}' dispatched ({kind})"),
        WorkflowEvent::StepFinished {
            index,
            step_name,
            success,
            duration_ms,
            ..
        } => {
            let result = if *success {
                style("ok").green()
            } else {
                style("failed").red()
            };
            format!("step {index} '{step_name}' {result} in {duration_ms} ms")
        }
        WorkflowEvent::CancelRequested { .. } => {
            format!("{}", style("cancellation requested").yellow())
        }
        WorkflowEvent::Finished { status, .. } => format!("finished: {status}"),
        WorkflowEvent::CompletionDelivered { kind, .. } => format!("completion delivered ({kind})"),
        WorkflowEvent::CompletionFailed { error, .. } => {
            format!("{}", style(format!("completion callback failed: {error}")).red())
        }
        WorkflowEvent::CleanedUp { .. } => "record cleaned up".to_string(),
    };
    println!("  {} {line}", style(">").dim());
    Ok(())
}
