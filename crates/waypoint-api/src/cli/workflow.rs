//! Workflow inspection and control commands: status, list, cancel, cleanup,
//! recover.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use waypoint_core::repository::workflow::CancelOutcome;
use waypoint_types::workflow::{DeliveryState, StepOutcome, WorkflowInstance, WorkflowStatus};

use crate::state::AppState;

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .with_context(|| format!("Invalid workflow id '{raw}'"))
}

fn status_cell(status: WorkflowStatus) -> Cell {
    let color = match status {
        WorkflowStatus::Pending => Color::Grey,
        WorkflowStatus::Running => Color::Cyan,
        WorkflowStatus::Cancelling => Color::Yellow,
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Cancelled => Color::Magenta,
    };
    Cell::new(status).fg(color)
}

fn instance_json(instance: &WorkflowInstance) -> Result<serde_json::Value> {
    serde_json::to_value(instance).context("Failed to serialize workflow record")
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = parse_id(raw_id)?;
    let instance = state
        .manager
        .status(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflow: {e}"))?;

    let Some(instance) = instance else {
        if json {
            println!("{}", serde_json::json!({ "id": id, "found": false }));
        } else {
            println!();
            println!("  No record for workflow {id}.");
            println!(
                "  {}",
                style("Records are removed once their completion is delivered.").dim()
            );
            println!();
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&instance_json(&instance)?)?);
        return Ok(());
    }

    println!();
    println!(
        "  Workflow '{}' ({})",
        style(&instance.definition.name).cyan().bold(),
        instance.id
    );
    println!("  Status:   {}", instance.status);
    println!(
        "  Step:     {} of {}",
        instance.current_step_index + 1,
        instance.definition.steps.len()
    );
    if instance.cancel_requested {
        println!("  Cancel:   {}", style("requested").yellow());
    }
    println!("  Delivery: {}", instance.delivery);
    if let Some(err) = &instance.callback_error {
        println!("  Callback error: {}", style(err).red());
    }
    println!("  Created:  {}", instance.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Outcome"),
            Cell::new("Recorded"),
        ]);

    for (index, spec) in instance.definition.steps.iter().enumerate() {
        let (outcome, recorded) = match instance.step_result(index as u32) {
            Some(result) => {
                let outcome = match &result.outcome {
                    StepOutcome::Success { .. } => Cell::new("success").fg(Color::Green),
                    StepOutcome::Failed { failure } => Cell::new(failure).fg(Color::Red),
                };
                (outcome, result.recorded_at.format("%H:%M:%S").to_string())
            }
            None => (Cell::new("-").fg(Color::DarkGrey), String::new()),
        };
        table.add_row(vec![
            Cell::new(index),
            Cell::new(&spec.name),
            Cell::new(spec.kind),
            outcome,
            Cell::new(recorded),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list(state: &AppState, limit: u32, json: bool) -> Result<()> {
    let instances = state
        .manager
        .list(limit)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list workflows: {e}"))?;

    if json {
        let out = instances
            .iter()
            .map(|i| {
                serde_json::json!({
                    "id": i.id,
                    "name": i.definition.name,
                    "status": i.status,
                    "current_step_index": i.current_step_index,
                    "cancel_requested": i.cancel_requested,
                    "delivery": i.delivery,
                    "created_at": i.created_at.to_rfc3339(),
                })
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No workflow records.");
        println!("  Start one with: {}", style("wpt demo").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID"),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Delivery"),
            Cell::new("Created"),
        ]);

    for i in &instances {
        let delivery = match i.delivery {
            DeliveryState::CallbackFailed => Cell::new(i.delivery).fg(Color::Red),
            _ => Cell::new(i.delivery),
        };
        table.add_row(vec![
            Cell::new(i.id),
            Cell::new(&i.definition.name),
            status_cell(i.status),
            Cell::new(format!(
                "{}/{}",
                i.current_step_index + 1,
                i.definition.steps.len()
            )),
            delivery,
            Cell::new(i.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = parse_id(raw_id)?;
    let outcome = state
        .manager
        .cancel(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cancel workflow: {e}"))?;

    let label = match outcome {
        CancelOutcome::Recorded => "recorded",
        CancelOutcome::AlreadyRequested => "already_requested",
        CancelOutcome::AlreadyTerminal => "already_finished",
        CancelOutcome::NotFound => "not_found",
    };

    if json {
        println!("{}", serde_json::json!({ "id": id, "cancel": label }));
        return Ok(());
    }

    println!();
    match outcome {
        CancelOutcome::Recorded => {
            println!(
                "  {} Cancellation requested for {}",
                style("*").yellow().bold(),
                id
            );
            println!(
                "  {}",
                style("It takes effect at the workflow's next step boundary.").dim()
            );
        }
        CancelOutcome::AlreadyRequested => println!("  Cancellation was already requested for {id}."),
        CancelOutcome::AlreadyTerminal => println!("  Workflow {id} has already finished."),
        CancelOutcome::NotFound => println!("  No record for workflow {id}."),
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cleanup
// ---------------------------------------------------------------------------

pub async fn handle_cleanup(state: &AppState, raw_id: &str, json: bool) -> Result<()> {
    let id = parse_id(raw_id)?;
    let removed = state
        .manager
        .cleanup(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to clean up workflow: {e}"))?;

    if json {
        println!("{}", serde_json::json!({ "id": id, "removed": removed }));
    } else if removed {
        println!();
        println!("  {} Removed workflow {}", style("*").green().bold(), id);
        println!();
    } else {
        println!();
        println!("  Nothing to clean up for {id}.");
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn handle_recover(state: &AppState, json: bool) -> Result<()> {
    let resumed = state
        .manager
        .recover()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to recover workflows: {e}"))?;

    if !json {
        println!();
        println!(
            "  {} Resuming {} workflow(s)",
            style("*").cyan().bold(),
            resumed.len()
        );
        println!();
    }

    state.manager.wait_idle().await;

    if json {
        println!("{}", serde_json::json!({ "resumed": resumed }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        let id = Uuid::now_v7();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
        let err = parse_id("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("not-a-uuid"));
    }

    #[tokio::test]
    async fn test_commands_against_fresh_journal() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init_in(dir.path().to_path_buf(), true).await.unwrap();
        let id = Uuid::now_v7().to_string();

        handle_list(&state, 10, true).await.unwrap();
        handle_status(&state, &id, true).await.unwrap();
        handle_cancel(&state, &id, true).await.unwrap();
        handle_cleanup(&state, &id, true).await.unwrap();
        handle_recover(&state, true).await.unwrap();
        assert!(handle_status(&state, "bogus", true).await.is_err());
    }
}
