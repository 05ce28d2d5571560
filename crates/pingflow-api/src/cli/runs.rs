//! Run inspection: `pingflow run`, `pingflow runs`, `pingflow workflows`.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use pingflow_types::workflow::{RunFilter, RunState, TriggerConfig, WorkflowRun};
use uuid::Uuid;

use crate::http::handlers::workflows::workflow_summaries;
use crate::state::AppState;

fn state_cell(state: RunState) -> Cell {
    let color = match state {
        RunState::Pending => Color::Yellow,
        RunState::Running => Color::Blue,
        RunState::Sleeping => Color::Magenta,
        RunState::Completed => Color::Green,
        RunState::Failed => Color::Red,
    };
    Cell::new(state.as_str()).fg(color)
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Next time something will happen to the run, if it is waiting.
fn next_due(run: &WorkflowRun) -> String {
    run.wake_at
        .filter(|_| run.state == RunState::Sleeping)
        .or(run.retry_at)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub async fn show_run(state: &AppState, id: &str, json: bool) -> Result<()> {
    let Ok(run_id) = id.parse::<Uuid>() else {
        bail!("'{id}' is not a run id");
    };
    let Some(run) = state.engine.get_run(&run_id).await? else {
        bail!("run {run_id} not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style("Run").bold(), style(run.id).cyan());
    println!("  Workflow:  {}", run.definition_id);
    println!("  Trigger:   {}", run.trigger.label());
    println!("  State:     {}", run.state);
    println!("  Cursor:    {}", run.cursor);
    if run.attempt > 0 {
        println!("  Attempt:   {}", run.attempt);
    }
    if let Some(wake_at) = run.wake_at.filter(|_| run.state == RunState::Sleeping) {
        println!("  Wakes at:  {}", wake_at.to_rfc3339());
    }
    if let Some(retry_at) = run.retry_at {
        println!("  Retry at:  {}", retry_at.to_rfc3339());
    }
    if let Some(owner) = &run.lease_owner {
        println!("  Leased by: {owner}");
    }
    if let Some(error) = &run.error {
        println!("  Error:     {}", style(error).red());
    }
    println!("  Created:   {}", run.created_at.to_rfc3339());
    println!("  Updated:   {}", run.updated_at.to_rfc3339());

    if !run.step_memo.is_empty() {
        let mut memos: Vec<_> = run.step_memo.iter().collect();
        memos.sort_by_key(|(_, m)| m.completed_at);

        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Completed"),
                Cell::new("Result"),
            ]);
        for (name, memo) in memos {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(memo.completed_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                Cell::new(memo.result.to_string()),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

pub async fn list_runs(
    state: &AppState,
    run_state: Option<&str>,
    definition: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let run_state = match run_state {
        Some(s) => Some(s.parse::<RunState>().map_err(anyhow::Error::msg)?),
        None => None,
    };
    let filter = RunFilter { state: run_state, definition_id: definition };
    let runs = state.engine.list_runs(&filter, limit.max(1)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("  {}", style("No runs found.").dim());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("State"),
            Cell::new("Step"),
            Cell::new("Next"),
            Cell::new("Created"),
        ]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            Cell::new(&run.definition_id),
            state_cell(run.state),
            Cell::new(run.cursor),
            Cell::new(next_due(run)),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn list_workflows(state: &AppState, json: bool) -> Result<()> {
    let workflows = workflow_summaries(state);

    if json {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Trigger"),
            Cell::new("Steps"),
        ]);
    for wf in &workflows {
        let trigger = match &wf.trigger {
            TriggerConfig::Event { name } => format!("event {name}"),
            TriggerConfig::Cron { schedule, timezone } => {
                format!("cron {schedule} ({})", timezone.as_deref().unwrap_or("UTC"))
            }
        };
        table.add_row(vec![
            Cell::new(&wf.id),
            Cell::new(trigger),
            Cell::new(wf.steps.join(" → ")),
        ]);
    }
    println!("{table}");
    Ok(())
}
