//! `pingflow submit`.

use anyhow::{Context, Result};
use console::style;
use pingflow_types::event::Event;

use crate::state::AppState;

pub async fn submit(state: &AppState, name: &str, data: &str, key: Option<String>, json: bool) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let mut event = Event::from_json(name, payload, state.engine.now());
    if let Some(key) = key {
        event = event.with_idempotency_key(key);
    }

    let run_ids = state.engine.submit(event).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "event": name, "run_ids": run_ids }))?
        );
        return Ok(());
    }

    if run_ids.is_empty() {
        println!(
            "  {} No workflow listens to '{}'",
            style("-").dim(),
            style(name).yellow()
        );
        return Ok(());
    }

    println!();
    println!(
        "  {} Event '{}' accepted, {} run(s):",
        style("✓").green().bold(),
        style(name).cyan(),
        run_ids.len()
    );
    for id in &run_ids {
        println!("    {}", style(id).dim());
    }
    println!();
    Ok(())
}
