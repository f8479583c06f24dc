//! Execution inspection and cancellation commands.

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use phase_forge::execution::{ExecutionState, ExecutionStatus, ItemStatus};

use super::Engine;

pub async fn cmd_status(project_dir: PathBuf) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let state = match engine.controller.status().await {
        Some(state) => Some(state),
        None => engine.controller.list(1).await?.into_iter().next(),
    };

    println!();
    match state {
        Some(state) => print_execution(&state),
        None => println!("No executions yet. Start one with 'phase-forge run <phase-id>'."),
    }
    println!();
    Ok(())
}

pub async fn cmd_list(project_dir: PathBuf, limit: usize) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let executions = engine.controller.list(limit).await?;

    println!();
    if executions.is_empty() {
        println!("No executions yet.");
        println!();
        return Ok(());
    }
    println!(
        "{:<36} {:<16} {:<10} {:>8} Started",
        "Execution", "Phase", "Status", "Progress"
    );
    println!(
        "{:<36} {:<16} {:<10} {:>8} -------",
        "-".repeat(36),
        "-".repeat(16),
        "------",
        "--------"
    );
    for state in &executions {
        println!(
            "{:<36} {:<16} {:<10} {:>7}% {}",
            state.id,
            state.phase_id,
            status_label(state.status),
            state.progress,
            state.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_show(project_dir: PathBuf, execution_id: &str) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let Some(state) = engine.controller.get(execution_id).await? else {
        anyhow::bail!("Execution {} not found", execution_id);
    };

    println!();
    print_execution(&state);
    println!();
    println!("{:<20} {:<16} {:>4}  Detail", "Item", "Status", "QA");
    for item in &state.items {
        let detail = item
            .error
            .clone()
            .or_else(|| item.spec_id.as_ref().map(|spec| format!("spec {}", spec)))
            .unwrap_or_default();
        println!(
            "{:<20} {:<16} {:>4}  {}",
            item.item_id,
            item_label(item.status),
            item.qa_iterations,
            detail
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_cancel(project_dir: PathBuf) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let Some(state) = engine.controller.status().await else {
        println!("No active execution.");
        return Ok(());
    };
    if engine.controller.cancel().await? {
        println!("Cancelled execution {}", state.id);
    } else {
        println!("Execution {} is already {}", state.id, state.status);
    }
    Ok(())
}

fn print_execution(state: &ExecutionState) {
    println!(
        "Execution {}  {}",
        style(&state.id).bold(),
        status_label(state.status)
    );
    println!("Phase:    {} ({})", state.phase_title, state.phase_id);
    println!(
        "Progress: {}% ({}/{} items)",
        state.progress,
        state.resolved_count(),
        state.items.len()
    );
    if let (Some(item), Some(step)) = (&state.current_item_id, state.current_step) {
        println!("Current:  {} {}", item, style(step).dim());
    }
    println!("Started:  {}", state.started_at.to_rfc3339());
    if let Some(completed_at) = state.completed_at {
        println!("Finished: {}", completed_at.to_rfc3339());
    }
    if let Some(error) = &state.error_message {
        println!("Error:    {}", style(error).red());
    }
}

fn status_label(status: ExecutionStatus) -> String {
    let label = style(status.as_str());
    let label = match status {
        ExecutionStatus::Completed => label.green(),
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => label.red(),
        ExecutionStatus::Running => label.cyan(),
        ExecutionStatus::Paused => label.yellow(),
        ExecutionStatus::Pending => label.dim(),
    };
    label.to_string()
}

fn item_label(status: ItemStatus) -> String {
    let label = style(status.as_str());
    let label = match status {
        ItemStatus::Completed => label.green(),
        ItemStatus::Failed => label.red(),
        ItemStatus::Pending => label.dim(),
        _ => label.yellow(),
    };
    label.to_string()
}
