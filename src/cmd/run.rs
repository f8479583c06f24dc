//! Phase execution from the terminal: `phase-forge run` and `phase-forge resume`.

use anyhow::Result;
use console::style;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};

use phase_forge::execution::{ExecutionEvent, ExecutionOptions, ExecutionStatus};

use super::Engine;

/// CLI flags layered over the `[defaults]` options from forge.toml.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub only: Option<HashSet<String>>,
    pub no_auto_specs: bool,
    pub no_auto_tasks: bool,
    pub qa: bool,
    pub max_qa_iterations: Option<u32>,
    pub stop_on_error: bool,
    pub isolate: bool,
}

impl RunOverrides {
    pub fn apply(self, mut options: ExecutionOptions) -> ExecutionOptions {
        if self.only.is_some() {
            options.selected_item_ids = self.only;
        }
        if self.no_auto_specs {
            options.auto_create_specs = false;
        }
        if self.no_auto_tasks {
            options.auto_create_tasks = false;
        }
        if self.qa {
            options.run_qa = true;
        }
        if let Some(max) = self.max_qa_iterations {
            options.max_qa_iterations = max;
        }
        if self.stop_on_error {
            options.stop_on_error = true;
        }
        if self.isolate {
            options.use_isolated_workspace = true;
        }
        options
    }
}

/// Parse a comma-separated item list, e.g. `"a, b,c"`.
pub fn parse_item_list(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

pub async fn cmd_run(project_dir: PathBuf, phase_id: &str, overrides: RunOverrides) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let options = overrides.apply(engine.config.options());

    let events = engine.controller.subscribe();
    let state = engine
        .controller
        .start_phase(engine.roadmap.as_ref(), phase_id, options)
        .await?;

    println!();
    println!(
        "{} {} ({})",
        style("Phase").bold(),
        style(&state.phase_title).cyan().bold(),
        state.phase_id
    );
    println!("Execution: {}", style(&state.id).dim());
    println!();

    stream_until_idle(&engine, events).await
}

pub async fn cmd_resume(project_dir: PathBuf) -> Result<()> {
    let engine = Engine::open(project_dir).await?;
    let events = engine.controller.subscribe();
    if !engine.controller.resume().await? {
        println!("No paused execution to resume.");
        return Ok(());
    }
    stream_until_idle(&engine, events).await
}

/// Print events until the control loop stops. The first Ctrl-C pauses the
/// run, the second cancels it.
async fn stream_until_idle(
    engine: &Engine,
    mut events: broadcast::Receiver<ExecutionEvent>,
) -> Result<()> {
    let controller = &engine.controller;
    let idle = controller.wait_for_loop();
    tokio::pin!(idle);
    let mut interrupts = 0u32;

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => println!("{}", render_event(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 && controller.pause().await? {
                    println!(
                        "{}",
                        style("Pausing after the current step. Press Ctrl-C again to cancel.").yellow()
                    );
                } else {
                    controller.cancel().await?;
                }
            }
            _ = &mut idle => break,
        }
    }

    while let Ok(event) = events.try_recv() {
        println!("{}", render_event(&event));
    }

    let Some(state) = controller.status().await else {
        return Ok(());
    };
    println!();
    match state.status {
        ExecutionStatus::Completed => {
            println!("{} {}% complete", style("Done.").green().bold(), state.progress);
        }
        ExecutionStatus::Paused => {
            println!(
                "{} Run 'phase-forge resume' to continue.",
                style("Paused.").yellow().bold()
            );
        }
        ExecutionStatus::Cancelled => println!("{}", style("Cancelled.").red().bold()),
        ExecutionStatus::Failed => {
            anyhow::bail!(
                "Execution {} failed: {}",
                state.id,
                state.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        ExecutionStatus::Running | ExecutionStatus::Pending => {
            println!("Execution {} is {}", state.id, state.status);
        }
    }
    Ok(())
}

pub fn render_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::Started { item_count, .. } => {
            format!("{} {} item(s)", style("▶ Started").bold(), item_count)
        }
        ExecutionEvent::Paused { .. } => format!("{}", style("⏸ Paused").yellow()),
        ExecutionEvent::Resumed { .. } => format!("{}", style("▶ Resumed").bold()),
        ExecutionEvent::Cancelled { .. } => format!("{}", style("■ Cancelled").red()),
        ExecutionEvent::ItemStarted {
            item_id,
            item_title,
            ..
        } => format!("  {} {}", style(item_title).yellow(), style(item_id).dim()),
        ExecutionEvent::ItemStep { step, .. } => {
            format!("    {} {}", style("→").dim(), style(step).dim())
        }
        ExecutionEvent::ItemCompleted {
            item_id, progress, ..
        } => format!(
            "  {} {} {}",
            style("✓").green(),
            item_id,
            style(format!("({}%)", progress)).cyan()
        ),
        ExecutionEvent::ItemFailed {
            item_id,
            error,
            progress,
            ..
        } => format!(
            "  {} {}: {} {}",
            style("✗").red(),
            item_id,
            style(error).red(),
            style(format!("({}%)", progress)).cyan()
        ),
        ExecutionEvent::Completed { progress, .. } => {
            format!("{} {}%", style("✓ Completed").green().bold(), progress)
        }
        ExecutionEvent::Failed { error, .. } => format!(
            "{} {}",
            style("✗ Failed").red().bold(),
            error.as_deref().unwrap_or_default()
        ),
    }
}
