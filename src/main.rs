use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "phase-forge")]
#[command(version, about = "Drive roadmap phases through spec, tasks, implementation, tests and QA")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute every eligible item of a roadmap phase
    Run {
        /// Phase id from .forge/roadmap.json
        phase_id: String,

        /// Run only these items (comma-separated ids)
        #[arg(long)]
        only: Option<String>,

        /// Fail items without a linked spec instead of creating one
        #[arg(long)]
        no_auto_specs: bool,

        /// Skip task breakdown generation
        #[arg(long)]
        no_auto_tasks: bool,

        /// Run the QA review/fix loop after tests
        #[arg(long)]
        qa: bool,

        /// Maximum QA fix cycles per item
        #[arg(long)]
        max_qa_iterations: Option<u32>,

        /// Stop the whole run on the first failed item
        #[arg(long)]
        stop_on_error: bool,

        /// Run coding agents in a git worktree per item
        #[arg(long)]
        isolate: bool,
    },
    /// Resume the paused or interrupted execution
    Resume,
    /// Show the active (or most recent) execution
    Status,
    /// List recent executions
    List {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Show one execution with per-item detail
    Show { execution_id: String },
    /// Cancel the active execution
    Cancel,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "phase_forge=debug"
    } else {
        "phase_forge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            phase_id,
            only,
            no_auto_specs,
            no_auto_tasks,
            qa,
            max_qa_iterations,
            stop_on_error,
            isolate,
        } => {
            let overrides = cmd::RunOverrides {
                only: only.as_deref().map(cmd::parse_item_list),
                no_auto_specs: *no_auto_specs,
                no_auto_tasks: *no_auto_tasks,
                qa: *qa,
                max_qa_iterations: *max_qa_iterations,
                stop_on_error: *stop_on_error,
                isolate: *isolate,
            };
            cmd::cmd_run(project_dir, phase_id, overrides).await?;
        }
        Commands::Resume => cmd::cmd_resume(project_dir).await?,
        Commands::Status => cmd::cmd_status(project_dir).await?,
        Commands::List { limit } => cmd::cmd_list(project_dir, *limit).await?,
        Commands::Show { execution_id } => cmd::cmd_show(project_dir, execution_id).await?,
        Commands::Cancel => cmd::cmd_cancel(project_dir).await?,
    }

    Ok(())
}
