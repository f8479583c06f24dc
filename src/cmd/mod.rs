//! CLI command implementations.
//!
//! | Module   | Commands handled                  |
//! |----------|-----------------------------------|
//! | `run`    | `Run`, `Resume`                   |
//! | `status` | `Status`, `List`, `Show`, `Cancel` |

pub mod run;
pub mod status;

pub use run::{RunOverrides, cmd_resume, cmd_run, parse_item_list};
pub use status::{cmd_cancel, cmd_list, cmd_show, cmd_status};

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use phase_forge::collaborators::{
    AgentQaTracker, Collaborators, CommandTestRunner, CommandWorkerPool, FsSpecCatalog,
    JsonRoadmap, WorkerPool,
};
use phase_forge::config::ForgeConfig;
use phase_forge::execution::{
    ControllerSettings, EventBroadcaster, ExecutionController, SqliteStateStore,
};

/// A controller wired to the default adapters for one project.
pub struct Engine {
    pub config: ForgeConfig,
    pub controller: ExecutionController,
    pub roadmap: Arc<JsonRoadmap>,
}

impl Engine {
    pub async fn open(project_dir: PathBuf) -> Result<Self> {
        let config = ForgeConfig::new(project_dir)?;
        for warning in config.validate() {
            tracing::warn!("{}", warning);
        }

        let executor = config.executor();
        let store = Arc::new(SqliteStateStore::new(&config.db_path())?);
        let workers: Arc<dyn WorkerPool> = Arc::new(CommandWorkerPool::new(
            &config.project_dir,
            &config.claude_cmd(),
        ));
        let roadmap = Arc::new(JsonRoadmap::new(&config.roadmap_file()));
        let collaborators = Collaborators {
            workers: workers.clone(),
            qa: Arc::new(AgentQaTracker::new(
                workers,
                &config.qa_dir(),
                executor.poll_interval(),
            )),
            tests: Arc::new(CommandTestRunner::new(
                config.test_command(),
                executor.no_tests_patterns.clone(),
            )),
            specs: Arc::new(FsSpecCatalog::new(&config.specs_dir())),
            roadmap: roadmap.clone(),
        };

        let controller = ExecutionController::new(
            store,
            collaborators,
            EventBroadcaster::new(executor.event_capacity),
            ControllerSettings::from_config(&config),
        );
        controller.recover().await?;

        Ok(Self {
            config,
            controller,
            roadmap,
        })
    }
}
