//! Capabilities the execution controller consumes but does not implement.
//!
//! ## Module Map
//!
//! | Trait            | Default adapter      | Module        |
//! |------------------|----------------------|---------------|
//! | `WorkerPool`     | `CommandWorkerPool`  | `worker`      |
//! | `QaTracker`      | `AgentQaTracker`     | `qa`          |
//! | `TestRunner`     | `CommandTestRunner`  | `test_runner` |
//! | `SpecCatalog`    | `FsSpecCatalog`      | `specs`       |
//! | `RoadmapUpdater` | `JsonRoadmap`        | `roadmap`     |
//! | `PhaseSource`    | `JsonRoadmap`        | `roadmap`     |
//!
//! The controller only sees the traits, so tests swap every adapter for an
//! in-memory double.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::execution::models::WorkItem;

pub mod qa;
pub mod roadmap;
pub mod specs;
pub mod test_runner;
pub mod worker;

pub use qa::AgentQaTracker;
pub use roadmap::JsonRoadmap;
pub use specs::FsSpecCatalog;
pub use test_runner::CommandTestRunner;
pub use worker::CommandWorkerPool;

/// Role an agent assumes for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    SpecWriter,
    TaskPlanner,
    Coder,
    Reviewer,
    Fixer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecWriter => "spec_writer",
            Self::TaskPlanner => "task_planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Fixer => "fixer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spec_writer" => Ok(Self::SpecWriter),
            "task_planner" => Ok(Self::TaskPlanner),
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "fixer" => Ok(Self::Fixer),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

/// A unit of work handed to the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub role: AgentRole,
    pub execution_id: String,
    pub item_id: String,
    pub item_title: String,
    pub spec_id: Option<String>,
    /// Run the work in an isolated workspace instead of the project root.
    pub isolate: bool,
    /// Free-form instructions appended to the role prompt.
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Error { message: String },
    Cancelled,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Spawns and tracks the processes that run the coding agent.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Start a unit of work and return its handle.
    async fn spawn(&self, request: WorkRequest) -> Result<String>;

    async fn get(&self, handle: &str) -> Result<WorkerStatus>;

    async fn kill(&self, handle: &str) -> Result<()>;

    /// Resolve once the worker reaches a terminal status.
    ///
    /// The default polls [`WorkerPool::get`] every `poll_interval`; pools that
    /// can observe completion directly should override it.
    async fn wait(&self, handle: &str, poll_interval: Duration) -> Result<WorkerStatus> {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let status = self.get(handle).await?;
            if status.is_terminal() {
                return Ok(status);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaIssue {
    #[serde(default)]
    pub id: Option<String>,
    pub summary: String,
    #[serde(default)]
    pub severity: Option<String>,
}

/// Creates QA review sessions for a spec and reports what they found.
#[async_trait]
pub trait QaTracker: Send + Sync {
    async fn create_session(&self, execution_id: &str, spec_id: &str) -> Result<String>;

    /// Issues recorded for a session. Empty means the review passed.
    async fn get_issues(&self, session_id: &str) -> Result<Vec<QaIssue>>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the project's tests. "No tests found" counts as a pass.
    async fn run(&self, project_root: &Path) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecRequest {
    pub phase_id: String,
    pub item_id: String,
    pub item_title: String,
}

/// Specification documents and their task breakdowns.
#[async_trait]
pub trait SpecCatalog: Send + Sync {
    async fn create_spec(&self, request: &SpecRequest) -> Result<String>;

    async fn has_tasks(&self, spec_id: &str) -> Result<bool>;
}

/// Marks roadmap items done. Failures are logged by the caller and never fail a run.
#[async_trait]
pub trait RoadmapUpdater: Send + Sync {
    async fn mark_complete(&self, item_id: &str) -> Result<()>;
}

/// A roadmap phase as loaded by a [`PhaseSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub items: Vec<WorkItem>,
}

#[async_trait]
pub trait PhaseSource: Send + Sync {
    async fn load_phase(&self, phase_id: &str) -> Result<Option<Phase>>;
}

/// The full set of collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub workers: Arc<dyn WorkerPool>,
    pub qa: Arc<dyn QaTracker>,
    pub tests: Arc<dyn TestRunner>,
    pub specs: Arc<dyn SpecCatalog>,
    pub roadmap: Arc<dyn RoadmapUpdater>,
}
