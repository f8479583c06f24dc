//! In-memory collaborator doubles for controller tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::collaborators::{
    AgentRole, Collaborators, QaIssue, QaTracker, RoadmapUpdater, SpecCatalog, SpecRequest,
    TestRunner, WorkRequest, WorkerPool, WorkerStatus,
};

use super::controller::{ControllerSettings, ExecutionController};
use super::events::EventBroadcaster;
use super::models::{ExecutionConfig, ExecutionOptions, ExecutionState, WorkItem};
use super::store::{SqliteStateStore, StateStore};

#[derive(Default)]
struct PoolState {
    next: usize,
    requests: Vec<WorkRequest>,
    statuses: HashMap<String, WorkerStatus>,
    killed: Vec<String>,
}

/// Worker pool that finishes every request, optionally held back by a gate.
///
/// With a gate, `wait` blocks until the test adds a permit, one permit per
/// awaited worker.
pub struct FakeWorkerPool {
    gate: Option<Arc<Semaphore>>,
    failing: Mutex<HashSet<(String, AgentRole)>>,
    state: Mutex<PoolState>,
}

impl FakeWorkerPool {
    pub fn instant() -> Arc<Self> {
        Arc::new(Self {
            gate: None,
            failing: Mutex::new(HashSet::new()),
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let pool = Arc::new(Self {
            gate: Some(gate.clone()),
            failing: Mutex::new(HashSet::new()),
            state: Mutex::new(PoolState::default()),
        });
        (pool, gate)
    }

    /// Make every `role` worker for `item_id` end in an error.
    pub fn fail(&self, item_id: &str, role: AgentRole) {
        self.failing
            .lock()
            .unwrap()
            .insert((item_id.to_string(), role));
    }

    pub fn requests(&self) -> Vec<WorkRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn roles_for(&self, item_id: &str) -> Vec<AgentRole> {
        self.requests()
            .into_iter()
            .filter(|r| r.item_id == item_id)
            .map(|r| r.role)
            .collect()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    /// Poll until some request with `role` has been spawned and return its handle.
    pub async fn wait_for_spawn(&self, role: AgentRole) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(index) = self.requests().iter().position(|r| r.role == role) {
                return format!("w-{}", index + 1);
            }
            assert!(Instant::now() < deadline, "no {} worker spawned in time", role);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll until `handle` has been killed; kills may be issued from a spawned task.
    pub async fn wait_for_kill(&self, handle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.killed().iter().any(|h| h == handle) {
            assert!(Instant::now() < deadline, "{} was not killed in time", handle);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl WorkerPool for FakeWorkerPool {
    async fn spawn(&self, request: WorkRequest) -> Result<String> {
        let fails = self
            .failing
            .lock()
            .unwrap()
            .contains(&(request.item_id.clone(), request.role));
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let handle = format!("w-{}", state.next);
        let status = if fails {
            WorkerStatus::Error {
                message: "scripted failure".into(),
            }
        } else {
            WorkerStatus::Completed
        };
        state.statuses.insert(handle.clone(), status);
        state.requests.push(request);
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<WorkerStatus> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(handle)
            .cloned()
            .with_context(|| format!("Unknown worker handle {}", handle))
    }

    async fn kill(&self, handle: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(handle.to_string());
        state
            .statuses
            .insert(handle.to_string(), WorkerStatus::Cancelled);
        Ok(())
    }

    async fn wait(&self, handle: &str, _poll_interval: Duration) -> Result<WorkerStatus> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.context("gate closed")?.forget();
        }
        self.get(handle).await
    }
}

/// QA tracker that reports the same issues for every session.
#[derive(Default)]
pub struct FakeQaTracker {
    issues: Vec<QaIssue>,
    sessions: AtomicUsize,
}

impl FakeQaTracker {
    pub fn reporting(issues: Vec<QaIssue>) -> Self {
        Self {
            issues,
            sessions: AtomicUsize::new(0),
        }
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QaTracker for FakeQaTracker {
    async fn create_session(&self, _execution_id: &str, _spec_id: &str) -> Result<String> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("qa-{}", n))
    }

    async fn get_issues(&self, _session_id: &str) -> Result<Vec<QaIssue>> {
        Ok(self.issues.clone())
    }
}

pub fn issue(summary: &str) -> QaIssue {
    QaIssue {
        id: None,
        summary: summary.to_string(),
        severity: Some("high".into()),
    }
}

pub struct FakeTestRunner {
    passes: bool,
    runs: AtomicUsize,
}

impl FakeTestRunner {
    pub fn new(passes: bool) -> Self {
        Self {
            passes,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for FakeTestRunner {
    async fn run(&self, _project_root: &Path) -> Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.passes)
    }
}

pub struct FakeSpecCatalog {
    tasks_exist: bool,
    created: Mutex<Vec<String>>,
}

impl FakeSpecCatalog {
    pub fn new(tasks_exist: bool) -> Self {
        Self {
            tasks_exist,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpecCatalog for FakeSpecCatalog {
    async fn create_spec(&self, request: &SpecRequest) -> Result<String> {
        let spec_id = format!("{}-spec", request.item_id);
        self.created.lock().unwrap().push(spec_id.clone());
        Ok(spec_id)
    }

    async fn has_tasks(&self, _spec_id: &str) -> Result<bool> {
        Ok(self.tasks_exist)
    }
}

#[derive(Default)]
pub struct FakeRoadmap {
    completed: Mutex<Vec<String>>,
    fails: bool,
}

impl FakeRoadmap {
    pub fn failing() -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
            fails: true,
        }
    }

    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoadmapUpdater for FakeRoadmap {
    async fn mark_complete(&self, item_id: &str) -> Result<()> {
        if self.fails {
            anyhow::bail!("roadmap is read-only");
        }
        self.completed.lock().unwrap().push(item_id.to_string());
        Ok(())
    }
}

/// Knobs for [`Harness::build`].
pub struct HarnessConfig {
    pub workers: Arc<FakeWorkerPool>,
    pub qa_issues: Vec<QaIssue>,
    pub tests_pass: bool,
    pub tasks_exist: bool,
    pub roadmap: FakeRoadmap,
    pub store: Option<Arc<dyn StateStore>>,
    /// Replaces the fake QA tracker, e.g. with an `AgentQaTracker` over `workers`.
    pub qa: Option<Arc<dyn QaTracker>>,
    pub worker_timeout: Duration,
    pub qa_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            workers: FakeWorkerPool::instant(),
            qa_issues: Vec::new(),
            tests_pass: true,
            tasks_exist: true,
            roadmap: FakeRoadmap::default(),
            store: None,
            qa: None,
            worker_timeout: Duration::from_secs(10),
            qa_timeout: Duration::from_secs(10),
        }
    }
}

/// A controller wired to fakes, with handles to inspect each one.
pub struct Harness {
    pub controller: ExecutionController,
    pub store: Arc<dyn StateStore>,
    pub workers: Arc<FakeWorkerPool>,
    pub qa: Arc<FakeQaTracker>,
    pub tests: Arc<FakeTestRunner>,
    pub specs: Arc<FakeSpecCatalog>,
    pub roadmap: Arc<FakeRoadmap>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(HarnessConfig::default())
    }

    pub fn build(config: HarnessConfig) -> Self {
        let store: Arc<dyn StateStore> = match config.store {
            Some(store) => store,
            None => Arc::new(SqliteStateStore::new_in_memory().unwrap()),
        };
        let qa = Arc::new(FakeQaTracker::reporting(config.qa_issues));
        let tests = Arc::new(FakeTestRunner::new(config.tests_pass));
        let specs = Arc::new(FakeSpecCatalog::new(config.tasks_exist));
        let roadmap = Arc::new(config.roadmap);
        let collaborators = Collaborators {
            workers: config.workers.clone(),
            qa: config.qa.unwrap_or_else(|| qa.clone() as Arc<dyn QaTracker>),
            tests: tests.clone(),
            specs: specs.clone(),
            roadmap: roadmap.clone(),
        };
        let settings = ControllerSettings {
            project_root: PathBuf::from("."),
            worker_timeout: config.worker_timeout,
            test_timeout: Duration::from_secs(10),
            qa_timeout: config.qa_timeout,
            poll_interval: Duration::from_millis(5),
        };
        let controller = ExecutionController::new(
            store.clone(),
            collaborators,
            EventBroadcaster::new(256),
            settings,
        );
        Self {
            controller,
            store,
            workers: config.workers,
            qa,
            tests,
            specs,
            roadmap,
        }
    }
}

pub fn phase_config(items: Vec<WorkItem>, options: ExecutionOptions) -> ExecutionConfig {
    ExecutionConfig {
        phase_id: "phase-1".into(),
        phase_title: "Foundations".into(),
        items,
        options,
    }
}

/// Items pre-linked to specs, so runs go straight to execution.
pub fn linked_items(ids: &[&str]) -> Vec<WorkItem> {
    ids.iter()
        .map(|id| WorkItem::new(*id, format!("Item {}", id)).with_spec(format!("{}-spec", id)))
        .collect()
}

/// Poll the controller's tracked state until `pred` holds.
pub async fn wait_until<F>(controller: &ExecutionController, mut pred: F) -> ExecutionState
where
    F: FnMut(&ExecutionState) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(state) = controller.status().await
            && pred(&state)
        {
            return state;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
