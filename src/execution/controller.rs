//! Execution controller: run-level state machine and the control loop.
//!
//! The controller tracks at most one run in its [`ActiveRunRegistry`]. A run's
//! control loop is a spawned task that walks the items in stored order and
//! drives each through its [`ItemPlan`]. Every state change is applied to a
//! copy of the tracked state under the registry lock, persisted, swapped in,
//! and only then published.
//!
//! Pause and cancel are flags the loop observes at safe points: before each
//! item and before the `spec_creating`, `tasks_creating` and `executing`
//! steps. Cancel additionally interrupts the loop's wait on an in-flight
//! external call, and kills recorded worker handles.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    AgentRole, Collaborators, PhaseSource, QaIssue, SpecRequest, WorkRequest, WorkerStatus,
};
use crate::config::ForgeConfig;
use crate::errors::{ExecutionError, ItemError};

use super::events::{EventBroadcaster, ExecutionEvent};
use super::models::{
    ExecutionConfig, ExecutionOptions, ExecutionState, ExecutionStatus, ItemState, ItemStatus,
};
use super::plan::{ItemPlan, PlanStep, is_valid_item_transition};
use super::registry::{ActiveRunRegistry, TrackedRun};
use super::store::StateStore;

/// Timeouts and paths the control loop runs with.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub project_root: PathBuf,
    pub worker_timeout: Duration,
    pub test_timeout: Duration,
    pub qa_timeout: Duration,
    pub poll_interval: Duration,
}

impl ControllerSettings {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            worker_timeout: Duration::from_secs(30 * 60),
            test_timeout: Duration::from_secs(5 * 60),
            qa_timeout: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &ForgeConfig) -> Self {
        let executor = config.executor();
        Self {
            project_root: config.project_dir.clone(),
            worker_timeout: executor.worker_timeout(),
            test_timeout: executor.test_timeout(),
            qa_timeout: executor.qa_timeout(),
            poll_interval: executor.poll_interval(),
        }
    }
}

/// Why driving a run stopped before its natural end.
enum Interrupt {
    /// Cancel or pause observed. The run record already says so.
    Halt,
    /// The current item failed.
    Item(ItemError),
    /// The loop itself cannot continue, e.g. the store rejected a write.
    Fatal(anyhow::Error),
}

impl From<ItemError> for Interrupt {
    fn from(err: ItemError) -> Self {
        Self::Item(err)
    }
}

impl From<anyhow::Error> for Interrupt {
    fn from(err: anyhow::Error) -> Self {
        Self::Fatal(err)
    }
}

/// What one launched control loop needs to know about its run.
struct RunCtx {
    execution_id: String,
    phase_id: String,
    options: ExecutionOptions,
    generation: u64,
    cancel: CancellationToken,
}

struct Inner {
    store: Arc<dyn StateStore>,
    collaborators: Collaborators,
    events: EventBroadcaster,
    registry: ActiveRunRegistry,
    settings: ControllerSettings,
}

#[derive(Clone)]
pub struct ExecutionController {
    inner: Arc<Inner>,
}

impl ExecutionController {
    pub fn new(
        store: Arc<dyn StateStore>,
        collaborators: Collaborators,
        events: EventBroadcaster,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                collaborators,
                events,
                registry: ActiveRunRegistry::new(),
                settings,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Re-discover the most recent running or paused record from the store and
    /// track it. The loop is not restarted; call [`resume`](Self::resume) for that.
    pub async fn recover(&self) -> Result<Option<ExecutionState>, ExecutionError> {
        let active = self
            .inner
            .store
            .find_active()
            .await
            .map_err(ExecutionError::Store)?;

        let mut slot = self.inner.registry.lock().await;
        if let Some(run) = slot.as_ref()
            && run.state.status.is_active()
        {
            return Ok(Some(run.state.clone()));
        }
        if let Some(state) = &active {
            tracing::info!(
                execution_id = %state.id,
                status = %state.status,
                step = ?state.current_step,
                "recovered active execution"
            );
            *slot = Some(TrackedRun::recovered(state.clone()));
        }
        Ok(active)
    }

    /// Submit a run. Returns once the initial state is persisted; the control
    /// loop runs in the background.
    pub async fn start(&self, config: ExecutionConfig) -> Result<ExecutionState, ExecutionError> {
        let mut slot = self.inner.registry.lock().await;
        if let Some(run) = slot.as_ref()
            && run.state.status.is_active()
        {
            return Err(ExecutionError::AlreadyRunning {
                execution_id: run.state.id.clone(),
            });
        }

        let eligible = config.eligible_items();
        if eligible.is_empty() {
            return Err(ExecutionError::NoEligibleItems {
                phase_id: config.phase_id.clone(),
            });
        }

        let mut state = ExecutionState::new(&config, &eligible);
        state.status = ExecutionStatus::Running;
        self.inner
            .store
            .save(&mut state)
            .await
            .map_err(ExecutionError::Store)?;

        let mut run = TrackedRun::new(state.clone());
        let generation = run.begin_loop();
        let cancel = run.control.cancel.clone();
        *slot = Some(run);

        tracing::info!(
            execution_id = %state.id,
            phase_id = %state.phase_id,
            items = state.items.len(),
            "execution started"
        );
        self.inner.events.publish(ExecutionEvent::Started {
            execution_id: state.id.clone(),
            phase_id: state.phase_id.clone(),
            item_count: state.items.len(),
        });
        self.launch(&state, generation, cancel);
        Ok(state)
    }

    /// Load a phase from `source` and start it.
    pub async fn start_phase(
        &self,
        source: &dyn PhaseSource,
        phase_id: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionState, ExecutionError> {
        let phase = source
            .load_phase(phase_id)
            .await?
            .ok_or_else(|| ExecutionError::PhaseNotFound {
                phase_id: phase_id.to_string(),
            })?;
        self.start(ExecutionConfig {
            phase_id: phase.id,
            phase_title: phase.title,
            items: phase.items,
            options,
        })
        .await
    }

    /// Ask the loop to stop at its next safe point. `false` unless running.
    pub async fn pause(&self) -> Result<bool, ExecutionError> {
        let mut slot = self.inner.registry.lock().await;
        let Some(run) = slot.as_mut() else {
            return Ok(false);
        };
        if run.state.status != ExecutionStatus::Running {
            return Ok(false);
        }

        let execution_id = run.state.id.clone();
        let event_id = execution_id.clone();
        run.paused = true;
        if let Err(e) = self
            .apply(run, move |state| {
                state.status = ExecutionStatus::Paused;
                Ok(Some(ExecutionEvent::Paused {
                    execution_id: event_id,
                }))
            })
            .await
        {
            run.paused = false;
            return Err(ExecutionError::Store(e));
        }

        tracing::info!(execution_id = %execution_id, "execution paused");
        Ok(true)
    }

    /// Continue a paused run from its first unresolved item. Also accepts a
    /// recovered `running` record that has no loop behind it.
    pub async fn resume(&self) -> Result<bool, ExecutionError> {
        let mut slot = self.inner.registry.lock().await;
        let Some(run) = slot.as_mut() else {
            return Ok(false);
        };
        let orphaned = run.state.status == ExecutionStatus::Running && !run.loop_alive();
        if run.state.status != ExecutionStatus::Paused && !orphaned {
            return Ok(false);
        }

        let was_paused = run.paused;
        let event_id = run.state.id.clone();
        run.paused = false;
        if let Err(e) = self
            .apply(run, move |state| {
                state.status = ExecutionStatus::Running;
                Ok(Some(ExecutionEvent::Resumed {
                    execution_id: event_id,
                }))
            })
            .await
        {
            run.paused = was_paused;
            return Err(ExecutionError::Store(e));
        }

        if !run.loop_alive() {
            let generation = run.begin_loop();
            let cancel = run.control.cancel.clone();
            let state = run.state.clone();
            self.launch(&state, generation, cancel);
        }
        tracing::info!(execution_id = %run.state.id, "execution resumed");
        Ok(true)
    }

    /// Cancel the tracked run. `false` when there is none or it already ended.
    pub async fn cancel(&self) -> Result<bool, ExecutionError> {
        let mut slot = self.inner.registry.lock().await;
        let Some(run) = slot.as_mut() else {
            return Ok(false);
        };
        if run.state.status.is_terminal() {
            return Ok(false);
        }

        run.control.cancel.cancel();
        let handles = run.state.in_flight_handles();
        self.apply(run, |state| {
            state.status = ExecutionStatus::Cancelled;
            state.completed_at = Some(Utc::now());
            Ok(None)
        })
        .await
        .map_err(ExecutionError::Store)?;
        if !run.loop_alive() {
            run.end_loop();
        }
        let execution_id = run.state.id.clone();
        drop(slot);

        for handle in handles {
            self.kill_worker(&handle).await;
        }
        tracing::info!(execution_id = %execution_id, "execution cancelled");
        self.inner
            .events
            .publish(ExecutionEvent::Cancelled { execution_id });
        Ok(true)
    }

    /// The tracked run's latest persisted state, terminal or not.
    pub async fn status(&self) -> Option<ExecutionState> {
        self.inner.registry.snapshot().await
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<ExecutionState>, ExecutionError> {
        if let Some(state) = self.status().await
            && state.id == execution_id
        {
            return Ok(Some(state));
        }
        self.inner
            .store
            .get(execution_id)
            .await
            .map_err(ExecutionError::Store)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<ExecutionState>, ExecutionError> {
        self.inner
            .store
            .list(limit)
            .await
            .map_err(ExecutionError::Store)
    }

    /// Resolve once no control loop is driving the tracked run.
    pub async fn wait_for_loop(&self) {
        if let Some(control) = self.inner.registry.control().await {
            control.wait_idle().await;
        }
    }

    // ── Loop lifecycle ───────────────────────────────────────────────

    /// Spawn the control loop. Errors and panics inside it end up on the
    /// run-level fatal path in [`finish_loop`](Self::finish_loop).
    fn launch(&self, state: &ExecutionState, generation: u64, cancel: CancellationToken) {
        let ctx = RunCtx {
            execution_id: state.id.clone(),
            phase_id: state.phase_id.clone(),
            options: state.options.clone(),
            generation,
            cancel,
        };
        let controller = self.clone();
        tokio::spawn(async move {
            let execution_id = ctx.execution_id.clone();
            let looper = controller.clone();
            let outcome = tokio::spawn(async move { looper.run_loop(ctx).await }).await;
            let fatal = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(join_err) => Some(format!("Control loop panicked: {}", join_err)),
            };
            controller
                .finish_loop(&execution_id, generation, fatal)
                .await;
        });
    }

    async fn finish_loop(&self, execution_id: &str, generation: u64, fatal: Option<String>) {
        let mut slot = self.inner.registry.lock().await;
        let Some(run) = slot
            .as_mut()
            .filter(|run| run.state.id == execution_id && run.generation() == generation)
        else {
            return;
        };

        if let Some(error) = fatal {
            tracing::error!(execution_id, error = %error, "control loop failed");
            if !run.state.status.is_terminal() {
                let message = error.clone();
                let event_id = execution_id.to_string();
                let persisted = self
                    .apply(run, move |state| {
                        mark_run_failed(state, message.clone());
                        Ok(Some(ExecutionEvent::Failed {
                            execution_id: event_id,
                            error: Some(message),
                        }))
                    })
                    .await;
                if let Err(e) = persisted {
                    tracing::error!(
                        execution_id,
                        error = %format!("{:#}", e),
                        "failed to persist fatal run state"
                    );
                    mark_run_failed(&mut run.state, error.clone());
                    self.inner.events.publish(ExecutionEvent::Failed {
                        execution_id: execution_id.to_string(),
                        error: Some(error),
                    });
                }
            }
        }

        if run.loop_alive() {
            run.end_loop();
        }
    }

    async fn run_loop(&self, ctx: RunCtx) -> Result<()> {
        match self.drive_run(&ctx).await {
            Ok(()) | Err(Interrupt::Halt) => Ok(()),
            Err(Interrupt::Fatal(e)) => Err(e),
            Err(Interrupt::Item(e)) => Err(anyhow::anyhow!(e)),
        }
    }

    async fn drive_run(&self, ctx: &RunCtx) -> Result<(), Interrupt> {
        while let Some(index) = self.checkpoint(ctx).await? {
            match self.drive_item(ctx, index).await {
                Ok(()) => self.complete_item(ctx, index).await?,
                Err(Interrupt::Item(error)) => {
                    self.fail_item(ctx, index, &error).await?;
                    if ctx.options.stop_on_error {
                        return self.abort_run(ctx, index, &error).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        self.finalize(ctx).await
    }

    // ── Registry access ──────────────────────────────────────────────

    /// The tracked run, if it is still the one this loop was launched for.
    fn owned_run<'a>(
        slot: &'a mut Option<TrackedRun>,
        ctx: &RunCtx,
    ) -> Result<&'a mut TrackedRun, Interrupt> {
        match slot.as_mut() {
            Some(run) if run.state.id == ctx.execution_id && run.generation() == ctx.generation => {
                if run.state.status.is_terminal() {
                    run.end_loop();
                    return Err(Interrupt::Halt);
                }
                Ok(run)
            }
            _ => Err(Interrupt::Halt),
        }
    }

    /// Safe point. Halts on cancel or pause, otherwise returns the index of the
    /// first unresolved item.
    async fn checkpoint(&self, ctx: &RunCtx) -> Result<Option<usize>, Interrupt> {
        let mut slot = self.inner.registry.lock().await;
        let run = Self::owned_run(&mut slot, ctx)?;
        if ctx.cancel.is_cancelled() {
            run.end_loop();
            return Err(Interrupt::Halt);
        }
        if run.paused {
            tracing::info!(
                execution_id = %ctx.execution_id,
                item_id = ?run.state.current_item_id,
                "stopped at safe point"
            );
            run.end_loop();
            return Err(Interrupt::Halt);
        }
        Ok(run.state.first_unresolved())
    }

    async fn commit<F>(&self, ctx: &RunCtx, mutate: F) -> Result<(), Interrupt>
    where
        F: FnOnce(&mut ExecutionState) -> Result<Option<ExecutionEvent>> + Send,
    {
        let mut slot = self.inner.registry.lock().await;
        let run = Self::owned_run(&mut slot, ctx)?;
        self.apply(run, mutate).await?;
        Ok(())
    }

    /// Mutate a copy of the run's state, persist it, swap it in, then publish.
    async fn apply<F>(&self, run: &mut TrackedRun, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ExecutionState) -> Result<Option<ExecutionEvent>> + Send,
    {
        let mut next = run.state.clone();
        let event = mutate(&mut next)?;
        self.inner
            .store
            .save(&mut next)
            .await
            .context("Failed to persist execution state")?;
        run.state = next;
        if let Some(event) = event {
            self.inner.events.publish(event);
        }
        Ok(())
    }

    async fn item_snapshot(&self, ctx: &RunCtx, index: usize) -> Result<ItemState, Interrupt> {
        let mut slot = self.inner.registry.lock().await;
        let run = Self::owned_run(&mut slot, ctx)?;
        Ok(run
            .state
            .item(index)
            .cloned()
            .with_context(|| format!("Item index {} out of range", index))?)
    }

    /// Move an item to `step`, recording it as the run's current step.
    async fn set_step<F>(
        &self,
        ctx: &RunCtx,
        index: usize,
        step: ItemStatus,
        update: F,
    ) -> Result<(), Interrupt>
    where
        F: FnOnce(&mut ItemState) + Send,
    {
        let execution_id = ctx.execution_id.clone();
        self.commit(ctx, move |state| {
            let item = item_mut(state, index)?;
            if !is_valid_item_transition(item.status, step) {
                anyhow::bail!(
                    "Invalid transition for item {}: {} -> {}",
                    item.item_id,
                    item.status,
                    step
                );
            }
            item.status = step;
            update(item);
            let item_id = item.item_id.clone();
            tracing::debug!(execution_id = %execution_id, item_id = %item_id, step = %step, "item step");
            state.current_step = Some(step);
            Ok(Some(ExecutionEvent::ItemStep {
                execution_id,
                item_id,
                step,
            }))
        })
        .await
    }

    // ── Items ────────────────────────────────────────────────────────

    async fn drive_item(&self, ctx: &RunCtx, index: usize) -> Result<(), Interrupt> {
        let execution_id = ctx.execution_id.clone();
        self.commit(ctx, move |state| {
            let item = item_mut(state, index)?;
            if item.started_at.is_none() {
                item.started_at = Some(Utc::now());
            }
            let item_id = item.item_id.clone();
            let item_title = item.item_title.clone();
            let step = item.status;
            state.current_item_id = Some(item_id.clone());
            state.current_step = Some(step);
            Ok(Some(ExecutionEvent::ItemStarted {
                execution_id,
                item_id,
                item_title,
            }))
        })
        .await?;

        let item = self.item_snapshot(ctx, index).await?;
        let tasks_exist = match &item.spec_id {
            Some(spec_id) if ctx.options.auto_create_tasks => self.tasks_exist(spec_id).await,
            _ => false,
        };
        let plan = ItemPlan::derive(&ctx.options, &item, tasks_exist)?;
        tracing::info!(
            execution_id = %ctx.execution_id,
            item_id = %item.item_id,
            resumed_from = %item.status,
            steps = ?plan.steps(),
            "driving item"
        );

        let mut tests_passed = false;
        for step in plan.steps() {
            if step.is_safe_point() {
                self.checkpoint(ctx).await?;
            }
            match step {
                PlanStep::CreateSpec => self.create_spec(ctx, index).await?,
                PlanStep::CreateTasks => self.create_tasks(ctx, index).await?,
                PlanStep::Execute => self.execute(ctx, index).await?,
                PlanStep::Test => {
                    tests_passed = self.test(ctx, index).await?;
                    if !tests_passed && !plan.contains(PlanStep::QaLoop) {
                        return Err(ItemError::TestsFailed.into());
                    }
                }
                PlanStep::QaLoop => self.qa_loop(ctx, index, tests_passed).await?,
            }
        }
        Ok(())
    }

    async fn tasks_exist(&self, spec_id: &str) -> bool {
        match self.inner.collaborators.specs.has_tasks(spec_id).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(spec_id, error = %format!("{:#}", e), "could not check for tasks");
                false
            }
        }
    }

    async fn create_spec(&self, ctx: &RunCtx, index: usize) -> Result<(), Interrupt> {
        self.set_step(ctx, index, ItemStatus::SpecCreating, |_| {})
            .await?;
        let item = self.item_snapshot(ctx, index).await?;
        let request = SpecRequest {
            phase_id: ctx.phase_id.clone(),
            item_id: item.item_id.clone(),
            item_title: item.item_title.clone(),
        };
        let created = self
            .guarded(
                ctx,
                self.inner.settings.worker_timeout,
                self.inner.collaborators.specs.create_spec(&request),
            )
            .await?;
        let spec_id = match created {
            None => return Err(ItemError::SpecCreation("timed out".into()).into()),
            Some(Err(e)) => return Err(ItemError::SpecCreation(format!("{:#}", e)).into()),
            Some(Ok(spec_id)) => spec_id,
        };

        self.run_worker(
            ctx,
            index,
            AgentRole::SpecWriter,
            Some(spec_id.clone()),
            String::new(),
        )
        .await?;
        self.set_step(ctx, index, ItemStatus::SpecCreated, move |item| {
            item.spec_id = Some(spec_id)
        })
        .await
    }

    async fn create_tasks(&self, ctx: &RunCtx, index: usize) -> Result<(), Interrupt> {
        self.set_step(ctx, index, ItemStatus::TasksCreating, |_| {})
            .await?;
        self.run_worker(ctx, index, AgentRole::TaskPlanner, None, String::new())
            .await?;
        self.set_step(ctx, index, ItemStatus::TasksCreated, |_| {})
            .await
    }

    async fn execute(&self, ctx: &RunCtx, index: usize) -> Result<(), Interrupt> {
        self.set_step(ctx, index, ItemStatus::Executing, |_| {})
            .await?;
        self.run_worker(ctx, index, AgentRole::Coder, None, String::new())
            .await
    }

    async fn test(&self, ctx: &RunCtx, index: usize) -> Result<bool, Interrupt> {
        self.set_step(ctx, index, ItemStatus::Testing, |_| {})
            .await?;
        let outcome = self
            .guarded(
                ctx,
                self.inner.settings.test_timeout,
                self.inner
                    .collaborators
                    .tests
                    .run(&self.inner.settings.project_root),
            )
            .await?;
        match outcome {
            None => Err(ItemError::TestTimeout {
                timeout_secs: self.inner.settings.test_timeout.as_secs(),
            }
            .into()),
            Some(Err(e)) => Err(ItemError::TestRunner(format!("{:#}", e)).into()),
            Some(Ok(passed)) => {
                tracing::debug!(execution_id = %ctx.execution_id, passed, "test run finished");
                Ok(passed)
            }
        }
    }

    /// Review → fix → retest until a review comes back clean. At most
    /// `max_qa_iterations` fix cycles run and the last fix is re-reviewed
    /// before the item is failed.
    async fn qa_loop(
        &self,
        ctx: &RunCtx,
        index: usize,
        mut tests_passed: bool,
    ) -> Result<(), Interrupt> {
        let item = self.item_snapshot(ctx, index).await?;
        let spec_id = item.spec_id.clone().ok_or(ItemError::SpecMissing)?;
        let max_iterations = ctx.options.max_qa_iterations;
        let mut iterations = item.qa_iterations;
        if max_iterations == 0 {
            return Err(ItemError::QaExhausted { iterations }.into());
        }

        loop {
            self.set_step(ctx, index, ItemStatus::QaReviewing, |_| {})
                .await?;
            let issues = self.review(ctx, index, &spec_id).await?;
            if issues.is_empty() {
                return Ok(());
            }
            if iterations >= max_iterations {
                return Err(ItemError::QaExhausted { iterations }.into());
            }

            iterations += 1;
            self.set_step(ctx, index, ItemStatus::QaFixing, move |item| {
                item.qa_iterations = iterations
            })
            .await?;
            self.run_worker(
                ctx,
                index,
                AgentRole::Fixer,
                None,
                fix_context(&issues, tests_passed),
            )
            .await?;
            tests_passed = self.test(ctx, index).await?;
        }
    }

    async fn review(
        &self,
        ctx: &RunCtx,
        index: usize,
        spec_id: &str,
    ) -> Result<Vec<QaIssue>, Interrupt> {
        let qa = &self.inner.collaborators.qa;
        let limit = self.inner.settings.qa_timeout;
        let timed_out = || ItemError::QaTimeout {
            timeout_secs: limit.as_secs(),
        };

        let session_id = match self
            .guarded(ctx, limit, qa.create_session(&ctx.execution_id, spec_id))
            .await?
        {
            None => return Err(timed_out().into()),
            Some(Err(e)) => return Err(ItemError::QaTracker(format!("{:#}", e)).into()),
            Some(Ok(session_id)) => session_id,
        };
        let recorded = session_id.clone();
        self.commit(ctx, move |state| {
            item_mut(state, index)?.qa_session_id = Some(recorded);
            Ok(None)
        })
        .await?;

        match self.guarded(ctx, limit, qa.get_issues(&session_id)).await? {
            None => Err(timed_out().into()),
            Some(Err(e)) => Err(ItemError::QaTracker(format!("{:#}", e)).into()),
            Some(Ok(issues)) => {
                tracing::debug!(
                    execution_id = %ctx.execution_id,
                    session_id = %session_id,
                    issues = issues.len(),
                    "QA review finished"
                );
                Ok(issues)
            }
        }
    }

    async fn complete_item(&self, ctx: &RunCtx, index: usize) -> Result<(), Interrupt> {
        let item = self.item_snapshot(ctx, index).await?;
        let execution_id = ctx.execution_id.clone();
        self.commit(ctx, move |state| {
            let item = item_mut(state, index)?;
            if !is_valid_item_transition(item.status, ItemStatus::Completed) {
                anyhow::bail!(
                    "Invalid transition for item {}: {} -> completed",
                    item.item_id,
                    item.status
                );
            }
            item.status = ItemStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.error = None;
            let item_id = item.item_id.clone();
            state.current_step = Some(ItemStatus::Completed);
            state.recompute_progress();
            Ok(Some(ExecutionEvent::ItemCompleted {
                execution_id,
                item_id,
                progress: state.progress,
            }))
        })
        .await?;
        tracing::info!(execution_id = %ctx.execution_id, item_id = %item.item_id, "item completed");

        if let Err(e) = self
            .inner
            .collaborators
            .roadmap
            .mark_complete(&item.item_id)
            .await
        {
            tracing::warn!(
                item_id = %item.item_id,
                error = %format!("{:#}", e),
                "failed to update roadmap"
            );
        }
        Ok(())
    }

    async fn fail_item(
        &self,
        ctx: &RunCtx,
        index: usize,
        error: &ItemError,
    ) -> Result<(), Interrupt> {
        let message = error.to_string();
        let execution_id = ctx.execution_id.clone();
        self.commit(ctx, move |state| {
            let item = item_mut(state, index)?;
            item.status = ItemStatus::Failed;
            item.error = Some(message.clone());
            item.completed_at = Some(Utc::now());
            let item_id = item.item_id.clone();
            tracing::warn!(execution_id = %execution_id, item_id = %item_id, error = %message, "item failed");
            state.current_step = Some(ItemStatus::Failed);
            state.recompute_progress();
            Ok(Some(ExecutionEvent::ItemFailed {
                execution_id,
                item_id,
                error: message,
                progress: state.progress,
            }))
        })
        .await
    }

    /// `stop_on_error`: end the whole run as failed after an item failure.
    async fn abort_run(
        &self,
        ctx: &RunCtx,
        index: usize,
        error: &ItemError,
    ) -> Result<(), Interrupt> {
        let item = self.item_snapshot(ctx, index).await?;
        let message = format!("Item {} failed: {}", item.item_id, error);
        let execution_id = ctx.execution_id.clone();
        self.commit(ctx, move |state| {
            mark_run_failed(state, message.clone());
            Ok(Some(ExecutionEvent::Failed {
                execution_id,
                error: Some(message),
            }))
        })
        .await?;
        tracing::info!(execution_id = %ctx.execution_id, "execution stopped on error");
        Ok(())
    }

    async fn finalize(&self, ctx: &RunCtx) -> Result<(), Interrupt> {
        let mut slot = self.inner.registry.lock().await;
        let run = Self::owned_run(&mut slot, ctx)?;
        if run.paused {
            run.end_loop();
            return Ok(());
        }

        let execution_id = ctx.execution_id.clone();
        self.apply(run, move |state| {
            let failed = state
                .items
                .iter()
                .filter(|item| item.status == ItemStatus::Failed)
                .count();
            state.completed_at = Some(Utc::now());
            state.current_item_id = None;
            state.current_step = None;
            state.recompute_progress();
            let event = if failed > 0 {
                let message = format!("{} of {} items failed", failed, state.items.len());
                state.status = ExecutionStatus::Failed;
                state.error_message = Some(message.clone());
                ExecutionEvent::Failed {
                    execution_id,
                    error: Some(message),
                }
            } else {
                state.status = ExecutionStatus::Completed;
                ExecutionEvent::Completed {
                    execution_id,
                    progress: state.progress,
                }
            };
            Ok(Some(event))
        })
        .await?;

        tracing::info!(
            execution_id = %ctx.execution_id,
            status = %run.state.status,
            progress = run.state.progress,
            "execution finished"
        );
        run.end_loop();
        Ok(())
    }

    // ── External calls ───────────────────────────────────────────────

    /// Await `fut` with a timeout, giving up early if the run is cancelled.
    /// `None` means the timeout elapsed.
    async fn guarded<F>(
        &self,
        ctx: &RunCtx,
        limit: Duration,
        fut: F,
    ) -> Result<Option<F::Output>, Interrupt>
    where
        F: Future,
    {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(Interrupt::Halt),
            outcome = tokio::time::timeout(limit, fut) => Ok(outcome.ok()),
        }
    }

    /// Spawn a worker for the item, record its handle, and wait for it.
    async fn run_worker(
        &self,
        ctx: &RunCtx,
        index: usize,
        role: AgentRole,
        spec_id: Option<String>,
        context: String,
    ) -> Result<(), Interrupt> {
        let item = self.item_snapshot(ctx, index).await?;
        let request = WorkRequest {
            role,
            execution_id: ctx.execution_id.clone(),
            item_id: item.item_id.clone(),
            item_title: item.item_title.clone(),
            spec_id: spec_id.or(item.spec_id),
            isolate: ctx.options.use_isolated_workspace
                && matches!(role, AgentRole::Coder | AgentRole::Fixer),
            context,
        };

        let handle = self
            .inner
            .collaborators
            .workers
            .spawn(request)
            .await
            .map_err(|e| ItemError::Worker {
                role,
                message: format!("{:#}", e),
            })?;
        tracing::debug!(
            execution_id = %ctx.execution_id,
            item_id = %item.item_id,
            role = %role,
            handle = %handle,
            "worker spawned"
        );

        let recorded = handle.clone();
        if let Err(interrupt) = self
            .commit(ctx, move |state| {
                item_mut(state, index)?.worker_handle = Some(recorded);
                Ok(None)
            })
            .await
        {
            if matches!(interrupt, Interrupt::Halt) {
                self.kill_worker(&handle).await;
            }
            return Err(interrupt);
        }

        self.await_worker(ctx, role, &handle).await
    }

    async fn await_worker(&self, ctx: &RunCtx, role: AgentRole, handle: &str) -> Result<(), Interrupt> {
        let limit = self.inner.settings.worker_timeout;
        let wait = self
            .inner
            .collaborators
            .workers
            .wait(handle, self.inner.settings.poll_interval);
        match self.guarded(ctx, limit, wait).await? {
            None => {
                self.kill_worker(handle).await;
                Err(ItemError::WorkerTimeout {
                    role,
                    timeout_secs: limit.as_secs(),
                }
                .into())
            }
            Some(Err(e)) => Err(ItemError::Worker {
                role,
                message: format!("{:#}", e),
            }
            .into()),
            Some(Ok(WorkerStatus::Completed)) => Ok(()),
            Some(Ok(WorkerStatus::Error { message })) => {
                Err(ItemError::Worker { role, message }.into())
            }
            Some(Ok(WorkerStatus::Cancelled)) => Err(ItemError::WorkerCancelled { role }.into()),
            Some(Ok(WorkerStatus::Running)) => Err(ItemError::Worker {
                role,
                message: "worker stopped reporting before finishing".into(),
            }
            .into()),
        }
    }

    async fn kill_worker(&self, handle: &str) {
        if let Err(e) = self.inner.collaborators.workers.kill(handle).await {
            tracing::warn!(handle, error = %format!("{:#}", e), "failed to kill worker");
        }
    }
}

fn item_mut(state: &mut ExecutionState, index: usize) -> Result<&mut ItemState> {
    state
        .items
        .get_mut(index)
        .with_context(|| format!("Item index {} out of range", index))
}

fn mark_run_failed(state: &mut ExecutionState, message: String) {
    state.status = ExecutionStatus::Failed;
    state.error_message = Some(message);
    state.completed_at = Some(Utc::now());
    state.current_item_id = None;
    state.current_step = None;
}

/// Instructions handed to the fixer: the review findings and the last test outcome.
fn fix_context(issues: &[QaIssue], tests_passed: bool) -> String {
    let mut context = String::from("Review issues:\n");
    if issues.is_empty() {
        context.push_str("- none reported\n");
    }
    for issue in issues {
        match &issue.severity {
            Some(severity) => context.push_str(&format!("- [{}] {}\n", severity, issue.summary)),
            None => context.push_str(&format!("- {}\n", issue.summary)),
        }
    }
    context.push_str(if tests_passed {
        "Last test run: passed"
    } else {
        "Last test run: failed"
    });
    context
}
