use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, watch};
use tokio_util::sync::CancellationToken;

use super::models::ExecutionState;

/// Signals shared between the controller and one run's control loop.
pub struct RunControl {
    pub cancel: CancellationToken,
    idle: watch::Sender<bool>,
}

impl RunControl {
    fn new(idle: bool) -> Self {
        let (idle, _) = watch::channel(idle);
        Self {
            cancel: CancellationToken::new(),
            idle,
        }
    }

    /// Resolve once no control loop is driving this run.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}

/// The run the controller is tracking, plus the flags the loop checks at
/// safe points.
pub struct TrackedRun {
    pub state: ExecutionState,
    pub paused: bool,
    loop_alive: bool,
    generation: u64,
    pub control: Arc<RunControl>,
}

impl TrackedRun {
    /// A freshly submitted run. The caller launches its loop.
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            paused: false,
            loop_alive: false,
            generation: 0,
            control: Arc::new(RunControl::new(true)),
        }
    }

    /// A run re-discovered from the store. Nothing drives it until resumed.
    pub fn recovered(state: ExecutionState) -> Self {
        let mut run = Self::new(state);
        run.paused = run.state.status == super::models::ExecutionStatus::Paused;
        run
    }

    pub fn loop_alive(&self) -> bool {
        self.loop_alive
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark a new control loop as launched and return its generation.
    pub fn begin_loop(&mut self) -> u64 {
        self.generation += 1;
        self.loop_alive = true;
        self.control.idle.send_replace(false);
        self.generation
    }

    pub fn end_loop(&mut self) {
        self.loop_alive = false;
        self.control.idle.send_replace(true);
    }
}

/// Holds the single run the controller tracks.
///
/// Every read and mutation of the tracked state goes through [`lock`], so the
/// single-active-run check and the control loop's writes never interleave.
///
/// [`lock`]: ActiveRunRegistry::lock
#[derive(Default)]
pub struct ActiveRunRegistry {
    slot: Mutex<Option<TrackedRun>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, Option<TrackedRun>> {
        self.slot.lock().await
    }

    /// Copy of the tracked run's state, if any.
    pub async fn snapshot(&self) -> Option<ExecutionState> {
        self.slot.lock().await.as_ref().map(|run| run.state.clone())
    }

    /// Id of the tracked run when it is running or paused.
    pub async fn active_id(&self) -> Option<String> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|run| run.state.status.is_active())
            .map(|run| run.state.id.clone())
    }

    pub async fn control(&self) -> Option<Arc<RunControl>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|run| run.control.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::models::{
        ExecutionConfig, ExecutionOptions, ExecutionStatus, WorkItem,
    };
    use std::time::Duration;

    fn state(status: ExecutionStatus) -> ExecutionState {
        let config = ExecutionConfig {
            phase_id: "p1".into(),
            phase_title: "Foundations".into(),
            items: vec![WorkItem::new("a", "A")],
            options: ExecutionOptions::default(),
        };
        let items = config.eligible_items();
        let mut state = ExecutionState::new(&config, &items);
        state.status = status;
        state
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = ActiveRunRegistry::new();
        assert!(registry.snapshot().await.is_none());
        assert!(registry.active_id().await.is_none());
    }

    #[tokio::test]
    async fn test_active_id_only_for_running_or_paused() {
        let registry = ActiveRunRegistry::new();
        let run = TrackedRun::new(state(ExecutionStatus::Running));
        let id = run.state.id.clone();
        *registry.lock().await = Some(run);
        assert_eq!(registry.active_id().await, Some(id));

        registry.lock().await.as_mut().unwrap().state.status = ExecutionStatus::Completed;
        assert!(registry.active_id().await.is_none());
        assert!(registry.snapshot().await.is_some());
    }

    #[tokio::test]
    async fn test_loop_generations_and_idle_signal() {
        let mut run = TrackedRun::new(state(ExecutionStatus::Running));
        assert!(!run.loop_alive());
        assert_eq!(run.begin_loop(), 1);
        assert!(run.loop_alive());

        let control = run.control.clone();
        let waiter = tokio::spawn(async move { control.wait_idle().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        run.end_loop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.begin_loop(), 2);
    }

    #[test]
    fn test_recovered_run_has_no_loop() {
        let run = TrackedRun::recovered(state(ExecutionStatus::Paused));
        assert!(!run.loop_alive());
        assert!(run.paused);
        let running = TrackedRun::recovered(state(ExecutionStatus::Running));
        assert!(!running.paused);
    }
}
