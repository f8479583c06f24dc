//! Per-item step plan and transition rules.
//!
//! An item's plan is computed once, when the control loop picks the item up,
//! from the run options and the item's recorded state. The loop then walks the
//! plan in order instead of branching on option flags at every step.

use crate::errors::ItemError;

use super::models::{ExecutionOptions, ItemState, ItemStatus};

/// One unit of work in an item's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStep {
    /// `spec_creating` → `spec_created`
    CreateSpec,
    /// `tasks_creating` → `tasks_created`
    CreateTasks,
    /// `executing`
    Execute,
    /// A single `testing` pass
    Test,
    /// `qa_reviewing` → `qa_fixing` → `testing` loop, bounded by `max_qa_iterations`
    QaLoop,
}

impl PlanStep {
    /// Whether the control loop may stop before this step. Steps from
    /// `Execute` onward run as one unit once execution has begun.
    pub fn is_safe_point(&self) -> bool {
        matches!(self, Self::CreateSpec | Self::CreateTasks | Self::Execute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPlan {
    steps: Vec<PlanStep>,
}

impl ItemPlan {
    /// Derive the remaining steps for an item.
    ///
    /// `tasks_exist` reports whether a tasks artifact already exists for the
    /// item's current spec; it is ignored when the spec is created by this plan.
    pub fn derive(
        options: &ExecutionOptions,
        item: &ItemState,
        tasks_exist: bool,
    ) -> Result<Self, ItemError> {
        let mut steps = Vec::with_capacity(5);

        let creates_spec = item.spec_id.is_none();
        if creates_spec {
            if !options.auto_create_specs {
                return Err(ItemError::SpecMissing);
            }
            steps.push(PlanStep::CreateSpec);
        }

        let tasks_recorded = item
            .status
            .rank()
            .is_some_and(|rank| rank >= rank_of(ItemStatus::TasksCreated));
        let tasks_ready = tasks_recorded || (!creates_spec && tasks_exist);
        if options.auto_create_tasks && !tasks_ready {
            steps.push(PlanStep::CreateTasks);
        }

        steps.push(PlanStep::Execute);
        steps.push(PlanStep::Test);
        if options.run_qa {
            steps.push(PlanStep::QaLoop);
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn contains(&self, step: PlanStep) -> bool {
        self.steps.contains(&step)
    }
}

fn rank_of(status: ItemStatus) -> u8 {
    status.rank().unwrap_or(u8::MAX)
}

/// Validate an item status transition.
///
/// Steps only move forward, `testing` may be re-entered from `qa_fixing`,
/// `failed` is reachable from any non-terminal step, and a run resumed after
/// a crash may restart an interrupted creating step or restart at `executing`.
pub fn is_valid_item_transition(from: ItemStatus, to: ItemStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == ItemStatus::Failed {
        return true;
    }
    match (from, to) {
        (ItemStatus::QaFixing, ItemStatus::Testing) => true,
        (from, to)
            if from == to
                && matches!(
                    to,
                    ItemStatus::SpecCreating | ItemStatus::TasksCreating | ItemStatus::Executing
                ) =>
        {
            true
        }
        (ItemStatus::Testing | ItemStatus::QaReviewing | ItemStatus::QaFixing, ItemStatus::Executing) => {
            true
        }
        (from, to) => match (from.rank(), to.rank()) {
            (Some(a), Some(b)) => b > a,
            _ => false,
        },
    }
}
