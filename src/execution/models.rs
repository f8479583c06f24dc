use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run-level status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Running or paused: the states that count against the single-active-run rule.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

/// Per-item step. Doubles as the step in progress and the terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    SpecCreating,
    SpecCreated,
    TasksCreating,
    TasksCreated,
    Executing,
    Testing,
    QaReviewing,
    QaFixing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SpecCreating => "spec_creating",
            Self::SpecCreated => "spec_created",
            Self::TasksCreating => "tasks_creating",
            Self::TasksCreated => "tasks_created",
            Self::Executing => "executing",
            Self::Testing => "testing",
            Self::QaReviewing => "qa_reviewing",
            Self::QaFixing => "qa_fixing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the forward step order. `Failed` has no position.
    pub fn rank(&self) -> Option<u8> {
        let rank = match self {
            Self::Pending => 0,
            Self::SpecCreating => 1,
            Self::SpecCreated => 2,
            Self::TasksCreating => 3,
            Self::TasksCreated => 4,
            Self::Executing => 5,
            Self::Testing => 6,
            Self::QaReviewing => 7,
            Self::QaFixing => 8,
            Self::Completed => 9,
            Self::Failed => return None,
        };
        Some(rank)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "spec_creating" => Ok(Self::SpecCreating),
            "spec_created" => Ok(Self::SpecCreated),
            "tasks_creating" => Ok(Self::TasksCreating),
            "tasks_created" => Ok(Self::TasksCreated),
            "executing" => Ok(Self::Executing),
            "testing" => Ok(Self::Testing),
            "qa_reviewing" => Ok(Self::QaReviewing),
            "qa_fixing" => Ok(Self::QaFixing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid item status: {}", s)),
        }
    }
}

/// One roadmap entry as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            completed: false,
            spec_id: None,
        }
    }

    pub fn with_spec(mut self, spec_id: impl Into<String>) -> Self {
        self.spec_id = Some(spec_id.into());
        self
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// Options controlling which steps an item goes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default = "default_true")]
    pub auto_create_specs: bool,
    #[serde(default = "default_true")]
    pub auto_create_tasks: bool,
    #[serde(default)]
    pub run_qa: bool,
    #[serde(default = "default_max_qa_iterations")]
    pub max_qa_iterations: u32,
    #[serde(default)]
    pub stop_on_error: bool,
    #[serde(default)]
    pub use_isolated_workspace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_item_ids: Option<HashSet<String>>,
}

fn default_true() -> bool {
    true
}

fn default_max_qa_iterations() -> u32 {
    3
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            auto_create_specs: true,
            auto_create_tasks: true,
            run_qa: false,
            max_qa_iterations: default_max_qa_iterations(),
            stop_on_error: false,
            use_isolated_workspace: false,
            selected_item_ids: None,
        }
    }
}

/// Run submission. Immutable once handed to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub phase_id: String,
    pub phase_title: String,
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionConfig {
    /// Items the run will process, in submission order: the selected ids when
    /// a selection is given, otherwise every item not already completed upstream.
    pub fn eligible_items(&self) -> Vec<&WorkItem> {
        match &self.options.selected_item_ids {
            Some(selected) => self
                .items
                .iter()
                .filter(|item| selected.contains(&item.id))
                .collect(),
            None => self.items.iter().filter(|item| !item.completed).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub item_id: String,
    pub item_title: String,
    pub status: ItemStatus,
    pub spec_id: Option<String>,
    pub worker_handle: Option<String>,
    pub qa_session_id: Option<String>,
    pub qa_iterations: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ItemState {
    pub fn from_work_item(item: &WorkItem) -> Self {
        Self {
            item_id: item.id.clone(),
            item_title: item.title.clone(),
            status: ItemStatus::Pending,
            spec_id: item.spec_id.clone(),
            worker_handle: None,
            qa_session_id: None,
            qa_iterations: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Aggregate root for one run. Mutated only by the execution controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: String,
    pub phase_id: String,
    pub phase_title: String,
    pub status: ExecutionStatus,
    pub current_item_id: Option<String>,
    pub current_step: Option<ItemStatus>,
    pub progress: u8,
    pub items: Vec<ItemState>,
    pub options: ExecutionOptions,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ExecutionState {
    /// Build a fresh `pending` state from the eligible items of a config.
    pub fn new(config: &ExecutionConfig, items: &[&WorkItem]) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phase_id: config.phase_id.clone(),
            phase_title: config.phase_title.clone(),
            status: ExecutionStatus::Pending,
            current_item_id: None,
            current_step: None,
            progress: 0,
            items: items.iter().map(|item| ItemState::from_work_item(item)).collect(),
            options: config.options.clone(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn item(&self, index: usize) -> Option<&ItemState> {
        self.items.get(index)
    }

    /// Index of the first item not yet completed or failed.
    pub fn first_unresolved(&self) -> Option<usize> {
        self.items.iter().position(|item| !item.status.is_terminal())
    }

    pub fn resolved_count(&self) -> usize {
        self.items.iter().filter(|item| item.status.is_terminal()).count()
    }

    pub fn has_failed_items(&self) -> bool {
        self.items.iter().any(|item| item.status == ItemStatus::Failed)
    }

    /// Recompute `progress` as the ceiling percentage of resolved items.
    /// Never lowers an already-published value.
    pub fn recompute_progress(&mut self) {
        let total = self.items.len();
        if total == 0 {
            return;
        }
        let resolved = self.resolved_count();
        let percent = (100 * resolved).div_ceil(total).min(100) as u8;
        self.progress = self.progress.max(percent);
    }

    /// Worker handles of items that are still mid-flight.
    pub fn in_flight_handles(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| !item.status.is_terminal() && item.status != ItemStatus::Pending)
            .filter_map(|item| item.worker_handle.clone())
            .collect()
    }
}
