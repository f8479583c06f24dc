use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::ItemStatus;

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    #[serde(rename = "started")]
    Started {
        execution_id: String,
        phase_id: String,
        item_count: usize,
    },
    #[serde(rename = "paused")]
    Paused { execution_id: String },
    #[serde(rename = "resumed")]
    Resumed { execution_id: String },
    #[serde(rename = "cancelled")]
    Cancelled { execution_id: String },

    #[serde(rename = "item:started")]
    ItemStarted {
        execution_id: String,
        item_id: String,
        item_title: String,
    },
    #[serde(rename = "item:step")]
    ItemStep {
        execution_id: String,
        item_id: String,
        step: ItemStatus,
    },
    #[serde(rename = "item:completed")]
    ItemCompleted {
        execution_id: String,
        item_id: String,
        progress: u8,
    },
    #[serde(rename = "item:failed")]
    ItemFailed {
        execution_id: String,
        item_id: String,
        error: String,
        progress: u8,
    },

    #[serde(rename = "completed")]
    Completed { execution_id: String, progress: u8 },
    #[serde(rename = "failed")]
    Failed {
        execution_id: String,
        error: Option<String>,
    },
}

impl ExecutionEvent {
    /// Wire name of the event, e.g. `item:step`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Cancelled { .. } => "cancelled",
            Self::ItemStarted { .. } => "item:started",
            Self::ItemStep { .. } => "item:step",
            Self::ItemCompleted { .. } => "item:completed",
            Self::ItemFailed { .. } => "item:failed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::Paused { execution_id }
            | Self::Resumed { execution_id }
            | Self::Cancelled { execution_id }
            | Self::ItemStarted { execution_id, .. }
            | Self::ItemStep { execution_id, .. }
            | Self::ItemCompleted { execution_id, .. }
            | Self::ItemFailed { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. } => execution_id,
        }
    }

    /// Run-level events that end the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

// ── Broadcaster ──────────────────────────────────────────────────────

/// Fire-and-forget fan-out of execution events.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// dropped. A subscriber that falls behind sees `RecvError::Lagged` and can
/// catch up by polling the controller's status.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        tracing::debug!(
            execution_id = %event.execution_id(),
            event = event.event_type(),
            "publishing event"
        );
        let _ = self.tx.send(event); // Ignore error if no receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
