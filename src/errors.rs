//! Typed error hierarchy for the phase executor.
//!
//! Two enums cover the two layers that surface errors:
//! - `ExecutionError`: submission and store failures returned to callers
//! - `ItemError`: per-item step failures recorded on the item, never thrown
//!   past the control loop

use thiserror::Error;

use crate::collaborators::AgentRole;

/// Errors returned by the execution controller to its callers.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Execution {execution_id} is already running")]
    AlreadyRunning { execution_id: String },

    #[error("Phase {phase_id} has no eligible items")]
    NoEligibleItems { phase_id: String },

    #[error("Phase {phase_id} not found")]
    PhaseNotFound { phase_id: String },

    #[error("State store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of a single item step. The Display string is what lands in
/// `ItemState::error`.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("No spec linked and auto-create specs is disabled")]
    SpecMissing,

    #[error("Spec creation failed: {0}")]
    SpecCreation(String),

    #[error("{role} worker failed: {message}")]
    Worker { role: AgentRole, message: String },

    #[error("{role} worker timed out after {timeout_secs}s")]
    WorkerTimeout { role: AgentRole, timeout_secs: u64 },

    #[error("{role} worker was cancelled")]
    WorkerCancelled { role: AgentRole },

    #[error("Tests failed")]
    TestsFailed,

    #[error("Test runner error: {0}")]
    TestRunner(String),

    #[error("Test run timed out after {timeout_secs}s")]
    TestTimeout { timeout_secs: u64 },

    #[error("QA tracker error: {0}")]
    QaTracker(String),

    #[error("QA review timed out after {timeout_secs}s")]
    QaTimeout { timeout_secs: u64 },

    #[error("QA failed after {iterations} iterations")]
    QaExhausted { iterations: u32 },
}
