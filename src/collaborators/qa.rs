use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{AgentRole, QaIssue, QaTracker, WorkRequest, WorkerPool, WorkerStatus};

/// QA tracker backed by a reviewer agent.
///
/// Creating a session runs a `reviewer` worker to completion. The reviewer
/// writes its findings to `.forge/qa/<session>.json` as a JSON array of
/// issues; no file means the review found nothing.
pub struct AgentQaTracker {
    workers: Arc<dyn WorkerPool>,
    qa_dir: PathBuf,
    poll_interval: Duration,
}

impl AgentQaTracker {
    pub fn new(workers: Arc<dyn WorkerPool>, qa_dir: &Path, poll_interval: Duration) -> Self {
        Self {
            workers,
            qa_dir: qa_dir.to_path_buf(),
            poll_interval,
        }
    }

    fn issues_path(&self, session_id: &str) -> PathBuf {
        self.qa_dir.join(format!("{}.json", session_id))
    }
}

/// Kills the reviewer if the session future is dropped before the reviewer
/// finishes, e.g. on cancel or a QA timeout.
struct ReviewerGuard {
    workers: Arc<dyn WorkerPool>,
    handle: Option<String>,
}

impl ReviewerGuard {
    fn release(mut self) {
        self.handle = None;
    }
}

impl Drop for ReviewerGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(handle = %handle, "no runtime to kill abandoned reviewer");
            return;
        };
        let workers = self.workers.clone();
        runtime.spawn(async move {
            if let Err(e) = workers.kill(&handle).await {
                tracing::warn!(handle = %handle, error = %e, "failed to kill abandoned reviewer");
            } else {
                tracing::debug!(handle = %handle, "killed abandoned reviewer");
            }
        });
    }
}

#[async_trait]
impl QaTracker for AgentQaTracker {
    async fn create_session(&self, execution_id: &str, spec_id: &str) -> Result<String> {
        tokio::fs::create_dir_all(&self.qa_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.qa_dir.display()))?;

        let session_id = format!("qa-{}", uuid::Uuid::new_v4());
        let issues_path = self.issues_path(&session_id);
        let request = WorkRequest {
            role: AgentRole::Reviewer,
            execution_id: execution_id.to_string(),
            item_id: spec_id.to_string(),
            item_title: spec_id.to_string(),
            spec_id: Some(spec_id.to_string()),
            isolate: false,
            context: format!("Issues file: {}", issues_path.display()),
        };

        let handle = self.workers.spawn(request).await?;
        let reviewer = ReviewerGuard {
            workers: self.workers.clone(),
            handle: Some(handle.clone()),
        };
        let status = self.workers.wait(&handle, self.poll_interval).await?;
        reviewer.release();
        match status {
            WorkerStatus::Completed => {}
            WorkerStatus::Error { message } => anyhow::bail!("Reviewer failed: {}", message),
            other => anyhow::bail!("Reviewer did not complete: {:?}", other),
        }

        tracing::debug!(session_id = %session_id, spec_id, "QA session reviewed");
        Ok(session_id)
    }

    async fn get_issues(&self, session_id: &str) -> Result<Vec<QaIssue>> {
        let path = self.issues_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse QA issues in {}", path.display()))
    }
}
