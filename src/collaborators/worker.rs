use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};

use super::{AgentRole, WorkRequest, WorkerPool, WorkerStatus};
use crate::util::slugify;

/// Bookkeeping for one spawned agent process.
struct WorkerEntry {
    status: watch::Receiver<WorkerStatus>,
    kill: Option<oneshot::Sender<()>>,
}

/// Worker pool that runs the configured Claude CLI as a child process per request.
///
/// Each child is owned by a background task that publishes its exit through a
/// `watch` channel, so `wait` resolves on exit instead of polling.
pub struct CommandWorkerPool {
    project_root: PathBuf,
    claude_cmd: String,
    workers: Arc<Mutex<HashMap<String, WorkerEntry>>>,
}

impl CommandWorkerPool {
    pub fn new(project_root: &Path, claude_cmd: &str) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            claude_cmd: claude_cmd.to_string(),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn log_dir(&self) -> PathBuf {
        self.project_root.join(".forge").join("logs")
    }

    /// Create (or reuse) the git worktree an isolated item runs in.
    async fn setup_worktree(&self, request: &WorkRequest) -> Result<PathBuf> {
        let worktree_path = self
            .project_root
            .join(".forge")
            .join("worktrees")
            .join(&request.item_id);
        if worktree_path.exists() {
            return Ok(worktree_path);
        }

        let parent = worktree_path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent).await?;

        let worktree_str = worktree_path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        let branch_name = format!("forge/item-{}", slugify(&request.item_title, 40));

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch_name, worktree_str])
            .current_dir(&self.project_root)
            .output()
            .await
            .context("Failed to create git worktree")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Git worktree creation failed: {}", stderr);
        }

        tracing::debug!(item_id = %request.item_id, path = %worktree_path.display(), "created worktree");
        Ok(worktree_path)
    }
}

/// Role prompt sent to the agent on stdin.
pub fn build_prompt(request: &WorkRequest) -> String {
    let spec_ref = request
        .spec_id
        .as_deref()
        .map(|id| format!(".forge/specs/{}/", id))
        .unwrap_or_else(|| "(no spec yet)".to_string());

    let instructions = match request.role {
        AgentRole::SpecWriter => format!(
            "Write the specification for \"{}\" into {}spec.md. Describe scope, behaviour and acceptance criteria.",
            request.item_title, spec_ref
        ),
        AgentRole::TaskPlanner => format!(
            "Read {}spec.md and write an ordered implementation task list into {}tasks.md.",
            spec_ref, spec_ref
        ),
        AgentRole::Coder => format!(
            "Implement \"{}\" following {}spec.md and {}tasks.md. Keep the test suite passing.",
            request.item_title, spec_ref, spec_ref
        ),
        AgentRole::Reviewer => format!(
            "Review the implementation of \"{}\" against {}spec.md. Write every issue you find as a JSON array of {{\"summary\", \"severity\"}} objects to the file named in the context below. Write nothing if there are no issues.",
            request.item_title, spec_ref
        ),
        AgentRole::Fixer => format!(
            "Fix the review issues listed below for \"{}\" (spec: {}spec.md).",
            request.item_title, spec_ref
        ),
    };

    if request.context.is_empty() {
        instructions
    } else {
        format!("{}\n\n{}", instructions, request.context)
    }
}

#[async_trait]
impl WorkerPool for CommandWorkerPool {
    async fn spawn(&self, request: WorkRequest) -> Result<String> {
        let handle = uuid::Uuid::new_v4().to_string();
        let working_dir = if request.isolate {
            self.setup_worktree(&request).await?
        } else {
            self.project_root.clone()
        };

        let log_dir = self.log_dir();
        tokio::fs::create_dir_all(&log_dir)
            .await
            .context("Failed to create log directory")?;
        let log_path = log_dir.join(format!("worker-{}-{}.log", request.role, handle));
        let log_file = tokio::fs::File::create(&log_path)
            .await
            .with_context(|| format!("Failed to create worker log {}", log_path.display()))?
            .into_std()
            .await;
        let err_file = log_file
            .try_clone()
            .context("Failed to clone worker log handle")?;

        let mut child = Command::new(&self.claude_cmd)
            .arg("--print")
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file))
            .current_dir(&working_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.claude_cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = build_prompt(&request);
            // A worker that exits before reading its prompt closes the pipe early.
            match stdin.write_all(prompt.as_bytes()).await {
                Ok(()) => {
                    let _ = stdin.shutdown().await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e).context("Failed to write prompt to worker stdin"),
            }
        }

        let (status_tx, status_rx) = watch::channel(WorkerStatus::Running);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                result = child.wait() => match result {
                    Ok(exit) if exit.success() => WorkerStatus::Completed,
                    Ok(exit) => WorkerStatus::Error { message: format!("agent exited with {}", exit) },
                    Err(e) => WorkerStatus::Error { message: format!("failed to wait on agent: {}", e) },
                },
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(handle = %task_handle, error = %e, "failed to kill worker");
                    }
                    WorkerStatus::Cancelled
                }
            };
            tracing::debug!(handle = %task_handle, ?status, "worker finished");
            let _ = status_tx.send(status);
        });

        tracing::info!(
            handle = %handle,
            role = %request.role,
            item_id = %request.item_id,
            "spawned worker"
        );
        self.workers.lock().await.insert(
            handle.clone(),
            WorkerEntry {
                status: status_rx,
                kill: Some(kill_tx),
            },
        );
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<WorkerStatus> {
        let workers = self.workers.lock().await;
        let entry = workers
            .get(handle)
            .with_context(|| format!("Unknown worker handle {}", handle))?;
        let status = entry.status.borrow().clone();
        Ok(status)
    }

    /// Stop the worker and forget it once it has exited. Unknown handles
    /// belong to workers that already finished and were forgotten.
    async fn kill(&self, handle: &str) -> Result<()> {
        let status = {
            let mut workers = self.workers.lock().await;
            let Some(entry) = workers.get_mut(handle) else {
                tracing::debug!(handle, "kill for a worker that is already gone");
                return Ok(());
            };
            if let Some(kill) = entry.kill.take() {
                let _ = kill.send(());
            }
            entry.status.clone()
        };
        self.forget_when_done(handle, status).await.map(|_| ())
    }

    async fn wait(&self, handle: &str, _poll_interval: Duration) -> Result<WorkerStatus> {
        let status = {
            let workers = self.workers.lock().await;
            workers
                .get(handle)
                .with_context(|| format!("Unknown worker handle {}", handle))?
                .status
                .clone()
        };
        self.forget_when_done(handle, status).await
    }
}

impl CommandWorkerPool {
    /// Wait for a terminal status, then drop the worker's entry.
    async fn forget_when_done(
        &self,
        handle: &str,
        mut status: watch::Receiver<WorkerStatus>,
    ) -> Result<WorkerStatus> {
        let terminal = status
            .wait_for(|s| s.is_terminal())
            .await
            .context("Worker status channel closed")?
            .clone();
        self.workers.lock().await.remove(handle);
        Ok(terminal)
    }
}
