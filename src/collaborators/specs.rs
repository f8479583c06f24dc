use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{SpecCatalog, SpecRequest};
use crate::util::slugify;

/// Spec catalog stored as one directory per spec under `.forge/specs/`.
///
/// ```text
/// .forge/specs/<item-id>-<slug>/
///     spec.md     written by the spec_writer agent
///     tasks.md    written by the task_planner agent
/// ```
pub struct FsSpecCatalog {
    root: PathBuf,
}

impl FsSpecCatalog {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn spec_id_for(item_id: &str, item_title: &str) -> String {
        let slug = slugify(item_title, 40);
        if slug.is_empty() {
            item_id.to_string()
        } else {
            format!("{}-{}", item_id, slug)
        }
    }

    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.root.join(spec_id)
    }
}

#[async_trait]
impl SpecCatalog for FsSpecCatalog {
    /// Create the spec directory with a stub `spec.md` and return its id.
    /// An existing `spec.md` is left untouched.
    async fn create_spec(&self, request: &SpecRequest) -> Result<String> {
        let spec_id = Self::spec_id_for(&request.item_id, &request.item_title);
        let dir = self.spec_dir(&spec_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create spec directory {}", dir.display()))?;

        let spec_path = dir.join("spec.md");
        if !tokio::fs::try_exists(&spec_path).await.unwrap_or(false) {
            let stub = format!(
                "# {}\n\nPhase: {}\nItem: {}\n",
                request.item_title, request.phase_id, request.item_id
            );
            tokio::fs::write(&spec_path, stub)
                .await
                .with_context(|| format!("Failed to write {}", spec_path.display()))?;
        }

        tracing::debug!(spec_id = %spec_id, "spec created");
        Ok(spec_id)
    }

    async fn has_tasks(&self, spec_id: &str) -> Result<bool> {
        let tasks_path = self.spec_dir(spec_id).join("tasks.md");
        match tokio::fs::read_to_string(&tasks_path).await {
            Ok(content) => Ok(!content.trim().is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read {}", tasks_path.display()))
            }
        }
    }
}
