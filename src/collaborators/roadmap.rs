use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{Phase, PhaseSource, RoadmapUpdater};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadmapFile {
    #[serde(default)]
    pub phases: Vec<Phase>,
}

/// Roadmap stored as `.forge/roadmap.json`.
///
/// Serves as the phase source for `run` and records completed items back into
/// the same file.
pub struct JsonRoadmap {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRoadmap {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn read(&self) -> Result<RoadmapFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RoadmapFile::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn write(&self, roadmap: &RoadmapFile) -> Result<()> {
        let content =
            serde_json::to_string_pretty(roadmap).context("Failed to serialize roadmap")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl PhaseSource for JsonRoadmap {
    async fn load_phase(&self, phase_id: &str) -> Result<Option<Phase>> {
        let roadmap = self.read().await?;
        Ok(roadmap.phases.into_iter().find(|phase| phase.id == phase_id))
    }
}

#[async_trait]
impl RoadmapUpdater for JsonRoadmap {
    async fn mark_complete(&self, item_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut roadmap = self.read().await?;
        let item = roadmap
            .phases
            .iter_mut()
            .flat_map(|phase| phase.items.iter_mut())
            .find(|item| item.id == item_id)
            .with_context(|| format!("Item {} not found in roadmap", item_id))?;
        if item.completed {
            return Ok(());
        }
        item.completed = true;
        self.write(&roadmap).await?;
        tracing::debug!(item_id, "roadmap item marked complete");
        Ok(())
    }
}
