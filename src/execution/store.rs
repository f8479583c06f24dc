use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{ExecutionState, ExecutionStatus, ItemStatus};

/// Durable storage of execution records.
///
/// Writes complete before the caller moves on, so the stored record never lags
/// the controller by more than one transition.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upsert by id. Always bumps `updated_at` on the passed state first.
    async fn save(&self, state: &mut ExecutionState) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ExecutionState>>;

    /// Most recently started first.
    async fn list(&self, limit: usize) -> Result<Vec<ExecutionState>>;

    /// The most recently updated record that is `running` or `paused`.
    async fn find_active(&self) -> Result<Option<ExecutionState>>;
}

/// Async-safe SQLite state store.
///
/// Wraps `ExecutionDb` behind `Arc<Mutex>` and runs every query on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStateStore {
    inner: Arc<std::sync::Mutex<ExecutionDb>>,
}

impl SqliteStateStore {
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self::from_db(ExecutionDb::new(path)?))
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self::from_db(ExecutionDb::new_in_memory()?))
    }

    fn from_db(db: ExecutionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ExecutionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save(&self, state: &mut ExecutionState) -> Result<()> {
        state.updated_at = Utc::now();
        let snapshot = state.clone();
        self.call(move |db| db.upsert_execution(&snapshot)).await
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionState>> {
        let id = id.to_string();
        self.call(move |db| db.get_execution(&id)).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<ExecutionState>> {
        self.call(move |db| db.list_executions(limit)).await
    }

    async fn find_active(&self) -> Result<Option<ExecutionState>> {
        self.call(|db| db.find_active_execution()).await
    }
}

pub struct ExecutionDb {
    conn: Connection,
}

const SELECT_COLUMNS: &str = "id, phase_id, phase_title, status, current_item_id, current_step, \
     progress, items, options, started_at, updated_at, completed_at, error_message";

impl ExecutionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    phase_id TEXT NOT NULL,
                    phase_title TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_item_id TEXT,
                    current_step TEXT,
                    progress INTEGER NOT NULL DEFAULT 0,
                    items TEXT NOT NULL DEFAULT '[]',
                    options TEXT NOT NULL DEFAULT '{}',
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    completed_at TEXT,
                    error_message TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
                CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn upsert_execution(&self, state: &ExecutionState) -> Result<()> {
        let items = serde_json::to_string(&state.items).context("Failed to serialize items")?;
        let options =
            serde_json::to_string(&state.options).context("Failed to serialize options")?;
        self.conn
            .execute(
                "INSERT INTO executions (id, phase_id, phase_title, status, current_item_id,
                     current_step, progress, items, options, started_at, updated_at,
                     completed_at, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     current_item_id = excluded.current_item_id,
                     current_step = excluded.current_step,
                     progress = excluded.progress,
                     items = excluded.items,
                     options = excluded.options,
                     updated_at = excluded.updated_at,
                     completed_at = excluded.completed_at,
                     error_message = excluded.error_message",
                params![
                    state.id,
                    state.phase_id,
                    state.phase_title,
                    state.status.as_str(),
                    state.current_item_id,
                    state.current_step.map(|s| s.as_str()),
                    state.progress,
                    items,
                    options,
                    format_ts(&state.started_at),
                    format_ts(&state.updated_at),
                    state.completed_at.as_ref().map(format_ts),
                    state.error_message,
                ],
            )
            .context("Failed to save execution")?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<ExecutionState>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                ExecutionRow::from_row,
            )
            .optional()
            .context("Failed to query execution")?;
        row.map(ExecutionRow::into_state).transpose()
    }

    pub fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionState>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM executions ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare list_executions")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], ExecutionRow::from_row)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            let row = row.context("Failed to read execution row")?;
            executions.push(row.into_state()?);
        }
        Ok(executions)
    }

    pub fn find_active_execution(&self) -> Result<Option<ExecutionState>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM executions WHERE status IN ('running', 'paused')
                     ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                [],
                ExecutionRow::from_row,
            )
            .optional()
            .context("Failed to query active execution")?;
        row.map(ExecutionRow::into_state).transpose()
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Intermediate row struct for executions.
struct ExecutionRow {
    id: String,
    phase_id: String,
    phase_title: String,
    status: String,
    current_item_id: Option<String>,
    current_step: Option<String>,
    progress: u8,
    items: String,
    options: String,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase_id: row.get(1)?,
            phase_title: row.get(2)?,
            status: row.get(3)?,
            current_item_id: row.get(4)?,
            current_step: row.get(5)?,
            progress: row.get(6)?,
            items: row.get(7)?,
            options: row.get(8)?,
            started_at: row.get(9)?,
            updated_at: row.get(10)?,
            completed_at: row.get(11)?,
            error_message: row.get(12)?,
        })
    }

    fn into_state(self) -> Result<ExecutionState> {
        let status = ExecutionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse execution status")?;
        let current_step = self
            .current_step
            .as_deref()
            .map(ItemStatus::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse current step")?;
        Ok(ExecutionState {
            id: self.id,
            phase_id: self.phase_id,
            phase_title: self.phase_title,
            status,
            current_item_id: self.current_item_id,
            current_step,
            progress: self.progress,
            items: serde_json::from_str(&self.items).context("Failed to parse items JSON")?,
            options: serde_json::from_str(&self.options)
                .context("Failed to parse options JSON")?,
            started_at: parse_ts(&self.started_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            error_message: self.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::models::{ExecutionConfig, ExecutionOptions, WorkItem};

    fn sample_state(phase_id: &str) -> ExecutionState {
        let config = ExecutionConfig {
            phase_id: phase_id.into(),
            phase_title: "Foundations".into(),
            items: vec![
                WorkItem::new("a", "Add login").with_spec("a-add-login"),
                WorkItem::new("b", "Add logout"),
            ],
            options: ExecutionOptions {
                run_qa: true,
                ..ExecutionOptions::default()
            },
        };
        let items = config.eligible_items();
        ExecutionState::new(&config, &items)
    }

    #[tokio::test]
    async fn test_save_and_get_round_trip() -> Result<()> {
        let store = SqliteStateStore::new_in_memory()?;
        let mut state = sample_state("p1");
        state.status = ExecutionStatus::Running;
        state.current_item_id = Some("a".into());
        state.current_step = Some(ItemStatus::Executing);
        state.items[0].status = ItemStatus::Executing;
        state.items[0].worker_handle = Some("w-1".into());
        store.save(&mut state).await?;

        let fetched = store.get(&state.id).await?.expect("execution should exist");
        assert_eq!(fetched, state);
        assert!(store.get("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_bumps_updated_at() -> Result<()> {
        let store = SqliteStateStore::new_in_memory()?;
        let mut state = sample_state("p1");
        let before = state.updated_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save(&mut state).await?;
        assert!(state.updated_at > before);

        let first = state.updated_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        state.progress = 50;
        store.save(&mut state).await?;
        let fetched = store.get(&state.id).await?.unwrap();
        assert!(fetched.updated_at > first);
        assert_eq!(fetched.progress, 50);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_most_recent_first_and_limited() -> Result<()> {
        let store = SqliteStateStore::new_in_memory()?;
        let mut ids = Vec::new();
        for phase in ["p1", "p2", "p3"] {
            let mut state = sample_state(phase);
            store.save(&mut state).await?;
            ids.push(state.id.clone());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let listed = store.list(2).await?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_find_active_ignores_terminal_records() -> Result<()> {
        let store = SqliteStateStore::new_in_memory()?;
        assert!(store.find_active().await?.is_none());

        let mut done = sample_state("p1");
        done.status = ExecutionStatus::Completed;
        done.completed_at = Some(Utc::now());
        store.save(&mut done).await?;
        assert!(store.find_active().await?.is_none());

        let mut paused = sample_state("p2");
        paused.status = ExecutionStatus::Paused;
        store.save(&mut paused).await?;

        let active = store.find_active().await?.expect("paused run is active");
        assert_eq!(active.id, paused.id);
        assert_eq!(active.status, ExecutionStatus::Paused);
        Ok(())
    }

    #[tokio::test]
    async fn test_records_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("executions.db");
        let mut state = sample_state("p1");
        state.status = ExecutionStatus::Running;
        state.current_step = Some(ItemStatus::TasksCreated);
        {
            let store = SqliteStateStore::new(&path)?;
            store.save(&mut state).await?;
        }

        let reopened = SqliteStateStore::new(&path)?;
        let active = reopened.find_active().await?.expect("record should persist");
        assert_eq!(active.id, state.id);
        assert_eq!(active.current_step, Some(ItemStatus::TasksCreated));
        assert!(active.options.run_qa);
        Ok(())
    }
}
