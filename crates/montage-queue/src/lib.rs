//! Persistent priority queue of pending work units.
//!
//! Only task references live here; task bodies stay in the state store.
//! Ordering is priority (descending), then creation time (FIFO), then
//! lexicographic task id. Claiming is an atomic queued-to-claimed move so
//! concurrent scheduler instances never double-dispatch, and queue state
//! survives restarts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use montage_types::{CoreError, CoreResult, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    Claimed,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: String,
    pub project_id: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub depends_on: Vec<String>,
    pub state: EntryState,
    pub claimed_by: Option<String>,
}

#[derive(Clone)]
pub struct TaskQueue {
    conn: Arc<Mutex<Connection>>,
}

impl TaskQueue {
    pub fn open(db_path: &Path) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue (
                task_id    TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                priority   INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                depends_on TEXT NOT NULL DEFAULT '[]',
                state      TEXT NOT NULL DEFAULT 'queued',
                claimed_by TEXT,
                claimed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_order
                ON queue(state, priority DESC, created_at ASC, task_id ASC);
            CREATE INDEX IF NOT EXISTS idx_queue_project ON queue(project_id);

            CREATE TABLE IF NOT EXISTS completed (
                task_id      TEXT PRIMARY KEY,
                completed_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Idempotent: enqueuing an already-known task id is a no-op, so a task
    /// can never sit in the queue twice.
    pub async fn enqueue(&self, task: &Task) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue
                 (task_id, project_id, priority, created_at, depends_on, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued')",
            params![
                task.id,
                task.project_id,
                task.priority as i64,
                task.created_at.to_rfc3339(),
                serde_json::to_string(&task.depends_on)?
            ],
        )?;
        if inserted > 0 {
            debug!(task_id = %task.id, priority = task.priority, "task enqueued");
        }
        Ok(inserted > 0)
    }

    /// Highest-ranked queued entry whose dependencies are all completed.
    pub async fn peek_ready(&self) -> CoreResult<Option<QueueEntry>> {
        Ok(self.ready_batch(1).await?.into_iter().next())
    }

    /// Ready entries in dispatch order. Entries with any dependency missing
    /// from the completed set are skipped, not removed.
    pub async fn ready_batch(&self, limit: usize) -> CoreResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, project_id, priority, created_at, depends_on, state, claimed_by
             FROM queue q
             WHERE state = 'queued'
               AND NOT EXISTS (
                   SELECT 1 FROM json_each(q.depends_on) d
                   WHERE d.value NOT IN (SELECT task_id FROM completed))
             ORDER BY priority DESC, created_at ASC, task_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Atomic queued-to-claimed move. Exactly one claimant wins.
    pub async fn claim(&self, task_id: &str, claimant: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE queue SET state = 'claimed', claimed_by = ?2, claimed_at = ?3
             WHERE task_id = ?1 AND state = 'queued'",
            params![task_id, claimant, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Put a claimed task back at its original priority and position.
    pub async fn requeue(&self, task_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE queue SET state = 'queued', claimed_by = NULL, claimed_at = NULL
             WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(changed > 0)
    }

    /// Remove a task from the queue without marking it completed (failure
    /// past retries, cancellation).
    pub async fn dequeue(&self, task_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM queue WHERE task_id = ?1", params![task_id])?;
        Ok(removed > 0)
    }

    /// Record completion so dependents become ready, and drop the entry.
    pub async fn mark_completed(&self, task_id: &str) -> CoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO completed (task_id, completed_at) VALUES (?1, ?2)",
            params![task_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM queue WHERE task_id = ?1", params![task_id])?;
        tx.commit()?;
        Ok(())
    }

    pub async fn is_completed(&self, task_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM completed WHERE task_id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Queued plus claimed entries for one project; feeds backpressure.
    pub async fn depth(&self, project_id: &str) -> CoreResult<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    pub async fn entries_for(&self, project_id: &str) -> CoreResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT task_id, project_id, priority, created_at, depends_on, state, claimed_by
             FROM queue WHERE project_id = ?1
             ORDER BY priority DESC, created_at ASC, task_id ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }

    /// Drop every entry of a project (abort). Returns the removed task ids.
    pub async fn remove_project(&self, project_id: &str) -> CoreResult<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT task_id FROM queue WHERE project_id = ?1")?;
            let mapped = stmt.query_map(params![project_id], |r| r.get(0))?
                .collect::<Result<_, _>>()?;
            mapped
        };
        tx.execute("DELETE FROM queue WHERE project_id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(ids)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoreResult<QueueEntry>> {
    let created_at: String = row.get(3)?;
    let depends_on: String = row.get(4)?;
    let state: String = row.get(5)?;
    Ok((|| {
        Ok(QueueEntry {
            task_id: row.get(0)?,
            project_id: row.get(1)?,
            priority: row.get::<_, i64>(2)? as u8,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CoreError::Validation(format!("bad created_at: {e}")))?,
            depends_on: serde_json::from_str(&depends_on)?,
            state: if state == "claimed" {
                EntryState::Claimed
            } else {
                EntryState::Queued
            },
            claimed_by: row.get(6)?,
        })
    })())
}
