use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use montage_locks::LockService;
use montage_types::{
    ApprovalRequest, ApprovalStatus, ArtifactMeta, Budget, ChangeEntry, CoreError, CoreResult,
    DnaEntry, ErrorEntry, GlobalSpec, LockMirror, Project, ProjectStatus, Shot, Task,
};

use crate::{merge_json, WriteCtx};

#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Cache-aside TTL for project snapshots.
    pub cache_ttl: Duration,
    /// Internal retries for compound mutations that hit a version conflict.
    pub conflict_retries: u32,
    /// First backoff step; doubles per retry.
    pub backoff_base: Duration,
    /// Before/after values larger than this are summarized in the change log.
    pub change_value_cap: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            conflict_retries: 3,
            backoff_base: Duration::from_millis(100),
            change_value_cap: 4096,
        }
    }
}

/// Exclusive owner of all project mutation. Workers read snapshots and
/// propose updates through the partial-update operations here; every write
/// bumps the aggregate version by one and records a change-log entry.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    cache: Arc<RwLock<HashMap<String, (Project, Instant)>>>,
    invalidations: broadcast::Sender<String>,
    locks: LockService,
    config: Arc<StateStoreConfig>,
}

impl StateStore {
    pub fn open(db_path: &Path, locks: LockService, config: StateStoreConfig) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(db_path)?, locks, config)
    }

    pub fn open_in_memory(locks: LockService, config: StateStoreConfig) -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?, locks, config)
    }

    fn init(conn: Connection, locks: LockService, config: StateStoreConfig) -> CoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id         TEXT PRIMARY KEY,
                version    INTEGER NOT NULL,
                status     TEXT NOT NULL,
                document   TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS change_log (
                seq                INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id         TEXT NOT NULL,
                version            INTEGER NOT NULL,
                timestamp          TEXT NOT NULL,
                actor              TEXT NOT NULL,
                change_kind        TEXT NOT NULL,
                description        TEXT NOT NULL,
                path               TEXT NOT NULL,
                causation_event_id TEXT,
                before_value       TEXT,
                after_value        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_change_log_project
                ON change_log(project_id, version);

            CREATE TABLE IF NOT EXISTS approvals_history (
                approval_id TEXT PRIMARY KEY,
                project_id  TEXT NOT NULL,
                stage       TEXT NOT NULL,
                status      TEXT NOT NULL,
                resolved_at TEXT,
                body        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                project_id TEXT NOT NULL,
                uri        TEXT NOT NULL,
                body       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (project_id, uri)
            );

            CREATE TABLE IF NOT EXISTS lock_mirror (
                project_id TEXT NOT NULL,
                key        TEXT NOT NULL,
                holder     TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                PRIMARY KEY (project_id, key)
            );",
        )?;
        let (invalidations, _) = broadcast::channel(1024);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cache: Arc::new(RwLock::new(HashMap::new())),
            invalidations,
            locks,
            config: Arc::new(config),
        })
    }

    pub fn lock_service(&self) -> &LockService {
        &self.locks
    }

    /// Side channel replicas listen on to drop their local cache entries.
    pub fn invalidation_feed(&self) -> broadcast::Receiver<String> {
        self.invalidations.subscribe()
    }

    pub async fn drop_cached(&self, project_id: &str) {
        self.cache.write().await.remove(project_id);
    }

    // ---- reads ------------------------------------------------------------

    /// Cache-aside read. Misses populate the cache with the configured TTL.
    pub async fn get_project(&self, project_id: &str) -> CoreResult<Project> {
        if let Some((project, stored_at)) = self.cache.read().await.get(project_id) {
            if stored_at.elapsed() < self.config.cache_ttl {
                return Ok(project.clone());
            }
        }
        let project = self.get_project_uncached(project_id).await?;
        self.cache
            .write()
            .await
            .insert(project_id.to_string(), (project.clone(), Instant::now()));
        Ok(project)
    }

    /// Cache-bypassing read, used where staleness is not acceptable
    /// (scheduler dependency re-checks, OCC read-modify-write).
    pub async fn get_project_uncached(&self, project_id: &str) -> CoreResult<Project> {
        let conn = self.conn.lock().await;
        Self::read_project(&conn, project_id)
    }

    fn read_project(conn: &Connection, project_id: &str) -> CoreResult<Project> {
        let body: Option<String> = conn
            .query_row(
                "SELECT document FROM projects WHERE id = ?1",
                params![project_id],
                |r| r.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(CoreError::NotFound(format!("project `{project_id}`"))),
        }
    }

    pub async fn get_global_spec(&self, project_id: &str) -> CoreResult<GlobalSpec> {
        Ok(self.get_project(project_id).await?.spec)
    }

    pub async fn get_budget(&self, project_id: &str) -> CoreResult<Budget> {
        Ok(self.get_project(project_id).await?.budget)
    }

    pub async fn get_dna_bank(&self, project_id: &str) -> CoreResult<HashMap<String, DnaEntry>> {
        Ok(self.get_project(project_id).await?.dna_bank)
    }

    pub async fn get_shot(&self, project_id: &str, shot_id: &str) -> CoreResult<Shot> {
        self.get_project(project_id)
            .await?
            .shots
            .remove(shot_id)
            .ok_or_else(|| CoreError::NotFound(format!("shot `{shot_id}` in `{project_id}`")))
    }

    pub async fn get_all_shots(&self, project_id: &str) -> CoreResult<HashMap<String, Shot>> {
        Ok(self.get_project(project_id).await?.shots)
    }

    pub async fn list_projects(&self) -> CoreResult<Vec<(String, u64, ProjectStatus)>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, version, status FROM projects ORDER BY id")?;
        let rows: Vec<(String, i64, String)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(id, version, status)| {
                let status: ProjectStatus =
                    serde_json::from_value(Value::String(status))?;
                Ok((id, version as u64, status))
            })
            .collect()
    }

    // ---- writes -----------------------------------------------------------

    pub async fn create_project(
        &self,
        project_id: &str,
        spec: GlobalSpec,
        budget: Budget,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        let mut project = Project::new(project_id, spec, budget);
        let entry = ChangeEntry {
            version: project.version,
            timestamp: Utc::now(),
            actor: ctx.actor.clone(),
            change_kind: "create_project".to_string(),
            description: format!("project `{project_id}` created"),
            path: "/".to_string(),
            causation_event_id: ctx.causation_event_id.clone(),
            before: None,
            after: None,
        };
        project.push_change(entry.clone());
        let body = serde_json::to_string(&project)?;
        {
            let conn = self.conn.lock().await;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO projects (id, version, status, document, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    project.version as i64,
                    status_str(&project.status)?,
                    body,
                    project.updated_at.to_rfc3339()
                ],
            )?;
            if inserted == 0 {
                return Err(CoreError::Validation(format!(
                    "project `{project_id}` already exists"
                )));
            }
            Self::insert_change_row(&conn, project_id, &entry)?;
        }
        self.store_in_cache(project.clone()).await;
        Ok(project)
    }

    pub async fn update_project_status(
        &self,
        project_id: &str,
        new_status: ProjectStatus,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        self.mutate(project_id, ctx, "update_status", "/status", move |project| {
            if project.status == new_status {
                return Ok(None);
            }
            if project.status.is_terminal() {
                return Err(CoreError::Validation(format!(
                    "project is terminal ({:?}); cannot transition to {:?}",
                    project.status, new_status
                )));
            }
            let before = serde_json::to_value(project.status)?;
            project.status = new_status;
            Ok(Some((
                format!("status -> {}", json_name(&new_status)?),
                Some(before),
                Some(serde_json::to_value(new_status)?),
            )))
        })
        .await
    }

    /// Requires the caller to hold the global-style lock.
    pub async fn update_global_spec(
        &self,
        project_id: &str,
        spec: GlobalSpec,
        ctx: &WriteCtx,
        lock_owner: &str,
    ) -> CoreResult<Project> {
        self.require_lock(&montage_locks::keys::global_style(project_id), lock_owner)?;
        let spec = Arc::new(spec);
        self.mutate(project_id, ctx, "update_global_spec", "/spec", move |project| {
            let before = serde_json::to_value(&project.spec)?;
            project.spec = (*spec).clone();
            Ok(Some((
                "global spec replaced".to_string(),
                Some(before),
                Some(serde_json::to_value(&project.spec)?),
            )))
        })
        .await
    }

    pub async fn update_budget(
        &self,
        project_id: &str,
        budget: Budget,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        let budget = Arc::new(budget);
        self.mutate(project_id, ctx, "update_budget", "/budget", move |project| {
            let before = serde_json::to_value(&project.budget)?;
            project.budget = (*budget).clone();
            Ok(Some((
                "budget replaced".to_string(),
                Some(before),
                Some(serde_json::to_value(&project.budget)?),
            )))
        })
        .await
    }

    /// Numeric cost accumulation as a single in-database expression so
    /// concurrent adders never lose updates. Returns the new aggregate
    /// version and the new spent amount.
    pub async fn add_cost(
        &self,
        project_id: &str,
        amount: f64,
        category: &str,
        description: &str,
        ctx: &WriteCtx,
    ) -> CoreResult<(u64, f64)> {
        if !category.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CoreError::Validation(format!(
                "invalid cost category `{category}`"
            )));
        }
        let now = Utc::now();
        let (version, spent) = {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT version FROM projects WHERE id = ?1",
                    params![project_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(CoreError::NotFound(format!("project `{project_id}`")));
            };
            if let Some(expected) = ctx.expected_version {
                if expected != current as u64 {
                    return Err(CoreError::VersionConflict {
                        project_id: project_id.to_string(),
                        expected,
                        actual: current as u64,
                    });
                }
            }
            let breakdown_path = format!("$.budget.breakdown.{category}");
            tx.execute(
                &format!(
                    "UPDATE projects SET
                        version = version + 1,
                        updated_at = ?3,
                        document = json_set(document,
                            '$.version', version + 1,
                            '$.updated_at', ?3,
                            '$.budget.spent.amount',
                                COALESCE(json_extract(document, '$.budget.spent.amount'), 0) + ?2,
                            '$.budget.estimated_remaining.amount',
                                json_extract(document, '$.budget.total.amount')
                                - (COALESCE(json_extract(document, '$.budget.spent.amount'), 0) + ?2),
                            '{breakdown_path}',
                                json_object(
                                    'amount',
                                    COALESCE(json_extract(document, '{breakdown_path}.amount'), 0) + ?2,
                                    'currency',
                                    json_extract(document, '$.budget.total.currency')))
                     WHERE id = ?1 AND version = ?4"
                ),
                params![project_id, amount, now.to_rfc3339(), current],
            )?;
            let entry = ChangeEntry {
                version: (current + 1) as u64,
                timestamp: now,
                actor: ctx.actor.clone(),
                change_kind: "add_cost".to_string(),
                description: description.to_string(),
                path: "/budget/spent".to_string(),
                causation_event_id: ctx.causation_event_id.clone(),
                before: None,
                after: Some(json!({ "delta": amount, "category": category })),
            };
            // Ring append stays in-database too; evict the oldest entry once
            // the in-aggregate log is at capacity.
            tx.execute(
                "UPDATE projects SET document = json_insert(
                        CASE WHEN json_array_length(document, '$.change_log') >= 100
                             THEN json_remove(document, '$.change_log[0]')
                             ELSE document END,
                        '$.change_log[#]', json(?2))
                 WHERE id = ?1",
                params![project_id, serde_json::to_string(&entry)?],
            )?;
            Self::insert_change_row(&tx, project_id, &entry)?;
            let (version, spent): (i64, f64) = tx.query_row(
                "SELECT version, json_extract(document, '$.budget.spent.amount')
                 FROM projects WHERE id = ?1",
                params![project_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            tx.commit()?;
            (version as u64, spent)
        };
        self.refresh_cache(project_id).await?;
        Ok((version, spent))
    }

    /// Requires the caller to hold the dna-bank lock.
    pub async fn update_dna_bank(
        &self,
        project_id: &str,
        entity_id: &str,
        entry: DnaEntry,
        ctx: &WriteCtx,
        lock_owner: &str,
    ) -> CoreResult<Project> {
        self.require_lock(&montage_locks::keys::dna_bank(project_id), lock_owner)?;
        let entity_id = entity_id.to_string();
        let entry = Arc::new(entry);
        let path = format!("/dna_bank/{entity_id}");
        self.mutate(project_id, ctx, "update_dna_bank", &path, move |project| {
            let before = project
                .dna_bank
                .get(&entity_id)
                .map(serde_json::to_value)
                .transpose()?;
            let mut next = (*entry).clone();
            next.rebalance();
            let after = serde_json::to_value(&next)?;
            project.dna_bank.insert(entity_id.clone(), next);
            Ok(Some((
                format!("dna entry `{entity_id}` updated"),
                before,
                Some(after),
            )))
        })
        .await
    }

    /// Requires the caller to hold the per-shot lock.
    pub async fn update_shot(
        &self,
        project_id: &str,
        shot_id: &str,
        shot: Shot,
        ctx: &WriteCtx,
        lock_owner: &str,
    ) -> CoreResult<Project> {
        self.require_lock(&montage_locks::keys::shot(project_id, shot_id), lock_owner)?;
        let shot_id = shot_id.to_string();
        let shot = Arc::new(shot);
        let path = format!("/shots/{shot_id}");
        self.mutate(project_id, ctx, "update_shot", &path, move |project| {
            let before = project
                .shots
                .get(&shot_id)
                .map(serde_json::to_value)
                .transpose()?;
            let after = serde_json::to_value(&*shot)?;
            project.shots.insert(shot_id.clone(), (*shot).clone());
            Ok(Some((
                format!("shot `{shot_id}` updated"),
                before,
                Some(after),
            )))
        })
        .await
    }

    /// JSON-merges a patch into each named shot. Requires the shots scope
    /// lock. Missing shots are created from the patch.
    pub async fn batch_update_shots(
        &self,
        project_id: &str,
        patches: HashMap<String, Value>,
        ctx: &WriteCtx,
        lock_owner: &str,
    ) -> CoreResult<Project> {
        self.require_lock(&montage_locks::keys::shots_scope(project_id), lock_owner)?;
        let patches = Arc::new(patches);
        self.mutate(project_id, ctx, "batch_update_shots", "/shots", move |project| {
            let before = serde_json::to_value(&project.shots)?;
            for (shot_id, patch) in patches.iter() {
                let mut doc = match project.shots.get(shot_id) {
                    Some(existing) => serde_json::to_value(existing)?,
                    None => Value::Object(Default::default()),
                };
                merge_json(&mut doc, patch);
                let shot: Shot = serde_json::from_value(doc).map_err(|e| {
                    CoreError::Validation(format!("shot `{shot_id}` patch invalid: {e}"))
                })?;
                project.shots.insert(shot_id.clone(), shot);
            }
            let after = serde_json::to_value(&project.shots)?;
            Ok(Some((
                format!("{} shots merged", patches.len()),
                Some(before),
                Some(after),
            )))
        })
        .await
    }

    /// Insert or replace a task in the aggregate (tasks are never deleted).
    pub async fn put_task(&self, project_id: &str, task: Task, ctx: &WriteCtx) -> CoreResult<Project> {
        let task = Arc::new(task);
        let path = format!("/tasks/{}", task.id);
        self.mutate(project_id, ctx, "put_task", &path, move |project| {
            let before = project
                .tasks
                .get(&task.id)
                .map(serde_json::to_value)
                .transpose()?;
            let after = serde_json::to_value(&*task)?;
            project.tasks.insert(task.id.clone(), (*task).clone());
            Ok(Some((
                format!("task `{}` {:?}", task.id, task.status),
                before,
                Some(after),
            )))
        })
        .await
    }

    pub async fn register_artifact(
        &self,
        project_id: &str,
        uri: &str,
        meta: ArtifactMeta,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        let uri_owned = uri.to_string();
        let meta = Arc::new(meta);
        let path = format!("/artifact_index/{uri}");
        let project = self
            .mutate(project_id, ctx, "register_artifact", &path, move |project| {
                let after = serde_json::to_value(&*meta)?;
                match project.artifact_index.get_mut(&uri_owned) {
                    Some(existing) => existing.use_count += 1,
                    None => {
                        project.artifact_index.insert(uri_owned.clone(), (*meta).clone());
                    }
                }
                Ok(Some((format!("artifact `{uri_owned}`"), None, Some(after))))
            })
            .await?;
        let body = project
            .artifact_index
            .get(uri)
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_else(|| "{}".to_string());
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO artifacts (project_id, uri, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_id, uri, body, Utc::now().to_rfc3339()],
        )?;
        Ok(project)
    }

    pub async fn append_error(
        &self,
        project_id: &str,
        entry: ErrorEntry,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        let entry = Arc::new(entry);
        self.mutate(project_id, ctx, "append_error", "/error_log", move |project| {
            let after = serde_json::to_value(&*entry)?;
            project.error_log.push((*entry).clone());
            Ok(Some((
                format!("error from `{}`", entry.source),
                None,
                Some(after),
            )))
        })
        .await
    }

    /// Record a caller-authored audit entry. The store assigns the version
    /// so the entry always matches the aggregate version it describes.
    pub async fn append_change(&self, project_id: &str, entry: ChangeEntry) -> CoreResult<Project> {
        let ctx = WriteCtx {
            actor: entry.actor.clone(),
            causation_event_id: entry.causation_event_id.clone(),
            expected_version: None,
        };
        let kind = entry.change_kind.clone();
        let path = entry.path.clone();
        let entry = Arc::new(entry);
        self.mutate(project_id, &ctx, &kind, &path, move |_project| {
            Ok(Some((
                entry.description.clone(),
                entry.before.clone(),
                entry.after.clone(),
            )))
        })
        .await
    }

    // ---- approvals --------------------------------------------------------

    pub async fn create_approval(
        &self,
        project_id: &str,
        request: ApprovalRequest,
        ctx: &WriteCtx,
    ) -> CoreResult<Project> {
        let request = Arc::new(request);
        let path = format!("/approval_requests/{}", request.id);
        self.mutate(project_id, ctx, "create_approval", &path, move |project| {
            let after = serde_json::to_value(&*request)?;
            project
                .approval_requests
                .insert(request.id.clone(), (*request).clone());
            Ok(Some((
                format!("approval `{}` pending at {}", request.id, request.stage),
                None,
                Some(after),
            )))
        })
        .await
    }

    pub async fn get_approval(
        &self,
        project_id: &str,
        approval_id: &str,
    ) -> CoreResult<ApprovalRequest> {
        self.get_project(project_id)
            .await?
            .approval_requests
            .remove(approval_id)
            .ok_or_else(|| CoreError::NotFound(format!("approval `{approval_id}`")))
    }

    pub async fn list_pending_approvals(
        &self,
        project_id: &str,
    ) -> CoreResult<Vec<ApprovalRequest>> {
        let mut pending: Vec<ApprovalRequest> = self
            .get_project_uncached(project_id)
            .await?
            .approval_requests
            .into_values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    /// Move a pending approval to the resolved history, both in-aggregate
    /// and in the append-only approvals table. Returns the resolved request
    /// (with its deferred tasks) for the caller to act on.
    pub async fn resolve_approval(
        &self,
        project_id: &str,
        approval_id: &str,
        status: ApprovalStatus,
        notes: Option<String>,
        ctx: &WriteCtx,
    ) -> CoreResult<ApprovalRequest> {
        if status == ApprovalStatus::Pending {
            return Err(CoreError::Validation(
                "cannot resolve an approval to pending".to_string(),
            ));
        }
        let approval_id_owned = approval_id.to_string();
        let notes = Arc::new(notes);
        let path = format!("/approval_requests/{approval_id}");
        let project = self
            .mutate(project_id, ctx, "resolve_approval", &path, move |project| {
                let Some(mut request) = project.approval_requests.remove(&approval_id_owned)
                else {
                    return Err(CoreError::NotFound(format!(
                        "approval `{approval_id_owned}`"
                    )));
                };
                if request.status != ApprovalStatus::Pending {
                    return Err(CoreError::Validation(format!(
                        "approval `{approval_id_owned}` already resolved"
                    )));
                }
                let before = serde_json::to_value(&request)?;
                request.status = status;
                request.notes = (*notes).clone();
                request.resolved_at = Some(Utc::now());
                let after = serde_json::to_value(&request)?;
                project.approval_history.push(request);
                Ok(Some((
                    format!("approval `{approval_id_owned}` -> {status:?}"),
                    Some(before),
                    Some(after),
                )))
            })
            .await?;
        let resolved = project
            .approval_history
            .iter()
            .rev()
            .find(|r| r.id == approval_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("approval `{approval_id}`")))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO approvals_history
                 (approval_id, project_id, stage, status, resolved_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                resolved.id,
                project_id,
                resolved.stage.as_str(),
                json_name(&resolved.status)?,
                resolved.resolved_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&resolved)?
            ],
        )?;
        Ok(resolved)
    }

    // ---- change log / mirror ----------------------------------------------

    /// Full history from the append-only table, newest first.
    pub async fn change_history(
        &self,
        project_id: &str,
        limit: usize,
    ) -> CoreResult<Vec<ChangeEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT version, timestamp, actor, change_kind, description, path,
                    causation_event_id, before_value, after_value
             FROM change_log WHERE project_id = ?1
             ORDER BY version DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![project_id, limit as i64], |r| {
                let timestamp: String = r.get(1)?;
                let before: Option<String> = r.get(7)?;
                let after: Option<String> = r.get(8)?;
                Ok((
                    r.get::<_, i64>(0)?,
                    timestamp,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    before,
                    after,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(
                |(version, timestamp, actor, change_kind, description, path, cause, before, after)| {
                    Ok(ChangeEntry {
                        version: version as u64,
                        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        actor,
                        change_kind,
                        description,
                        path,
                        causation_event_id: cause,
                        before: before.map(|b| serde_json::from_str(&b)).transpose()?,
                        after: after.map(|a| serde_json::from_str(&a)).transpose()?,
                    })
                },
            )
            .collect()
    }

    /// Refresh the advisory lock mirror in the aggregate from the
    /// authoritative lock table. Best effort: failures are logged, not
    /// surfaced.
    pub async fn refresh_lock_mirror(&self, project_id: &str, ctx: &WriteCtx) -> CoreResult<Project> {
        let active = self
            .locks
            .active_with_prefix(&montage_locks::keys::project_prefix(project_id))?;
        let mirror: HashMap<String, LockMirror> = active
            .into_iter()
            .map(|info| {
                (
                    info.key.clone(),
                    LockMirror {
                        holder: info.owner,
                        acquired_at: info.acquired_at,
                        expires_at: info.expires_at,
                        metadata: None,
                    },
                )
            })
            .collect();
        let mirror = Arc::new(mirror);
        self.mutate(project_id, ctx, "refresh_lock_mirror", "/locks", move |project| {
            project.locks = (*mirror).clone();
            Ok(Some((format!("{} active locks", project.locks.len()), None, None)))
        })
        .await
    }

    // ---- internals --------------------------------------------------------

    fn require_lock(&self, key: &str, owner: &str) -> CoreResult<()> {
        if self.locks.is_held_by(key, owner)? {
            Ok(())
        } else {
            Err(CoreError::LockRequired {
                key: key.to_string(),
                owner: owner.to_string(),
            })
        }
    }

    /// Compound read-modify-write under optimistic versioning.
    ///
    /// The closure mutates the aggregate and returns `None` for a no-op or
    /// `(description, before, after)` for the change-log entry. With an
    /// explicit `expected_version` a conflict surfaces immediately; without
    /// one the operation retries with exponential backoff.
    async fn mutate<F>(
        &self,
        project_id: &str,
        ctx: &WriteCtx,
        change_kind: &str,
        path: &str,
        apply: F,
    ) -> CoreResult<Project>
    where
        F: Fn(&mut Project) -> CoreResult<Option<(String, Option<Value>, Option<Value>)>>,
    {
        let mut attempt = 0u32;
        loop {
            match self
                .try_mutate(project_id, ctx, change_kind, path, &apply)
                .await
            {
                Err(CoreError::VersionConflict {
                    project_id: p,
                    expected,
                    actual,
                }) if ctx.expected_version.is_none() && attempt + 1 < self.config.conflict_retries =>
                {
                    let backoff = self.config.backoff_base * 2u32.pow(attempt);
                    debug!(
                        project_id = %p,
                        expected,
                        actual,
                        ?backoff,
                        "version conflict; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_mutate<F>(
        &self,
        project_id: &str,
        ctx: &WriteCtx,
        change_kind: &str,
        path: &str,
        apply: &F,
    ) -> CoreResult<Project>
    where
        F: Fn(&mut Project) -> CoreResult<Option<(String, Option<Value>, Option<Value>)>>,
    {
        let conn = self.conn.lock().await;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, document FROM projects WHERE id = ?1",
                params![project_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((current, body)) = row else {
            return Err(CoreError::NotFound(format!("project `{project_id}`")));
        };
        let current = current as u64;
        if let Some(expected) = ctx.expected_version {
            if expected != current {
                return Err(CoreError::VersionConflict {
                    project_id: project_id.to_string(),
                    expected,
                    actual: current,
                });
            }
        }
        let mut project: Project = serde_json::from_str(&body)?;
        let Some((description, before, after)) = apply(&mut project)? else {
            return Ok(project);
        };
        project.version = current + 1;
        project.updated_at = Utc::now();
        refresh_predicted_final(&mut project);
        let entry = ChangeEntry {
            version: project.version,
            timestamp: project.updated_at,
            actor: ctx.actor.clone(),
            change_kind: change_kind.to_string(),
            description,
            path: path.to_string(),
            causation_event_id: ctx.causation_event_id.clone(),
            before: before.map(|v| self.bound_value(v)),
            after: after.map(|v| self.bound_value(v)),
        };
        project.push_change(entry.clone());
        let document = serde_json::to_string(&project)?;
        let updated = conn.execute(
            "UPDATE projects SET version = ?2, status = ?3, document = ?4, updated_at = ?5
             WHERE id = ?1 AND version = ?6",
            params![
                project_id,
                project.version as i64,
                status_str(&project.status)?,
                document,
                project.updated_at.to_rfc3339(),
                current as i64
            ],
        )?;
        if updated == 0 {
            let actual: i64 = conn
                .query_row(
                    "SELECT version FROM projects WHERE id = ?1",
                    params![project_id],
                    |r| r.get(0),
                )
                .optional()?
                .unwrap_or(0);
            return Err(CoreError::VersionConflict {
                project_id: project_id.to_string(),
                expected: current,
                actual: actual as u64,
            });
        }
        Self::insert_change_row(&conn, project_id, &entry)?;
        drop(conn);
        self.store_in_cache(project.clone()).await;
        Ok(project)
    }

    fn insert_change_row(conn: &Connection, project_id: &str, entry: &ChangeEntry) -> CoreResult<()> {
        conn.execute(
            "INSERT INTO change_log
                 (project_id, version, timestamp, actor, change_kind, description, path,
                  causation_event_id, before_value, after_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                project_id,
                entry.version as i64,
                entry.timestamp.to_rfc3339(),
                entry.actor,
                entry.change_kind,
                entry.description,
                entry.path,
                entry.causation_event_id,
                entry
                    .before
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                entry
                    .after
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?
            ],
        )?;
        Ok(())
    }

    /// Write-through ordering: database first (caller), cache second,
    /// invalidation broadcast third.
    async fn store_in_cache(&self, project: Project) {
        let id = project.id.clone();
        self.cache
            .write()
            .await
            .insert(id.clone(), (project, Instant::now()));
        let _ = self.invalidations.send(id);
    }

    async fn refresh_cache(&self, project_id: &str) -> CoreResult<()> {
        let project = self.get_project_uncached(project_id).await?;
        self.store_in_cache(project).await;
        Ok(())
    }

    /// Bound change-log values; larger diffs are summarized.
    fn bound_value(&self, value: Value) -> Value {
        let raw = value.to_string();
        if raw.len() > self.config.change_value_cap {
            json!({ "truncated": true, "bytes": raw.len() })
        } else {
            value
        }
    }
}

fn refresh_predicted_final(project: &mut Project) {
    let progress = project.shot_progress();
    project.budget.predicted_final = if progress > 0.0 {
        Some(montage_types::Money {
            amount: project.budget.spent.amount / progress,
            currency: project.budget.total.currency.clone(),
        })
    } else {
        None
    };
}

fn status_str(status: &ProjectStatus) -> CoreResult<String> {
    json_name(status)
}

fn json_name<T: serde::Serialize>(value: &T) -> CoreResult<String> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Err(CoreError::Validation(format!(
            "expected string-serialized enum, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use montage_locks::{keys, LockService, DEFAULT_TTL};
    use montage_types::{Money, QualityTier, ShotStatus, StyleSpec, UserOptions};

    fn spec() -> GlobalSpec {
        GlobalSpec {
            title: "Short film".into(),
            duration_seconds: 6.0,
            aspect_ratio: "16:9".into(),
            quality_tier: QualityTier::Balanced,
            resolution: "1920x1080".into(),
            fps: 24,
            style: StyleSpec::default(),
            characters: vec!["hero".into()],
            mood: "warm".into(),
            user_options: UserOptions::default(),
        }
    }

    fn store() -> StateStore {
        StateStore::open_in_memory(
            LockService::open_in_memory().unwrap(),
            StateStoreConfig::default(),
        )
        .unwrap()
    }

    async fn seeded(store: &StateStore) -> Project {
        store
            .create_project("p1", spec(), Budget::new(Money::usd(20.0)), &WriteCtx::actor("api"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = store();
        let created = seeded(&store).await;
        let read = store.get_project("p1").await.unwrap();
        assert_eq!(read.id, created.id);
        assert_eq!(read.version, 1);
        assert_eq!(read.status, ProjectStatus::Created);
        assert_eq!(read.change_log.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = store();
        seeded(&store).await;
        let err = store
            .create_project("p1", spec(), Budget::new(Money::usd(1.0)), &WriteCtx::actor("api"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn every_mutation_bumps_version_and_logs() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("orchestrator");
        store
            .update_project_status("p1", ProjectStatus::Planning, &ctx)
            .await
            .unwrap();
        let project = store
            .put_task("p1", Task::new("p1", montage_types::TaskKind::WriteScript, "writer"), &ctx)
            .await
            .unwrap();
        assert_eq!(project.version, 3);
        let history = store.change_history("p1", 10).await.unwrap();
        assert_eq!(history.len(), 3);
        // Change-entry version matches the aggregate version right after
        // the mutation it describes.
        assert_eq!(history[0].version, 3);
        assert_eq!(history[1].version, 2);
        for entry in &project.change_log {
            assert!(entry.version <= project.version);
        }
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("a").expecting(1);
        store
            .update_project_status("p1", ProjectStatus::Planning, &ctx)
            .await
            .unwrap();
        let err = store
            .update_project_status("p1", ProjectStatus::Rendering, &ctx)
            .await
            .unwrap_err();
        match err {
            CoreError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[tokio::test]
    async fn conflicting_writers_both_land_after_reread() {
        // Scenario: two workers read the same version; the loser rereads and
        // reapplies, and both changes survive.
        let store = store();
        seeded(&store).await;
        let locks = store.lock_service().clone();
        locks.acquire(&keys::shots_scope("p1"), "w1", DEFAULT_TTL).unwrap();
        let base = store.get_project("p1").await.unwrap();

        let mut patch_a = HashMap::new();
        patch_a.insert("S03".to_string(), json!({"id": "S03", "index": 2, "status": "init", "duration_seconds": 3.0, "render_meta": {"features": true}}));
        store
            .batch_update_shots("p1", patch_a, &WriteCtx::actor("w1").expecting(base.version), "w1")
            .await
            .unwrap();

        let mut patch_b = HashMap::new();
        patch_b.insert("S03".to_string(), json!({"qa": {"status": "pass", "scores": {}, "thresholds": {}}}));
        let err = store
            .batch_update_shots("p1", patch_b.clone(), &WriteCtx::actor("w1").expecting(base.version), "w1")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::VersionConflict { .. }));

        let fresh = store.get_project_uncached("p1").await.unwrap();
        store
            .batch_update_shots("p1", patch_b, &WriteCtx::actor("w1").expecting(fresh.version), "w1")
            .await
            .unwrap();

        let shot = store.get_shot("p1", "S03").await.unwrap();
        assert!(shot.render_meta.is_some());
        assert_eq!(shot.qa.unwrap().status, montage_types::QaStatus::Pass);
        let project = store.get_project_uncached("p1").await.unwrap();
        assert_eq!(project.version, base.version + 2);
    }

    #[tokio::test]
    async fn guarded_updates_demand_their_lock() {
        let store = store();
        seeded(&store).await;
        let err = store
            .update_global_spec("p1", spec(), &WriteCtx::actor("w"), "w")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LockRequired { .. }));

        store
            .lock_service()
            .acquire(&keys::global_style("p1"), "w", DEFAULT_TTL)
            .unwrap();
        store
            .update_global_spec("p1", spec(), &WriteCtx::actor("w"), "w")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_cost_accumulates_atomically() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("image_gen");
        store.add_cost("p1", 1.5, "image_generation", "kf S01", &ctx).await.unwrap();
        let (version, spent) = store
            .add_cost("p1", 0.75, "image_generation", "kf S02", &ctx)
            .await
            .unwrap();
        assert_eq!(version, 3);
        assert!((spent - 2.25).abs() < 1e-9);
        let budget = store.get_budget("p1").await.unwrap();
        assert!((budget.spent.amount - 2.25).abs() < 1e-9);
        assert!((budget.estimated_remaining.amount - 17.75).abs() < 1e-9);
        assert!((budget.breakdown["image_generation"].amount - 2.25).abs() < 1e-9);
        let history = store.change_history("p1", 10).await.unwrap();
        assert_eq!(history[0].change_kind, "add_cost");
        // The in-aggregate ring saw both entries as well.
        let project = store.get_project_uncached("p1").await.unwrap();
        assert_eq!(
            project
                .change_log
                .iter()
                .filter(|e| e.change_kind == "add_cost")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn add_cost_rejects_bad_category() {
        let store = store();
        seeded(&store).await;
        let err = store
            .add_cost("p1", 1.0, "bad category'", "x", &WriteCtx::actor("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn dna_update_rebalances_weights() {
        let store = store();
        seeded(&store).await;
        store
            .lock_service()
            .acquire(&keys::dna_bank("p1"), "fx", DEFAULT_TTL)
            .unwrap();
        let mut entry = DnaEntry::default();
        entry.versions.push(montage_types::DnaVersion {
            version: 1,
            weight: 3.0,
            source_artifact: "blob://kf".into(),
            confidence: 0.9,
            created_at: Utc::now(),
            vector: vec![1, 2, 3],
        });
        store
            .update_dna_bank("p1", "hero", entry, &WriteCtx::actor("fx"), "fx")
            .await
            .unwrap();
        let bank = store.get_dna_bank("p1").await.unwrap();
        assert!((bank["hero"].versions[0].weight - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn terminal_status_refuses_transitions() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("admin");
        store
            .update_project_status("p1", ProjectStatus::Aborted, &ctx)
            .await
            .unwrap();
        let err = store
            .update_project_status("p1", ProjectStatus::Planning, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn approvals_move_to_history_once_resolved() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("orchestrator");
        let request = ApprovalRequest::new("p1", montage_types::EventKind::SceneWritten, "review script");
        let approval_id = request.id.clone();
        store.create_approval("p1", request, &ctx).await.unwrap();
        assert_eq!(store.list_pending_approvals("p1").await.unwrap().len(), 1);

        let resolved = store
            .resolve_approval("p1", &approval_id, ApprovalStatus::Approved, None, &ctx)
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert!(store.list_pending_approvals("p1").await.unwrap().is_empty());
        let project = store.get_project_uncached("p1").await.unwrap();
        assert_eq!(project.approval_history.len(), 1);

        let err = store
            .resolve_approval("p1", &approval_id, ApprovalStatus::Rejected, None, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn oversized_change_values_are_summarized() {
        let store = StateStore::open_in_memory(
            LockService::open_in_memory().unwrap(),
            StateStoreConfig {
                change_value_cap: 64,
                ..StateStoreConfig::default()
            },
        )
        .unwrap();
        store
            .create_project("p1", spec(), Budget::new(Money::usd(5.0)), &WriteCtx::actor("api"))
            .await
            .unwrap();
        store
            .append_error(
                "p1",
                ErrorEntry::new(
                    montage_types::ErrorSeverity::Error,
                    "image_gen",
                    "x".repeat(500),
                ),
                &WriteCtx::actor("image_gen"),
            )
            .await
            .unwrap();
        let history = store.change_history("p1", 1).await.unwrap();
        let after = history[0].after.as_ref().unwrap();
        assert_eq!(after["truncated"], true);
    }

    #[tokio::test]
    async fn predicted_final_extrapolates_from_progress() {
        let store = store();
        seeded(&store).await;
        let ctx = WriteCtx::actor("orchestrator");
        store.add_cost("p1", 4.0, "image_generation", "kf", &ctx).await.unwrap();
        let mut shot_done = Shot::new("S01", 0, 3.0);
        shot_done.status = ShotStatus::PreviewReady;
        let mut patches = HashMap::new();
        patches.insert("S01".to_string(), serde_json::to_value(&shot_done).unwrap());
        patches.insert("S02".to_string(), serde_json::to_value(Shot::new("S02", 1, 3.0)).unwrap());
        store
            .lock_service()
            .acquire(&keys::shots_scope("p1"), "planner", DEFAULT_TTL)
            .unwrap();
        store
            .batch_update_shots("p1", patches, &ctx, "planner")
            .await
            .unwrap();
        let budget = store.get_budget("p1").await.unwrap();
        // Half the shots advanced at spend 4.0 -> projected 8.0 total.
        let predicted = budget.predicted_final.unwrap();
        assert!((predicted.amount - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn appended_change_gets_the_next_version() {
        let store = store();
        seeded(&store).await;
        let project = store
            .append_change(
                "p1",
                ChangeEntry {
                    version: 0, // store-assigned
                    timestamp: Utc::now(),
                    actor: "qa_agent".into(),
                    change_kind: "annotate".into(),
                    description: "manual qa note".into(),
                    path: "/shots/S01/qa".into(),
                    causation_event_id: None,
                    before: None,
                    after: Some(json!({"note": "grain visible in low light"})),
                },
            )
            .await
            .unwrap();
        assert_eq!(project.version, 2);
        assert_eq!(project.change_log.last().unwrap().version, 2);
        assert_eq!(project.change_log.last().unwrap().change_kind, "annotate");
    }

    #[tokio::test]
    async fn invalidation_feed_announces_writes() {
        let store = store();
        let mut feed = store.invalidation_feed();
        seeded(&store).await;
        assert_eq!(feed.recv().await.unwrap(), "p1");
    }

    #[tokio::test]
    async fn lock_mirror_reflects_active_locks() {
        let store = store();
        seeded(&store).await;
        store
            .lock_service()
            .acquire(&keys::shot("p1", "S01"), "image_gen", DEFAULT_TTL)
            .unwrap();
        let project = store
            .refresh_lock_mirror("p1", &WriteCtx::actor("orchestrator"))
            .await
            .unwrap();
        assert!(project.locks.contains_key(&keys::shot("p1", "S01")));
        assert_eq!(project.locks[&keys::shot("p1", "S01")].holder, "image_gen");
    }
}
