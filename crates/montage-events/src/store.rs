use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use montage_types::{CoreError, CoreResult, Event, EventKind};

use crate::{EventStoreConfig, EventSubscriber};

struct Subscription {
    subscriber: Arc<dyn EventSubscriber>,
    kinds: Vec<EventKind>,
}

#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub event_id: String,
    pub stream: String,
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: Event,
    pub group: String,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

/// Durable event log plus delivery pumps for registered consumer groups.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    bus: broadcast::Sender<Event>,
    subs: Arc<RwLock<HashMap<String, Subscription>>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    started: Arc<AtomicBool>,
    config: Arc<EventStoreConfig>,
}

impl EventStore {
    pub fn open(db_path: &Path, config: EventStoreConfig) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(db_path)?, config)
    }

    pub fn open_in_memory(config: EventStoreConfig) -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?, config)
    }

    fn init(conn: Connection, config: EventStoreConfig) -> CoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                stream      TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                project_id  TEXT NOT NULL,
                causation_id TEXT,
                timestamp   TEXT NOT NULL,
                body        TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_stream_seq ON events(stream, seq);
            CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id, timestamp);

            CREATE TABLE IF NOT EXISTS consumer_cursors (
                group_name TEXT NOT NULL,
                stream     TEXT NOT NULL,
                next_seq   INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (group_name, stream)
            );

            CREATE TABLE IF NOT EXISTS pending (
                group_name        TEXT NOT NULL,
                stream            TEXT NOT NULL,
                event_id          TEXT NOT NULL,
                seq               INTEGER NOT NULL,
                delivery_count    INTEGER NOT NULL DEFAULT 0,
                last_delivered_at TEXT NOT NULL,
                PRIMARY KEY (group_name, event_id)
            );

            CREATE TABLE IF NOT EXISTS dead_letters (
                group_name TEXT NOT NULL,
                event_id   TEXT NOT NULL,
                stream     TEXT NOT NULL,
                reason     TEXT NOT NULL,
                moved_at   TEXT NOT NULL,
                PRIMARY KEY (group_name, event_id)
            );

            CREATE TABLE IF NOT EXISTS handled_events (
                consumer   TEXT NOT NULL,
                event_id   TEXT NOT NULL,
                handled_at TEXT NOT NULL,
                PRIMARY KEY (consumer, event_id)
            );",
        )?;
        let (bus, _) = broadcast::channel(2048);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            bus,
            subs: Arc::new(RwLock::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
        })
    }

    /// Persist an event, assign its per-stream sequence, and fan out.
    ///
    /// The causation pointer must reference an already-persisted event,
    /// which keeps the causation graph acyclic by construction.
    pub async fn publish(&self, event: Event) -> CoreResult<String> {
        let body = serde_json::to_string(&event)?;
        let stream = event.kind.as_str();
        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            if let Some(cause) = &event.causation_id {
                let exists: Option<i64> = tx
                    .query_row("SELECT 1 FROM events WHERE id = ?1", params![cause], |r| {
                        r.get(0)
                    })
                    .optional()?;
                if exists.is_none() {
                    return Err(CoreError::Validation(format!(
                        "causation id `{cause}` does not reference a persisted event"
                    )));
                }
            }
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE stream = ?1",
                params![stream],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT INTO events (id, stream, seq, project_id, causation_id, timestamp, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id,
                    stream,
                    seq,
                    event.project_id,
                    event.causation_id,
                    event.timestamp.to_rfc3339(),
                    body
                ],
            )?;
            tx.commit()?;
        }
        debug!(event_id = %event.id, stream, "event published");
        // Local fast-path: co-located observers see the event immediately.
        // The durable pumps above remain authoritative.
        let id = event.id.clone();
        let _ = self.bus.send(event);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Register a consumer group. Idempotent: re-subscribing under the same
    /// name replaces the handler and keeps the group's cursor.
    pub async fn subscribe(
        &self,
        subscriber: Arc<dyn EventSubscriber>,
        kinds: Vec<EventKind>,
    ) -> CoreResult<()> {
        let name = subscriber.name().to_string();
        {
            let conn = self.conn.lock().await;
            for kind in &kinds {
                conn.execute(
                    "INSERT OR IGNORE INTO consumer_cursors (group_name, stream, next_seq)
                     VALUES (?1, ?2, 1)",
                    params![name, kind.as_str()],
                )?;
            }
        }
        let mut subs = self.subs.write().await;
        let already_running = self.started.load(Ordering::SeqCst) && subs.contains_key(&name);
        subs.insert(name.clone(), Subscription { subscriber, kinds });
        drop(subs);
        if self.started.load(Ordering::SeqCst) && !already_running {
            self.spawn_pump(name).await;
        }
        Ok(())
    }

    /// Begin delivery for every registered group.
    pub async fn start_consuming(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let names: Vec<String> = self.subs.read().await.keys().cloned().collect();
        for name in names {
            self.spawn_pump(name).await;
        }
    }

    /// Stop all delivery pumps. In-flight handlers finish their message.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Local fast-path receiver (synchronous broadcast inside `publish`).
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    async fn spawn_pump(&self, group: String) {
        let store = self.clone();
        tokio::spawn(async move {
            store.pump(group).await;
        });
    }

    async fn pump(&self, group: String) {
        loop {
            // Drain everything currently due, then wait for a publish
            // notification or the poll tick.
            loop {
                let batch = match self.claim_batch(&group).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        error!(%group, %err, "claim failed");
                        break;
                    }
                };
                if batch.is_empty() {
                    break;
                }
                let subscriber = {
                    let subs = self.subs.read().await;
                    subs.get(&group).map(|s| s.subscriber.clone())
                };
                let Some(subscriber) = subscriber else { return };
                for (event, delivery_count) in batch {
                    match subscriber.handle_event(&event).await {
                        Ok(()) => {
                            if let Err(err) = self.ack(&group, &event.id).await {
                                error!(%group, event_id = %event.id, %err, "ack failed");
                            }
                        }
                        Err(err) => {
                            warn!(
                                group,
                                event_id = %event.id,
                                delivery_count,
                                %err,
                                "handler failed; message stays pending"
                            );
                            if delivery_count >= self.config.redelivery_limit {
                                if let Err(dlq_err) =
                                    self.move_to_dead_letter(&group, &event, &err.to_string()).await
                                {
                                    error!(%group, %dlq_err, "dead-letter move failed");
                                }
                            }
                        }
                    }
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim due redeliveries plus fresh messages for `group`, bumping
    /// delivery counts inside one transaction so concurrent instances of the
    /// same group never double-claim.
    async fn claim_batch(&self, group: &str) -> CoreResult<Vec<(Event, u32)>> {
        let streams: Vec<String> = {
            let subs = self.subs.read().await;
            match subs.get(group) {
                Some(sub) => sub.kinds.iter().map(|k| k.as_str().to_string()).collect(),
                None => return Ok(Vec::new()),
            }
        };
        let now = Utc::now();
        let retry_cutoff = (now
            - chrono::Duration::from_std(self.config.redelivery_delay).unwrap_or_default())
        .to_rfc3339();
        let now_raw = now.to_rfc3339();
        let batch_limit = self.config.claim_batch as i64;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut out: Vec<(Event, u32)> = Vec::new();

        // Unacked deliveries whose retry delay has elapsed.
        {
            let mut stmt = tx.prepare(
                "SELECT p.event_id, p.delivery_count, e.body
                 FROM pending p JOIN events e ON e.id = p.event_id
                 WHERE p.group_name = ?1 AND p.last_delivered_at <= ?2
                 ORDER BY p.stream, p.seq
                 LIMIT ?3",
            )?;
            let rows: Vec<(String, u32, String)> = stmt
                .query_map(params![group, retry_cutoff, batch_limit], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<Result<_, _>>()?;
            for (event_id, count, body) in rows {
                tx.execute(
                    "UPDATE pending SET delivery_count = delivery_count + 1,
                         last_delivered_at = ?1
                     WHERE group_name = ?2 AND event_id = ?3",
                    params![now_raw, group, event_id],
                )?;
                let event: Event = serde_json::from_str(&body)?;
                out.push((event, count + 1));
            }
        }

        // Fresh messages past each stream cursor.
        for stream in &streams {
            let next_seq: i64 = tx
                .query_row(
                    "SELECT next_seq FROM consumer_cursors
                     WHERE group_name = ?1 AND stream = ?2",
                    params![group, stream],
                    |r| r.get(0),
                )
                .optional()?
                .unwrap_or(1);
            let rows: Vec<(String, i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, seq, body FROM events
                     WHERE stream = ?1 AND seq >= ?2
                     ORDER BY seq
                     LIMIT ?3",
                )?;
                let mapped = stmt.query_map(params![stream, next_seq, batch_limit], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<Result<_, _>>()?;
                mapped
            };
            let Some((_, last_seq, _)) = rows.last() else {
                continue;
            };
            let last_seq = *last_seq;
            for (event_id, seq, body) in rows {
                tx.execute(
                    "INSERT OR IGNORE INTO pending
                         (group_name, stream, event_id, seq, delivery_count, last_delivered_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![group, stream, event_id, seq, now_raw],
                )?;
                let event: Event = serde_json::from_str(&body)?;
                out.push((event, 1));
            }
            tx.execute(
                "INSERT INTO consumer_cursors (group_name, stream, next_seq)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_name, stream) DO UPDATE SET next_seq = ?3",
                params![group, stream, last_seq + 1],
            )?;
        }

        tx.commit()?;
        Ok(out)
    }

    async fn ack(&self, group: &str, event_id: &str) -> CoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM pending WHERE group_name = ?1 AND event_id = ?2",
            params![group, event_id],
        )?;
        Ok(())
    }

    async fn move_to_dead_letter(&self, group: &str, event: &Event, reason: &str) -> CoreResult<()> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT OR REPLACE INTO dead_letters
                     (group_name, event_id, stream, reason, moved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group,
                    event.id,
                    event.kind.as_str(),
                    reason,
                    Utc::now().to_rfc3339()
                ],
            )?;
            conn.execute(
                "DELETE FROM pending WHERE group_name = ?1 AND event_id = ?2",
                params![group, event.id],
            )?;
        }
        warn!(group, event_id = %event.id, "message dead-lettered");
        let error_event = Event::new(&event.project_id, EventKind::ErrorOccurred, "event_store")
            .caused_by(&event.id)
            .with_payload(serde_json::json!({
                "reason": "redelivery_limit",
                "group": group,
                "dead_letter": event.id,
                "detail": reason,
            }));
        Box::pin(self.publish(error_event)).await?;
        Ok(())
    }

    /// Historical read: all events for a project ordered by time, optionally
    /// filtered by kind and time window.
    pub async fn replay(
        &self,
        project_id: &str,
        kinds: Option<&[EventKind]>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<Event>> {
        let mut sql = String::from("SELECT body FROM events WHERE project_id = ?1");
        let mut args: Vec<String> = vec![project_id.to_string()];
        if let Some(kinds) = kinds {
            if kinds.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders: Vec<String> = kinds
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + i + 1))
                .collect();
            sql.push_str(&format!(" AND stream IN ({})", placeholders.join(", ")));
            args.extend(kinds.iter().map(|k| k.as_str().to_string()));
        }
        if let Some(since) = since {
            args.push(since.to_rfc3339());
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(until) = until {
            args.push(until.to_rfc3339());
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp, stream, seq");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|body| serde_json::from_str(&body).map_err(CoreError::from))
            .collect()
    }

    pub async fn get_event(&self, event_id: &str) -> CoreResult<Option<Event>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM events WHERE id = ?1",
                params![event_id],
                |r| r.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Walk causation pointers back to the root. Returns root-first order
    /// ending at `event_id`. Depth is capped; a missing link truncates the
    /// walk rather than failing.
    pub async fn causation_chain(&self, event_id: &str) -> CoreResult<Vec<Event>> {
        let mut chain = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor = Some(event_id.to_string());
        while let Some(id) = cursor {
            if chain.len() >= self.config.max_chain_depth || !seen.insert(id.clone()) {
                break;
            }
            let Some(event) = self.get_event(&id).await? else {
                break;
            };
            cursor = event.causation_id.clone();
            chain.push(event);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Whether `consumer` already recorded `event_id` as handled.
    pub async fn was_handled(&self, consumer: &str, event_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM handled_events WHERE consumer = ?1 AND event_id = ?2",
                params![consumer, event_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record that `consumer` handled `event_id`. Returns false when it was
    /// already recorded, letting idempotent consumers skip duplicates.
    pub async fn mark_handled(&self, consumer: &str, event_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO handled_events (consumer, event_id, handled_at)
             VALUES (?1, ?2, ?3)",
            params![consumer, event_id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub async fn pending_for(&self, group: &str) -> CoreResult<Vec<PendingInfo>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT event_id, stream, delivery_count FROM pending
             WHERE group_name = ?1 ORDER BY stream, seq",
        )?;
        let rows = stmt
            .query_map(params![group], |r| {
                Ok(PendingInfo {
                    event_id: r.get(0)?,
                    stream: r.get(1)?,
                    delivery_count: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn dead_letters(&self, group: &str) -> CoreResult<Vec<DeadLetter>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT d.reason, d.moved_at, e.body
             FROM dead_letters d JOIN events e ON e.id = d.event_id
             WHERE d.group_name = ?1 ORDER BY d.moved_at",
        )?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map(params![group], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<_, _>>()?;
        rows.into_iter()
            .map(|(reason, moved_at, body)| {
                Ok(DeadLetter {
                    event: serde_json::from_str(&body)?,
                    group: group.to_string(),
                    reason,
                    moved_at: DateTime::parse_from_rfc3339(&moved_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .collect()
    }

    /// Delete a project's events older than `cutoff` along with their
    /// delivery bookkeeping. Called for projects in a terminal status.
    pub async fn sweep_retention(
        &self,
        project_id: &str,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let cutoff_raw = cutoff.to_rfc3339();
        tx.execute(
            "DELETE FROM pending WHERE event_id IN
                 (SELECT id FROM events WHERE project_id = ?1 AND timestamp < ?2)",
            params![project_id, cutoff_raw],
        )?;
        tx.execute(
            "DELETE FROM dead_letters WHERE event_id IN
                 (SELECT id FROM events WHERE project_id = ?1 AND timestamp < ?2)",
            params![project_id, cutoff_raw],
        )?;
        tx.execute(
            "DELETE FROM handled_events WHERE event_id IN
                 (SELECT id FROM events WHERE project_id = ?1 AND timestamp < ?2)",
            params![project_id, cutoff_raw],
        )?;
        let removed = tx.execute(
            "DELETE FROM events WHERE project_id = ?1 AND timestamp < ?2",
            params![project_id, cutoff_raw],
        )?;
        tx.commit()?;
        Ok(removed)
    }
}
