//! Named distributed locks with TTL and owner-scoped release.
//!
//! Acquisition is a single atomic upsert against the lock table: it succeeds
//! when the key is free, when the existing lease has expired, or when the
//! caller already holds the key (heartbeat re-acquire extends the lease).
//! Release is a check-and-delete scoped to the owner so a lock stolen via
//! TTL expiry cannot be released by the previous holder.

pub mod keys;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use montage_types::{CoreError, CoreResult};

/// Default lease length. Holders that outlive it must heartbeat.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Poll interval in blocking mode.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LockService {
    conn: Arc<Mutex<Connection>>,
}

impl LockService {
    pub fn open(db_path: &Path) -> CoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS locks (
                key         TEXT PRIMARY KEY,
                owner       TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at  TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Try to take `key` for `owner`. Returns false when the key is held by
    /// someone else and not yet expired. Re-acquiring a key you already hold
    /// extends the lease (heartbeat).
    pub fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> CoreResult<bool> {
        let now = Utc::now();
        let expires = now
            + ChronoDuration::from_std(ttl)
                .map_err(|e| CoreError::Validation(format!("ttl out of range: {e}")))?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO locks (key, owner, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 owner = excluded.owner,
                 acquired_at = excluded.acquired_at,
                 expires_at = excluded.expires_at
             WHERE locks.expires_at <= ?3 OR locks.owner = excluded.owner",
            params![key, owner, now.to_rfc3339(), expires.to_rfc3339()],
        )?;
        if changed > 0 {
            debug!(key, owner, "lock acquired");
        }
        Ok(changed > 0)
    }

    /// Blocking acquire: poll every 100 ms until taken or `timeout` elapses.
    /// A zero timeout degenerates to a single non-blocking attempt.
    pub async fn acquire_blocking(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> CoreResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.acquire(key, owner, ttl)? {
                return Ok(true);
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Release `key` if and only if `owner` still holds it.
    pub fn release(&self, key: &str, owner: &str) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        if changed == 0 {
            warn!(key, owner, "release without holding the lock");
        }
        Ok(changed > 0)
    }

    /// Current unexpired holder of `key`, if any.
    pub fn holder(&self, key: &str) -> CoreResult<Option<LockInfo>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT key, owner, acquired_at, expires_at FROM locks
                 WHERE key = ?1 AND expires_at > ?2",
                params![key, Utc::now().to_rfc3339()],
                row_to_info,
            )
            .optional()?;
        Ok(row)
    }

    /// True when `owner` currently holds `key`.
    pub fn is_held_by(&self, key: &str, owner: &str) -> CoreResult<bool> {
        Ok(self
            .holder(key)?
            .map(|info| info.owner == owner)
            .unwrap_or(false))
    }

    /// Active (unexpired) locks whose key starts with `prefix`. Used to
    /// refresh the advisory mirror in the project aggregate.
    pub fn active_with_prefix(&self, prefix: &str) -> CoreResult<Vec<LockInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, owner, acquired_at, expires_at FROM locks
             WHERE key LIKE ?1 || '%' AND expires_at > ?2
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![prefix, Utc::now().to_rfc3339()], row_to_info)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop expired rows. Expiry is already honored by reads and acquires;
    /// the sweep just keeps the table small.
    pub fn sweep_expired(&self) -> CoreResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM locks WHERE expires_at <= ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(removed)
    }

    /// Acquire returning a guard that releases on every exit path.
    pub fn guard(&self, key: &str, owner: &str, ttl: Duration) -> CoreResult<Option<LockGuard>> {
        if self.acquire(key, owner, ttl)? {
            Ok(Some(LockGuard {
                service: self.clone(),
                key: key.to_string(),
                owner: owner.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

fn row_to_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockInfo> {
    let acquired: String = row.get(2)?;
    let expires: String = row.get(3)?;
    Ok(LockInfo {
        key: row.get(0)?,
        owner: row.get(1)?,
        acquired_at: parse_ts(&acquired),
        expires_at: parse_ts(&expires),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Scoped lock: releases on drop (success, error, or panic unwind).
pub struct LockGuard {
    service: LockService,
    key: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lease while still holding the lock.
    pub fn heartbeat(&self, ttl: Duration) -> CoreResult<bool> {
        self.service.acquire(&self.key, &self.owner, ttl)
    }

    /// Explicit early release.
    pub fn release(mut self) -> CoreResult<bool> {
        self.released = true;
        self.service.release(&self.key, &self.owner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.service.release(&self.key, &self.owner);
        }
    }
}
