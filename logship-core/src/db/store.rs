//! Durable log store
//!
//! A capacity-bounded queue of serialized logs keyed by group. Each record
//! is either pending (`batch_id IS NULL`) or claimed by exactly one batch.
//!
//! Every public operation runs under the connection mutex and, where it
//! touches more than one row, inside an immediate transaction, so concurrent
//! callers never observe or produce a half-applied change.

use crate::error::{Error, Result};
use crate::types::{Log, LogContainer};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use super::schema;

const INSTALL_ID_KEY: &str = "install_id";

/// Queue statistics for one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub group_id: String,
    /// Logs not yet claimed
    pub pending: usize,
    /// Logs belonging to an in-flight batch
    pub claimed: usize,
    /// Creation time of the oldest stored log
    pub oldest: Option<DateTime<Utc>>,
}

/// SQLite-backed log queue shared by every channel unit.
pub struct LogStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    default_capacity: usize,
    capacities: RwLock<HashMap<String, usize>>,
}

impl LogStore {
    /// Open or create a store at the given path, as the process that owns
    /// delivery for it.
    ///
    /// A file that is not a valid database, or whose schema fails validation,
    /// is rebuilt from scratch. Records left claimed by a previous process are
    /// returned to pending.
    pub fn open(path: &Path, default_capacity: usize) -> Result<Self> {
        let store = Self::open_shared(path, default_capacity)?;
        store.release_orphaned()?;
        Ok(store)
    }

    /// Open or create a store without touching claimed records.
    ///
    /// For tools inspecting a queue that a running process may be
    /// delivering from.
    pub fn open_shared(path: &Path, default_capacity: usize) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(Error::Database(e)) if is_corruption(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Queue database is unreadable, recreating"
                );
                remove_database_files(path)?;
                Self::open_connection(path)?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            default_capacity: default_capacity.max(1),
            capacities: RwLock::new(HashMap::new()),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(default_capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        prepare_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            default_capacity: default_capacity.max(1),
            capacities: RwLock::new(HashMap::new()),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;

        // WAL mode lets readers proceed while a unit writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        prepare_schema(&conn)?;
        Ok(conn)
    }

    /// Path of the backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageCorrupt("connection lock poisoned".to_string()))
    }

    // ============================================
    // Capacity
    // ============================================

    /// Set the maximum number of logs retained for a group.
    pub fn set_capacity(&self, group_id: &str, capacity: usize) {
        if let Ok(mut capacities) = self.capacities.write() {
            capacities.insert(group_id.to_string(), capacity.max(1));
        }
    }

    /// Capacity for a group, falling back to the store default.
    pub fn capacity(&self, group_id: &str) -> usize {
        self.capacities
            .read()
            .ok()
            .and_then(|c| c.get(group_id).copied())
            .unwrap_or(self.default_capacity)
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Append a log for a group, returning its record id.
    ///
    /// When the group is at capacity the oldest pending logs are evicted to
    /// make room. Fails with [`Error::StorageFull`] only when every stored log
    /// of the group belongs to an in-flight batch.
    pub fn put(&self, group_id: &str, log: &Log) -> Result<i64> {
        let serialized = serde_json::to_string(log)?;
        let capacity = self.capacity(group_id);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut count = count_where(&tx, "group_id = ?1", group_id)?;
        while count >= capacity {
            let oldest: Option<i64> = tx
                .query_row(
                    "SELECT id FROM logs WHERE group_id = ?1 AND batch_id IS NULL ORDER BY id ASC LIMIT 1",
                    [group_id],
                    |r| r.get(0),
                )
                .optional()?;

            match oldest {
                Some(id) => {
                    tx.execute("DELETE FROM logs WHERE id = ?1", [id])?;
                    count -= 1;
                    tracing::warn!(
                        group_id,
                        record_id = id,
                        capacity,
                        "Storage capacity reached, evicted oldest pending log"
                    );
                }
                None => {
                    return Err(Error::StorageFull {
                        group_id: group_id.to_string(),
                    });
                }
            }
        }

        tx.execute(
            "INSERT INTO logs (group_id, log, batch_id, created_at) VALUES (?1, ?2, NULL, ?3)",
            params![group_id, serialized, Utc::now().to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(id)
    }

    /// Claim up to `limit` pending logs of a group, oldest first.
    ///
    /// Returns `None` when the group has nothing pending. Records that no
    /// longer deserialize are deleted instead of claimed.
    pub fn claim_batch(&self, group_id: &str, limit: usize) -> Result<Option<LogContainer>> {
        if limit == 0 {
            return Ok(None);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let batch_id = Uuid::new_v4().to_string();
        let mut logs = Vec::new();
        let mut record_ids = Vec::new();

        loop {
            let rows: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, log FROM logs WHERE group_id = ?1 AND batch_id IS NULL ORDER BY id ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![group_id, limit as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            if rows.is_empty() {
                break;
            }

            for (id, raw) in rows {
                match serde_json::from_str::<Log>(&raw) {
                    Ok(log) => {
                        tx.execute(
                            "UPDATE logs SET batch_id = ?1 WHERE id = ?2",
                            params![batch_id, id],
                        )?;
                        logs.push(log);
                        record_ids.push(id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            group_id,
                            record_id = id,
                            error = %e,
                            "Dropping stored log that no longer deserializes"
                        );
                        tx.execute("DELETE FROM logs WHERE id = ?1", [id])?;
                    }
                }
            }

            if !logs.is_empty() {
                break;
            }
        }

        tx.commit()?;

        if logs.is_empty() {
            return Ok(None);
        }

        tracing::debug!(group_id, batch_id = %batch_id, count = logs.len(), "Claimed batch");
        Ok(Some(LogContainer {
            batch_id,
            group_id: group_id.to_string(),
            logs,
            record_ids,
        }))
    }

    /// Permanently remove every log of a batch. Unknown ids are a no-op.
    pub fn delete(&self, batch_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM logs WHERE batch_id = ?1", [batch_id])?;
        Ok(deleted)
    }

    /// Return every log of a batch to pending.
    pub fn release_batch(&self, batch_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let released = conn.execute(
            "UPDATE logs SET batch_id = NULL WHERE batch_id = ?1",
            [batch_id],
        )?;
        Ok(released)
    }

    /// Return every claimed log to pending.
    ///
    /// Run on open: no delivery call survives a restart, so any claim found
    /// in the database was abandoned.
    pub fn release_orphaned(&self) -> Result<usize> {
        let conn = self.conn()?;
        let released = conn.execute(
            "UPDATE logs SET batch_id = NULL WHERE batch_id IS NOT NULL",
            [],
        )?;
        if released > 0 {
            tracing::info!(released, "Returned orphaned batch logs to pending");
        }
        Ok(released)
    }

    /// Delete every log of a group, claimed or not.
    pub fn delete_group(&self, group_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM logs WHERE group_id = ?1", [group_id])?;
        conn.execute("DELETE FROM flush_timers WHERE group_id = ?1", [group_id])?;
        Ok(deleted)
    }

    /// Count logs of a group not yet claimed by a batch
    pub fn count_pending(&self, group_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        count_where(&conn, "group_id = ?1 AND batch_id IS NULL", group_id)
    }

    /// Count logs of a group belonging to in-flight batches
    pub fn count_claimed(&self, group_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        count_where(&conn, "group_id = ?1 AND batch_id IS NOT NULL", group_id)
    }

    /// Count every stored log of a group
    pub fn count_all(&self, group_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        count_where(&conn, "group_id = ?1", group_id)
    }

    /// Per-group statistics for every group with stored logs
    pub fn groups(&self) -> Result<Vec<GroupStats>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT group_id,
                   SUM(CASE WHEN batch_id IS NULL THEN 1 ELSE 0 END) AS pending,
                   SUM(CASE WHEN batch_id IS NULL THEN 0 ELSE 1 END) AS claimed,
                   MIN(created_at) AS oldest
            FROM logs
            GROUP BY group_id
            ORDER BY group_id
            "#,
        )?;

        let stats = stmt
            .query_map([], |row| {
                let oldest: Option<String> = row.get("oldest")?;
                Ok(GroupStats {
                    group_id: row.get("group_id")?,
                    pending: row.get::<_, i64>("pending")? as usize,
                    claimed: row.get::<_, i64>("claimed")? as usize,
                    oldest: oldest.as_deref().and_then(parse_timestamp),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(stats)
    }

    // ============================================
    // Metadata
    // ============================================

    /// Installation id, generated on first use and stable afterwards.
    pub fn install_id(&self) -> Result<Uuid> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO metadata (key, value) VALUES (?1, ?2)",
            params![INSTALL_ID_KEY, Uuid::new_v4().to_string()],
        )?;
        let value: String = conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [INSTALL_ID_KEY],
            |r| r.get(0),
        )?;
        Uuid::parse_str(&value)
            .map_err(|e| Error::StorageCorrupt(format!("invalid install id {}: {}", value, e)))
    }

    /// Record when a group's batch timer started.
    pub fn set_timer_start(&self, group_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO flush_timers (group_id, started_at) VALUES (?1, ?2)
            ON CONFLICT(group_id) DO UPDATE SET started_at = excluded.started_at
            "#,
            params![group_id, started_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// When a group's batch timer started, if one is running.
    pub fn timer_start(&self, group_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT started_at FROM flush_timers WHERE group_id = ?1",
                [group_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value.as_deref().and_then(parse_timestamp))
    }

    pub fn clear_timer_start(&self, group_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM flush_timers WHERE group_id = ?1", [group_id])?;
        Ok(())
    }
}

/// Migrate, then rebuild the schema if it still fails validation.
fn prepare_schema(conn: &Connection) -> Result<()> {
    let migrated = schema::run_migrations(conn);
    let problem = match migrated {
        Ok(()) => schema::validate_schema(conn).err(),
        Err(e) => Some(e.to_string()),
    };

    if let Some(problem) = problem {
        tracing::warn!(problem = %problem, "Queue schema invalid, reinitializing");
        schema::reset_schema(conn)?;
        schema::validate_schema(conn).map_err(Error::StorageCorrupt)?;
    }
    Ok(())
}

fn count_where(conn: &Connection, filter: &str, group_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM logs WHERE {}", filter),
        [group_id],
        |r| r.get(0),
    )?;
    Ok(count as usize)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn is_corruption(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::NotADatabase || e.code == ErrorCode::DatabaseCorrupt
    )
}

fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);
        if candidate.exists() {
            std::fs::remove_file(&candidate)?;
        }
    }
    Ok(())
}
