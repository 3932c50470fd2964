//! SQLite adapter for `CoordinationStore`.
//!
//! Schema and pragmas match §6 of the coordination spec: WAL journaling, a
//! busy timeout of at least 5s, and the five tables (`sessions`, `locks`,
//! `change_journal`, `conflicts`, `system_info`). A single
//! `parking_lot::Mutex<rusqlite::Connection>` enforces the single-writer
//! discipline §5 requires; every multi-step sequence (deregister, conflict
//! resolution) runs inside one `IMMEDIATE` transaction so a crash mid-sequence
//! never leaves a half-applied mutation visible to another process.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{
    ChangeJournalEntry, Conflict, ConflictResolution, ConflictSeverity, ConflictStatus,
    ConflictType, ConflictingSession, CoordinationStore, LockAcquireOutcome, SessionRecord,
};
use crate::error::{ErrorKind, Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id              INTEGER PRIMARY KEY,
    project_path    TEXT NOT NULL,
    agent_type      TEXT NOT NULL,
    started_at      INTEGER NOT NULL,
    last_heartbeat  INTEGER NOT NULL,
    metadata        TEXT NOT NULL DEFAULT 'null',
    pid             INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_project_path ON sessions(project_path);
CREATE INDEX IF NOT EXISTS idx_sessions_last_heartbeat ON sessions(last_heartbeat);

CREATE TABLE IF NOT EXISTS locks (
    resource        TEXT PRIMARY KEY,
    session_id      INTEGER NOT NULL,
    acquired_at     INTEGER NOT NULL,
    expires_at      INTEGER NOT NULL,
    lock_type       TEXT NOT NULL DEFAULT 'exclusive',
    refresh_count   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_locks_session_id ON locks(session_id);
CREATE INDEX IF NOT EXISTS idx_locks_expires_at ON locks(expires_at);

CREATE TABLE IF NOT EXISTS change_journal (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id      INTEGER NOT NULL,
    resource        TEXT NOT NULL,
    operation       TEXT NOT NULL,
    change_data     TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    applied         INTEGER NOT NULL DEFAULT 0,
    checksum        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_change_journal_resource_created
    ON change_journal(resource, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_change_journal_session_id ON change_journal(session_id);
CREATE INDEX IF NOT EXISTS idx_change_journal_unapplied
    ON change_journal(applied) WHERE applied = 0;

CREATE TABLE IF NOT EXISTS conflicts (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    type                    TEXT NOT NULL,
    resource                TEXT NOT NULL,
    detected_at             INTEGER NOT NULL,
    severity                TEXT NOT NULL,
    session_a_id            INTEGER NOT NULL,
    session_a_data          TEXT NOT NULL,
    session_a_version       INTEGER NOT NULL,
    session_a_timestamp     INTEGER NOT NULL,
    session_b_id            INTEGER NOT NULL,
    session_b_data          TEXT NOT NULL,
    session_b_version       INTEGER NOT NULL,
    session_b_timestamp     INTEGER NOT NULL,
    affected_task_ids       TEXT NOT NULL DEFAULT '[]',
    field_conflicts         TEXT NOT NULL DEFAULT 'null',
    description             TEXT,
    status                  TEXT NOT NULL DEFAULT 'pending',
    resolution              TEXT,
    resolution_data         TEXT,
    resolved_at             INTEGER,
    resolved_by             TEXT,
    resolution_notes        TEXT
);
CREATE INDEX IF NOT EXISTS idx_conflicts_pending ON conflicts(status) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_conflicts_detected_at ON conflicts(detected_at);

CREATE TABLE IF NOT EXISTS system_info (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);
"#;

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn session_from_row(row: &Row) -> rusqlite::Result<SessionRecord> {
    let metadata_text: String = row.get("metadata")?;
    Ok(SessionRecord {
        id: row.get("id")?,
        project_path: row.get("project_path")?,
        agent_type: row.get("agent_type")?,
        started_at: from_ms(row.get("started_at")?),
        last_heartbeat: from_ms(row.get("last_heartbeat")?),
        metadata: serde_json::from_str(&metadata_text).unwrap_or(serde_json::Value::Null),
        pid: row.get::<_, Option<i64>>("pid")?.map(|p| p as u32),
    })
}

fn change_entry_from_row(row: &Row) -> rusqlite::Result<ChangeJournalEntry> {
    let change_data_text: String = row.get("change_data")?;
    Ok(ChangeJournalEntry {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        resource: row.get("resource")?,
        operation: row.get("operation")?,
        change_data: serde_json::from_str(&change_data_text).unwrap_or(serde_json::Value::Null),
        created_at: from_ms(row.get("created_at")?),
        applied: row.get::<_, i64>("applied")? != 0,
        checksum: row.get("checksum")?,
    })
}

fn conflict_type_from_str(s: &str) -> Option<ConflictType> {
    match s {
        "VERSION_CONFLICT" => Some(ConflictType::VersionConflict),
        "CONCURRENT_EDIT" => Some(ConflictType::ConcurrentEdit),
        "STALE_LOCK" => Some(ConflictType::StaleLock),
        "MERGE_FAILURE" => Some(ConflictType::MergeFailure),
        _ => None,
    }
}

fn severity_from_str(s: &str) -> Option<ConflictSeverity> {
    match s {
        "info" => Some(ConflictSeverity::Info),
        "warning" => Some(ConflictSeverity::Warning),
        "critical" => Some(ConflictSeverity::Critical),
        _ => None,
    }
}

fn severity_as_str(s: ConflictSeverity) -> &'static str {
    match s {
        ConflictSeverity::Info => "info",
        ConflictSeverity::Warning => "warning",
        ConflictSeverity::Critical => "critical",
    }
}

fn status_from_str(s: &str) -> Option<ConflictStatus> {
    match s {
        "pending" => Some(ConflictStatus::Pending),
        "resolved" => Some(ConflictStatus::Resolved),
        "auto-resolved" => Some(ConflictStatus::AutoResolved),
        "escalated" => Some(ConflictStatus::Escalated),
        _ => None,
    }
}

fn status_as_str(s: ConflictStatus) -> &'static str {
    match s {
        ConflictStatus::Pending => "pending",
        ConflictStatus::Resolved => "resolved",
        ConflictStatus::AutoResolved => "auto-resolved",
        ConflictStatus::Escalated => "escalated",
    }
}

fn resolution_from_str(s: &str) -> Option<ConflictResolution> {
    match s {
        "version_a" => Some(ConflictResolution::VersionA),
        "version_b" => Some(ConflictResolution::VersionB),
        "merged" => Some(ConflictResolution::Merged),
        "manual" => Some(ConflictResolution::Manual),
        "discarded" => Some(ConflictResolution::Discarded),
        _ => None,
    }
}

fn resolution_as_str(r: ConflictResolution) -> &'static str {
    match r {
        ConflictResolution::VersionA => "version_a",
        ConflictResolution::VersionB => "version_b",
        ConflictResolution::Merged => "merged",
        ConflictResolution::Manual => "manual",
        ConflictResolution::Discarded => "discarded",
    }
}

fn conflict_from_row(row: &Row) -> rusqlite::Result<Conflict> {
    let type_text: String = row.get("type")?;
    let severity_text: String = row.get("severity")?;
    let status_text: String = row.get("status")?;
    let resolution_text: Option<String> = row.get("resolution")?;
    let session_a_data: String = row.get("session_a_data")?;
    let session_b_data: String = row.get("session_b_data")?;
    let affected_ids_text: String = row.get("affected_task_ids")?;
    let field_conflicts_text: String = row.get("field_conflicts")?;

    Ok(Conflict {
        id: row.get("id")?,
        conflict_type: conflict_type_from_str(&type_text)
            .unwrap_or(ConflictType::VersionConflict),
        resource: row.get("resource")?,
        detected_at: from_ms(row.get("detected_at")?),
        severity: severity_from_str(&severity_text).unwrap_or(ConflictSeverity::Warning),
        session_a: ConflictingSession {
            session_id: row.get("session_a_id")?,
            data: serde_json::from_str(&session_a_data).unwrap_or(serde_json::Value::Null),
            version: row.get("session_a_version")?,
            timestamp: from_ms(row.get("session_a_timestamp")?),
        },
        session_b: ConflictingSession {
            session_id: row.get("session_b_id")?,
            data: serde_json::from_str(&session_b_data).unwrap_or(serde_json::Value::Null),
            version: row.get("session_b_version")?,
            timestamp: from_ms(row.get("session_b_timestamp")?),
        },
        affected_ids: serde_json::from_str(&affected_ids_text).unwrap_or_default(),
        field_conflicts: serde_json::from_str(&field_conflicts_text)
            .unwrap_or(serde_json::Value::Null),
        description: row.get("description")?,
        status: status_from_str(&status_text).unwrap_or(ConflictStatus::Pending),
        resolution: resolution_text.and_then(|s| resolution_from_str(&s)),
        resolved_at: row
            .get::<_, Option<i64>>("resolved_at")?
            .map(from_ms),
        resolved_by: row.get("resolved_by")?,
        resolution_notes: row.get("resolution_notes")?,
    })
}

/// `rusqlite`-backed implementation of [`CoordinationStore`].
pub struct SqliteCoordinationStore {
    conn: Mutex<Connection>,
}

impl SqliteCoordinationStore {
    /// Open (creating if absent) a coordination database at `path`.
    ///
    /// Returns [`StorageError::store_unavailable`] if the file cannot be
    /// opened or the directory does not exist — callers are expected to fall
    /// back to an in-memory registry on this error (§4.2).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let conn = Connection::open(path_ref).map_err(|e| {
            StorageError::store_unavailable(format!(
                "failed to open coordination store at {}: {e}",
                path_ref.display()
            ))
            .with_source(e)
        })?;
        Self::from_connection(conn)
    }

    /// Open a transient, process-local in-memory store. Useful for tests and
    /// for the registry's own unit tests of logic layered above the store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert_new_lock(
        conn: &Connection,
        resource: &str,
        session_id: i64,
        acquired_at_ms: i64,
        ttl_ms: i64,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO locks (resource, session_id, acquired_at, expires_at, lock_type, refresh_count)
             VALUES (?1, ?2, ?3, ?4, 'exclusive', 0)",
            params![resource, session_id, acquired_at_ms, acquired_at_ms + ttl_ms],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    // ── Locks ──────────────────────────────────────────────────────────────

    async fn acquire_lock(
        &self,
        resource: &str,
        session_id: i64,
        ttl_ms: i64,
    ) -> Result<LockAcquireOutcome> {
        let conn = self.conn.lock();
        let now = Utc::now();
        let now_ms = to_ms(now);

        let existing: Option<(i64, i64, u32)> = conn
            .query_row(
                "SELECT session_id, expires_at, refresh_count FROM locks WHERE resource = ?1",
                params![resource],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            // Branch 1: expired — delete and insert fresh, as if absent.
            Some((holder, expires_at, _)) if expires_at <= now_ms => {
                conn.execute("DELETE FROM locks WHERE resource = ?1", params![resource])?;
                Self::insert_new_lock(&conn, resource, session_id, now_ms, ttl_ms)?;
                Ok(LockAcquireOutcome::acquired_after_expiry(
                    from_ms(now_ms + ttl_ms),
                    holder,
                ))
            }
            // Branch 2: same holder — extend in place.
            Some((holder, _, refresh_count)) if holder == session_id => {
                let new_expires_at = now_ms + ttl_ms;
                let new_refresh_count = refresh_count + 1;
                conn.execute(
                    "UPDATE locks SET expires_at = ?1, refresh_count = ?2 WHERE resource = ?3",
                    params![new_expires_at, new_refresh_count, resource],
                )?;
                Ok(LockAcquireOutcome::extended(
                    from_ms(new_expires_at),
                    new_refresh_count,
                ))
            }
            // Branch 3: different holder, still valid — denied.
            Some((holder, expires_at, _)) => {
                Ok(LockAcquireOutcome::denied(holder, expires_at - now_ms))
            }
            // Branch 4: absent — insert; on a uniqueness race, re-read and
            // report the winner.
            None => match Self::insert_new_lock(&conn, resource, session_id, now_ms, ttl_ms) {
                Ok(()) => Ok(LockAcquireOutcome::acquired_new(from_ms(now_ms + ttl_ms))),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    let (holder, expires_at, _): (i64, i64, u32) = conn.query_row(
                        "SELECT session_id, expires_at, refresh_count FROM locks WHERE resource = ?1",
                        params![resource],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;
                    Ok(LockAcquireOutcome::denied(holder, expires_at - now_ms))
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn release_lock(&self, resource: &str, session_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let now_ms = to_ms(Utc::now());

        let existing: Option<(i64, i64)> = conn
            .query_row(
                "SELECT session_id, expires_at FROM locks WHERE resource = ?1",
                params![resource],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => Ok(true),
            Some((_, expires_at)) if expires_at <= now_ms => {
                conn.execute("DELETE FROM locks WHERE resource = ?1", params![resource])?;
                Ok(true)
            }
            Some((holder, _)) if holder != session_id => Ok(false),
            Some(_) => {
                conn.execute("DELETE FROM locks WHERE resource = ?1", params![resource])?;
                Ok(true)
            }
        }
    }

    async fn refresh_lock(&self, resource: &str, session_id: i64, ttl_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        let now_ms = to_ms(Utc::now());

        let existing: Option<(i64, i64)> = conn
            .query_row(
                "SELECT session_id, expires_at FROM locks WHERE resource = ?1",
                params![resource],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            None => Err(StorageError::new(
                ErrorKind::LockDoesNotExist,
                format!("no lock held on {resource}"),
            )),
            Some((_, expires_at)) if expires_at <= now_ms => Err(StorageError::new(
                ErrorKind::LockExpired,
                format!("lock on {resource} already expired"),
            )),
            Some((holder, _)) if holder != session_id => Err(StorageError::lock_held_by_other(
                resource,
                holder.to_string(),
            )),
            Some(_) => {
                conn.execute(
                    "UPDATE locks SET expires_at = ?1, refresh_count = refresh_count + 1 WHERE resource = ?2",
                    params![now_ms + ttl_ms, resource],
                )?;
                Ok(())
            }
        }
    }

    async fn is_lock_held(&self, resource: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let now_ms = to_ms(Utc::now());
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM locks WHERE resource = ?1",
                params![resource],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(expires_at, Some(e) if e > now_ms))
    }

    async fn cleanup_expired_locks(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let now_ms = to_ms(Utc::now());
        let removed = conn.execute("DELETE FROM locks WHERE expires_at <= ?1", params![now_ms])?;
        Ok(removed as u64)
    }

    // ── Sessions ───────────────────────────────────────────────────────────

    async fn register_session(&self, session: SessionRecord) -> Result<i64> {
        let conn = self.conn.lock();
        let metadata_text = serde_json::to_string(&session.metadata)?;

        // `id = 0` (the `SessionRecord::new` default) means "assign one";
        // a caller that already owns a monotonic id allocator (the Session
        // Registry's own `nextId`, kept as the single persisted id space per
        // spec §9) supplies it explicitly and `sessions.id` takes that value
        // instead of the SQLite-assigned rowid.
        if session.id != 0 {
            conn.execute(
                "INSERT INTO sessions (id, project_path, agent_type, started_at, last_heartbeat, metadata, pid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.project_path,
                    session.agent_type,
                    to_ms(session.started_at),
                    to_ms(session.last_heartbeat),
                    metadata_text,
                    session.pid.map(|p| p as i64),
                ],
            )?;
            return Ok(session.id);
        }

        conn.execute(
            "INSERT INTO sessions (project_path, agent_type, started_at, last_heartbeat, metadata, pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.project_path,
                session.agent_type,
                to_ms(session.started_at),
                to_ms(session.last_heartbeat),
                metadata_text,
                session.pid.map(|p| p as i64),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_heartbeat(&self, session_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let now_ms = to_ms(Utc::now());
        let updated = conn.execute(
            "UPDATE sessions SET last_heartbeat = ?1 WHERE id = ?2",
            params![now_ms, session_id],
        )?;
        if updated == 0 {
            return Err(StorageError::session_not_found(session_id.to_string()));
        }
        Ok(())
    }

    async fn deregister_session(&self, session_id: i64) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM locks WHERE session_id = ?1",
            params![session_id],
        )?;
        let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        if removed == 0 {
            return Err(StorageError::session_not_found(session_id.to_string()));
        }
        Ok(())
    }

    async fn get_active_sessions(&self, threshold_ms: i64) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let cutoff = to_ms(Utc::now()) - threshold_ms;
        let mut stmt =
            conn.prepare("SELECT * FROM sessions WHERE last_heartbeat >= ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![cutoff], session_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn cleanup_stale_sessions(&self, threshold_ms: i64) -> Result<u64> {
        let mut conn = self.conn.lock();
        let cutoff = to_ms(Utc::now()) - threshold_ms;
        let tx = conn.transaction()?;

        let stale_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM sessions WHERE last_heartbeat < ?1")?;
            stmt.query_map(params![cutoff], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for id in &stale_ids {
            tx.execute("DELETE FROM locks WHERE session_id = ?1", params![id])?;
        }
        tx.execute(
            "DELETE FROM sessions WHERE last_heartbeat < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(stale_ids.len() as u64)
    }

    // ── Change journal ─────────────────────────────────────────────────────

    async fn record_change(&self, entry: ChangeJournalEntry) -> Result<i64> {
        let conn = self.conn.lock();
        let change_data_text = serde_json::to_string(&entry.change_data)?;
        let checksum = ChangeJournalEntry::digest(&entry.change_data);
        conn.execute(
            "INSERT INTO change_journal (session_id, resource, operation, change_data, created_at, applied, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.session_id,
                entry.resource,
                entry.operation,
                change_data_text,
                to_ms(entry.created_at),
                entry.applied as i64,
                checksum,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_recent_changes(&self, limit: usize) -> Result<Vec<ChangeJournalEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM change_journal ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], change_entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn mark_change_applied(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE change_journal SET applied = 1 WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(StorageError::new(
                ErrorKind::Database,
                format!("change journal entry {id} not found"),
            ));
        }
        Ok(())
    }

    async fn prune_old_changes(&self, max_age_ms: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let cutoff = to_ms(Utc::now()) - max_age_ms;
        let removed = conn.execute(
            "DELETE FROM change_journal WHERE applied = 1 AND created_at <= ?1",
            params![cutoff],
        )?;
        Ok(removed as u64)
    }

    // ── Conflicts ──────────────────────────────────────────────────────────

    async fn record_conflict(&self, conflict: Conflict) -> Result<i64> {
        let conn = self.conn.lock();
        let session_a_data = serde_json::to_string(&conflict.session_a.data)?;
        let session_b_data = serde_json::to_string(&conflict.session_b.data)?;
        let affected_ids = serde_json::to_string(&conflict.affected_ids)?;
        let field_conflicts = serde_json::to_string(&conflict.field_conflicts)?;

        conn.execute(
            "INSERT INTO conflicts (
                type, resource, detected_at, severity,
                session_a_id, session_a_data, session_a_version, session_a_timestamp,
                session_b_id, session_b_data, session_b_version, session_b_timestamp,
                affected_task_ids, field_conflicts, description, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                conflict.conflict_type.as_str(),
                conflict.resource,
                to_ms(conflict.detected_at),
                severity_as_str(conflict.severity),
                conflict.session_a.session_id,
                session_a_data,
                conflict.session_a.version,
                to_ms(conflict.session_a.timestamp),
                conflict.session_b.session_id,
                session_b_data,
                conflict.session_b.version,
                to_ms(conflict.session_b.timestamp),
                affected_ids,
                field_conflicts,
                conflict.description,
                status_as_str(conflict.status),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_pending_conflicts(&self) -> Result<Vec<Conflict>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM conflicts WHERE status = 'pending' ORDER BY detected_at",
        )?;
        let rows = stmt
            .query_map([], conflict_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn resolve_conflict(
        &self,
        id: i64,
        resolution: ConflictResolution,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let current_status: Option<String> = tx
            .query_row(
                "SELECT status FROM conflicts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match current_status.as_deref() {
            None => {
                return Err(StorageError::conflict_not_found(id.to_string()));
            }
            Some("pending") => {}
            Some(_) => {
                return Err(StorageError::conflict_already_resolved(id.to_string()));
            }
        }

        let now_ms = to_ms(Utc::now());
        tx.execute(
            "UPDATE conflicts SET status = 'resolved', resolution = ?1, resolved_at = ?2,
             resolved_by = ?3, resolution_notes = ?4 WHERE id = ?5",
            params![
                resolution_as_str(resolution),
                now_ms,
                resolved_by,
                notes,
                id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn prune_old_conflicts(&self, max_age_ms: i64) -> Result<u64> {
        let conn = self.conn.lock();
        let cutoff = to_ms(Utc::now()) - max_age_ms;
        let removed = conn.execute(
            "DELETE FROM conflicts WHERE status != 'pending' AND detected_at <= ?1",
            params![cutoff],
        )?;
        Ok(removed as u64)
    }

    // ── System info ────────────────────────────────────────────────────────

    async fn get_system_info(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM system_info WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_system_info(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now_secs = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO system_info (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_secs],
        )?;
        Ok(())
    }
}
