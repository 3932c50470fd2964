//! Domain layer for the coordination store
//!
//! # Core principles
//!
//! 1. **Single-writer discipline**: every mutation is a single atomic
//!    statement or a serialized transaction — no multi-step sequence of
//!    client-visible reads and writes can race against itself.
//! 2. **Lock identity**: `resource` is the unique key; at most one unexpired
//!    lock exists per resource at any time.
//! 3. **Sessions outlive their last heartbeat briefly**: deregistered
//!    sessions remain queryable until a stale sweep removes them, so
//!    ancestors can still see recently-finished children.
//!
//! # Domain models
//!
//! - `LockRecord`: a distributed, TTL-bound exclusive lock.
//! - `SessionRecord`: the persisted reflection of a registered session.
//! - `ChangeJournalEntry`: an append-only record of a mutation, checksummed.
//! - `Conflict`: a detected version/edit conflict awaiting resolution.
//!
//! # Port trait
//!
//! - `CoordinationStore`: the storage abstraction every adapter implements.
//!
//! # Examples
//!
//! ```rust,ignore
//! use agentmesh_store::{CoordinationStore, SessionRecord};
//!
//! async fn example(store: impl CoordinationStore) -> agentmesh_store::Result<()> {
//!     let id = store.register_session(SessionRecord::new("/repo", "claude")).await?;
//!     store.update_heartbeat(id).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// A distributed exclusive lock over a named resource.
///
/// `resource` is the unique key. A lock whose `expires_at <= now` is treated
/// as absent by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub holder_session_id: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lock_type: String,
    pub refresh_count: u32,
}

impl LockRecord {
    pub fn new(resource: impl Into<String>, holder_session_id: i64, ttl_ms: i64) -> Self {
        let now = Utc::now();
        Self {
            resource: resource.into(),
            holder_session_id,
            acquired_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl_ms),
            lock_type: "exclusive".to_string(),
            refresh_count: 0,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of an `acquire_lock` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAcquireOutcome {
    pub acquired: bool,
    pub holder_session_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub extended: bool,
    pub refresh_count: Option<u32>,
    pub remaining_ms: Option<i64>,
    /// Session that held the resource's prior, now-expired lock, when this
    /// acquisition replaced one (§8 scenario 1: "P2's acquireLock succeeds and
    /// emits `lock:expired` naming P1's session"). `None` for a fresh slot.
    pub previous_holder: Option<i64>,
}

impl LockAcquireOutcome {
    pub fn acquired_new(expires_at: DateTime<Utc>) -> Self {
        Self {
            acquired: true,
            holder_session_id: None,
            expires_at: Some(expires_at),
            extended: false,
            refresh_count: Some(0),
            remaining_ms: None,
            previous_holder: None,
        }
    }

    /// A fresh acquisition that replaced a lock whose `expiresAt < now`.
    pub fn acquired_after_expiry(expires_at: DateTime<Utc>, previous_holder: i64) -> Self {
        Self {
            acquired: true,
            holder_session_id: None,
            expires_at: Some(expires_at),
            extended: false,
            refresh_count: Some(0),
            remaining_ms: None,
            previous_holder: Some(previous_holder),
        }
    }

    pub fn extended(expires_at: DateTime<Utc>, refresh_count: u32) -> Self {
        Self {
            acquired: true,
            holder_session_id: None,
            expires_at: Some(expires_at),
            extended: true,
            refresh_count: Some(refresh_count),
            remaining_ms: None,
            previous_holder: None,
        }
    }

    pub fn denied(holder_session_id: i64, remaining_ms: i64) -> Self {
        Self {
            acquired: false,
            holder_session_id: Some(holder_session_id),
            expires_at: None,
            extended: false,
            refresh_count: None,
            remaining_ms: Some(remaining_ms),
            previous_holder: None,
        }
    }
}

/// The persisted reflection of a live session.
///
/// The Session Registry (`agentmesh-core`) owns the richer in-memory view;
/// this record carries only the fields the store needs for cross-process
/// heartbeats, ownership of locks, and crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub project_path: String,
    pub agent_type: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub pid: Option<u32>,
}

impl SessionRecord {
    /// Build a session record prior to persistence with `id = 0`, meaning
    /// "`register_session` may assign one". A caller that already owns a
    /// monotonic id allocator (e.g. the Session Registry's `nextId`) should
    /// set `id` explicitly before calling `register_session` so the stored
    /// row keeps the same id as the in-process session it reflects.
    pub fn new(project_path: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            project_path: project_path.into(),
            agent_type: agent_type.into(),
            started_at: now,
            last_heartbeat: now,
            metadata: serde_json::Value::Null,
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold_ms: i64) -> bool {
        (now - self.last_heartbeat) > chrono::Duration::milliseconds(threshold_ms)
    }
}

/// A point-in-time read of the active session set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub sessions: Vec<SessionRecord>,
}

/// An append-only record of a change attempted against a resource.
///
/// `checksum` must equal the digest of the serialized `change_data`; this is
/// enforced by `ChangeJournalEntry::new`, never computed ad hoc elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeJournalEntry {
    pub id: i64,
    pub session_id: i64,
    pub resource: String,
    pub operation: String,
    pub change_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub applied: bool,
    pub checksum: String,
}

impl ChangeJournalEntry {
    /// Build a new, unpersisted entry (`id` is assigned on insert).
    pub fn new(
        session_id: i64,
        resource: impl Into<String>,
        operation: impl Into<String>,
        change_data: serde_json::Value,
    ) -> Self {
        let checksum = Self::digest(&change_data);
        Self {
            id: 0,
            session_id,
            resource: resource.into(),
            operation: operation.into(),
            change_data,
            created_at: Utc::now(),
            applied: false,
            checksum,
        }
    }

    /// SHA-256 digest of the canonical JSON serialization of `change_data`.
    pub fn digest(change_data: &serde_json::Value) -> String {
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(change_data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::digest(&self.change_data)
    }
}

/// Conflict kind, per the coordination data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    VersionConflict,
    ConcurrentEdit,
    StaleLock,
    MergeFailure,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::VersionConflict => "VERSION_CONFLICT",
            ConflictType::ConcurrentEdit => "CONCURRENT_EDIT",
            ConflictType::StaleLock => "STALE_LOCK",
            ConflictType::MergeFailure => "MERGE_FAILURE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    AutoResolved,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    VersionA,
    VersionB,
    Merged,
    Manual,
    Discarded,
}

/// One side of a conflicting pair of session writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingSession {
    pub session_id: i64,
    pub data: serde_json::Value,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

/// A detected conflict awaiting or carrying a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub conflict_type: ConflictType,
    pub resource: String,
    pub detected_at: DateTime<Utc>,
    pub severity: ConflictSeverity,
    pub session_a: ConflictingSession,
    pub session_b: ConflictingSession,
    #[serde(default)]
    pub affected_ids: Vec<String>,
    #[serde(default)]
    pub field_conflicts: serde_json::Value,
    pub description: Option<String>,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

impl Conflict {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conflict_type: ConflictType,
        resource: impl Into<String>,
        severity: ConflictSeverity,
        session_a: ConflictingSession,
        session_b: ConflictingSession,
    ) -> Self {
        Self {
            id: 0,
            conflict_type,
            resource: resource.into(),
            detected_at: Utc::now(),
            severity,
            session_a,
            session_b,
            affected_ids: Vec::new(),
            field_conflicts: serde_json::Value::Null,
            description: None,
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

/// Options accepted by `with_lock`.
#[derive(Debug, Clone, Copy)]
pub struct WithLockOptions {
    pub ttl_ms: i64,
    pub timeout_ms: i64,
    pub retry_interval_ms: i64,
}

impl Default for WithLockOptions {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            timeout_ms: 30_000,
            retry_interval_ms: 100,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: CoordinationStore
// ═══════════════════════════════════════════════════════════════════════════

/// Cross-process coordination storage abstraction.
///
/// # Implementations
///
/// - `SqliteCoordinationStore`: the embedded-SQLite adapter used in
///   production and in tests.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // ── Locks ──────────────────────────────────────────────────────────────

    /// Attempt to acquire (or extend, if already held by `session_id`) a
    /// lock on `resource`. See §4.1 for the exact four-branch semantics.
    async fn acquire_lock(
        &self,
        resource: &str,
        session_id: i64,
        ttl_ms: i64,
    ) -> Result<LockAcquireOutcome>;

    /// Release a lock. Idempotent: absent or already-expired locks return
    /// `true` without error. Returns `false` if held by a different session.
    async fn release_lock(&self, resource: &str, session_id: i64) -> Result<bool>;

    /// Extend an existing lock's expiry. Fails if the lock is absent,
    /// expired, or held by a different session.
    async fn refresh_lock(&self, resource: &str, session_id: i64, ttl_ms: i64) -> Result<()>;

    /// Whether `resource` currently has an unexpired lock.
    async fn is_lock_held(&self, resource: &str) -> Result<bool>;

    /// Delete all locks whose `expires_at` is at or before now. Returns the
    /// number removed.
    async fn cleanup_expired_locks(&self) -> Result<u64>;

    // ── Sessions ───────────────────────────────────────────────────────────

    /// Persist a new session and return its allocated id.
    async fn register_session(&self, session: SessionRecord) -> Result<i64>;

    /// Refresh `last_heartbeat` for `session_id`.
    async fn update_heartbeat(&self, session_id: i64) -> Result<()>;

    /// Remove a session and all locks it holds, transactionally.
    async fn deregister_session(&self, session_id: i64) -> Result<()>;

    /// Sessions whose heartbeat is within `threshold_ms` of now.
    async fn get_active_sessions(&self, threshold_ms: i64) -> Result<Vec<SessionRecord>>;

    /// Remove sessions (and their locks) whose heartbeat predates
    /// `threshold_ms`. Returns the number removed.
    async fn cleanup_stale_sessions(&self, threshold_ms: i64) -> Result<u64>;

    // ── Change journal ─────────────────────────────────────────────────────

    /// Append a change journal entry, computing its checksum, and return its
    /// allocated id.
    async fn record_change(&self, entry: ChangeJournalEntry) -> Result<i64>;

    /// Most recent entries, newest first, bounded by `limit`.
    async fn get_recent_changes(&self, limit: usize) -> Result<Vec<ChangeJournalEntry>>;

    /// Mark an entry as applied.
    async fn mark_change_applied(&self, id: i64) -> Result<()>;

    /// Delete applied entries older than `max_age_ms`. Returns the number
    /// removed.
    async fn prune_old_changes(&self, max_age_ms: i64) -> Result<u64>;

    // ── Conflicts ──────────────────────────────────────────────────────────

    /// Persist a new conflict and return its allocated id.
    async fn record_conflict(&self, conflict: Conflict) -> Result<i64>;

    /// All conflicts currently in `status = pending`.
    async fn get_pending_conflicts(&self) -> Result<Vec<Conflict>>;

    /// Resolve a pending conflict. Fails with `ConflictAlreadyResolved` if
    /// the targeted conflict is not in `status = pending`.
    async fn resolve_conflict(
        &self,
        id: i64,
        resolution: ConflictResolution,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> Result<()>;

    /// Delete non-pending (resolved/auto-resolved/escalated) conflicts whose
    /// `detected_at` predates `max_age_ms`, the conflicts-table analogue of
    /// `prune_old_changes`. Returns the number removed.
    async fn prune_old_conflicts(&self, max_age_ms: i64) -> Result<u64>;

    // ── System info ────────────────────────────────────────────────────────

    /// Read a `system_info` value by key.
    async fn get_system_info(&self, key: &str) -> Result<Option<String>>;

    /// Write a `system_info` value.
    async fn set_system_info(&self, key: &str, value: &str) -> Result<()>;
}

/// Convenience retry-and-hold wrapper over [`CoordinationStore::acquire_lock`]
/// / [`CoordinationStore::release_lock`], kept out of the core trait so that
/// `CoordinationStore` stays object-safe (`Arc<dyn CoordinationStore>`).
///
/// Blanket-implemented for every `CoordinationStore`, the way `futures`'
/// `FutureExt` layers combinators over the object-safe `Future` trait.
#[async_trait]
pub trait CoordinationStoreExt: CoordinationStore {
    /// Acquire `resource` on behalf of `session_id`, retrying at
    /// `opts.retry_interval_ms` until acquired or `opts.timeout_ms` elapses,
    /// then run `f` and release the lock on every exit path. `f`'s own
    /// errors propagate; the lock is still released before they do.
    async fn with_lock<F, T>(
        &self,
        resource: &str,
        session_id: i64,
        opts: WithLockOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(opts.timeout_ms.max(0) as u64);
        loop {
            let outcome = self.acquire_lock(resource, session_id, opts.ttl_ms).await?;
            if outcome.acquired {
                let result = f();
                let _ = self.release_lock(resource, session_id).await;
                return result;
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(crate::StorageError::lock_timeout(resource));
            }

            tokio::time::sleep(std::time::Duration::from_millis(
                opts.retry_interval_ms.max(1) as u64,
            ))
            .await;
        }
    }
}

impl<T: CoordinationStore + ?Sized> CoordinationStoreExt for T {}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_record_new() {
        let lock = LockRecord::new("file:a.py", 1, 60_000);
        assert_eq!(lock.resource, "file:a.py");
        assert_eq!(lock.holder_session_id, 1);
        assert_eq!(lock.refresh_count, 0);
        assert!(lock.expires_at > lock.acquired_at);
    }

    #[test]
    fn test_lock_record_is_expired_at() {
        let lock = LockRecord::new("file:a.py", 1, 1_000);
        assert!(!lock.is_expired_at(lock.acquired_at));
        assert!(lock.is_expired_at(lock.expires_at));
        assert!(lock.is_expired_at(lock.expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_session_record_new() {
        let session = SessionRecord::new("/repo", "claude");
        assert_eq!(session.project_path, "/repo");
        assert_eq!(session.agent_type, "claude");
        assert_eq!(session.pid, None);
    }

    #[test]
    fn test_session_record_is_stale() {
        let mut session = SessionRecord::new("/repo", "claude");
        session.last_heartbeat = Utc::now() - chrono::Duration::minutes(31);
        assert!(session.is_stale(Utc::now(), 30 * 60 * 1000));
        assert!(!session.is_stale(Utc::now(), 60 * 60 * 1000));
    }

    #[test]
    fn test_change_journal_entry_checksum() {
        let data = serde_json::json!({"field": "value"});
        let entry = ChangeJournalEntry::new(1, "file:a.py", "update", data);
        assert!(entry.verify_checksum());
    }

    #[test]
    fn test_change_journal_entry_checksum_detects_tamper() {
        let data = serde_json::json!({"field": "value"});
        let mut entry = ChangeJournalEntry::new(1, "file:a.py", "update", data);
        entry.change_data = serde_json::json!({"field": "tampered"});
        assert!(!entry.verify_checksum());
    }

    #[test]
    fn test_conflict_new_defaults_to_pending() {
        let a = ConflictingSession {
            session_id: 1,
            data: serde_json::Value::Null,
            version: 1,
            timestamp: Utc::now(),
        };
        let b = ConflictingSession {
            session_id: 2,
            data: serde_json::Value::Null,
            version: 1,
            timestamp: Utc::now(),
        };
        let conflict = Conflict::new(
            ConflictType::VersionConflict,
            "file:a.py",
            ConflictSeverity::Warning,
            a,
            b,
        );
        assert_eq!(conflict.status, ConflictStatus::Pending);
        assert!(conflict.resolution.is_none());
        assert!(conflict.resolved_at.is_none());
    }

    #[test]
    fn test_conflict_type_as_str() {
        assert_eq!(ConflictType::VersionConflict.as_str(), "VERSION_CONFLICT");
        assert_eq!(ConflictType::ConcurrentEdit.as_str(), "CONCURRENT_EDIT");
        assert_eq!(ConflictType::StaleLock.as_str(), "STALE_LOCK");
        assert_eq!(ConflictType::MergeFailure.as_str(), "MERGE_FAILURE");
    }

    #[test]
    fn test_with_lock_options_default() {
        let opts = WithLockOptions::default();
        assert_eq!(opts.ttl_ms, 60_000);
        assert_eq!(opts.timeout_ms, 30_000);
        assert_eq!(opts.retry_interval_ms, 100);
    }

    #[test]
    fn test_lock_acquire_outcome_denied() {
        let outcome = LockAcquireOutcome::denied(42, 5_000);
        assert!(!outcome.acquired);
        assert_eq!(outcome.holder_session_id, Some(42));
        assert_eq!(outcome.remaining_ms, Some(5_000));
    }

    #[test]
    fn test_session_record_serde() {
        let session = SessionRecord::new("/repo", "claude").with_pid(123);
        let json = serde_json::to_string(&session).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_path, session.project_path);
        assert_eq!(back.pid, Some(123));
    }
}
