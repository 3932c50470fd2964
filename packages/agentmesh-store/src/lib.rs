//! CoordinationStore - cross-process coordination for multi-session agent execution
//!
//! ## Core principles
//!
//! 1. **Single source of truth**: locks, session heartbeats, the change
//!    journal, and conflict records all live in one embedded database so that
//!    independent processes on the same host observe a consistent view.
//! 2. **Write-ahead journaling**: the store always runs with `journal_mode =
//!    WAL` and a busy timeout of at least five seconds, so that concurrent
//!    readers never block a writer and a contended writer retries instead of
//!    failing outright.
//! 3. **Best-effort durability, not a distributed consensus system**: this
//!    store coordinates processes sharing a filesystem. It does not
//!    replicate across hosts.
//!
//! ## Status
//!
//! - Domain layer (port trait + records): implemented.
//! - SQLite adapter: implemented.
//! - PostgreSQL adapter: not planned; out of scope.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentmesh_store::{CoordinationStore, SqliteCoordinationStore};
//!
//! async fn example(store: impl CoordinationStore) -> agentmesh_store::Result<()> {
//!     let outcome = store.acquire_lock("file:auth.py", "session-1", 60_000).await?;
//!     if outcome.acquired {
//!         // ... do work ...
//!         store.release_lock("file:auth.py", "session-1").await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod domain;
pub mod error;

#[cfg(feature = "sqlite")]
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    ChangeJournalEntry, Conflict, ConflictResolution, ConflictSeverity, ConflictStatus,
    ConflictType, ConflictingSession, CoordinationStore, CoordinationStoreExt,
    LockAcquireOutcome, LockRecord, SessionRecord, SessionSnapshot, WithLockOptions,
};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteCoordinationStore;
