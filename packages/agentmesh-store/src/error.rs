//! Error types for agentmesh-store

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store could not be opened or is otherwise unreachable.
    StoreUnavailable,
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// A lock is held by a different session than the caller.
    LockHeldByOther,
    /// A lock existed but had already expired at the time of the call.
    LockExpired,
    /// A lock operation targeted a resource with no lock on record.
    LockDoesNotExist,
    /// `withLock` could not acquire within the caller's timeout.
    LockTimeout,
    /// The referenced session does not exist.
    SessionNotFound,
    /// A resolve was attempted against a conflict already in a terminal status.
    ConflictAlreadyResolved,
    /// The referenced conflict does not exist.
    ConflictNotFound,
    /// Transaction errors
    Transaction,
    /// Configuration errors
    Config,
    /// I/O errors
    IO,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::LockHeldByOther => "lock_held_by_other",
            ErrorKind::LockExpired => "lock_expired",
            ErrorKind::LockDoesNotExist => "lock_does_not_exist",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::ConflictAlreadyResolved => "conflict_already_resolved",
            ErrorKind::ConflictNotFound => "conflict_not_found",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Config => "config",
            ErrorKind::IO => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn lock_held_by_other(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        let resource = resource.into();
        let holder = holder.into();
        Self::new(
            ErrorKind::LockHeldByOther,
            format!("Lock on {resource} is held by session {holder}"),
        )
    }

    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::LockTimeout,
            format!("Timed out waiting for lock on {}", resource.into()),
        )
    }

    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            format!("Session not found: {}", session_id.into()),
        )
    }

    pub fn conflict_already_resolved(id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ConflictAlreadyResolved,
            format!("Conflict already resolved: {}", id.into()),
        )
    }

    pub fn conflict_not_found(id: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ConflictNotFound,
            format!("Conflict not found: {}", id.into()),
        )
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
