//! Error types for the orchestration core (Components B–F).
//!
//! One flat, `thiserror`-derived enum covering every kind named in the
//! coordination spec's error-handling design, plus `#[from] anyhow::Error`
//! as an escape hatch for programmer errors (invalid config, unknown
//! phase/pattern names) the way `codegraph-orchestration::OrchestratorError`
//! does for its own `Other(anyhow::Error)` variant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lock on {resource} is held by session {holder}")]
    LockHeldByOther { resource: String, holder: i64 },

    #[error("lock on {resource} already expired")]
    LockExpired { resource: String },

    #[error("no lock held on {resource}")]
    LockDoesNotExist { resource: String },

    #[error("timed out waiting for lock on {resource}")]
    LockTimeout { resource: String },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("optimistic lock conflict: expected version {expected}, actual {actual}")]
    OptimisticLockConflict { expected: i64, actual: i64 },

    #[error("session not found: {0}")]
    SessionNotFound(i64),

    #[error("parent not found: {0}")]
    ParentNotFound(i64),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(i64),

    #[error("conflict not found: {0}")]
    ConflictNotFound(i64),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("invalid rate-limit tier: {0}")]
    InvalidTier(String),

    #[error("dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<String>),

    #[error("rate limit exceeded at level {level}: {message}")]
    RateLimitExceeded { level: String, message: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("budget failure: {0}")]
    BudgetFailure(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<agentmesh_store::StorageError> for CoreError {
    fn from(err: agentmesh_store::StorageError) -> Self {
        use agentmesh_store::ErrorKind;

        if err.kind == ErrorKind::StoreUnavailable {
            return CoreError::StoreUnavailable(err.message);
        }

        // The store's own constructors (agentmesh_store::error) compose
        // {resource, holder, id} into `message` as plain text; parse it back
        // out here instead of collapsing every kind into `Other`, so callers
        // matching on e.g. `ConflictNotFound` vs `ConflictAlreadyResolved`
        // see the distinct variant `CoreError` already declares for it.
        let parsed = match err.kind {
            ErrorKind::LockHeldByOther => err
                .message
                .strip_prefix("Lock on ")
                .and_then(|rest| rest.split_once(" is held by session "))
                .and_then(|(resource, holder)| {
                    holder.parse().ok().map(|holder| (resource.to_string(), holder))
                })
                .map(|(resource, holder)| CoreError::LockHeldByOther { resource, holder }),
            ErrorKind::LockExpired => err
                .message
                .strip_prefix("lock on ")
                .and_then(|rest| rest.strip_suffix(" already expired"))
                .map(|resource| CoreError::LockExpired { resource: resource.to_string() }),
            ErrorKind::LockDoesNotExist => err
                .message
                .strip_prefix("no lock held on ")
                .map(|resource| CoreError::LockDoesNotExist { resource: resource.to_string() }),
            ErrorKind::LockTimeout => err
                .message
                .strip_prefix("Timed out waiting for lock on ")
                .map(|resource| CoreError::LockTimeout { resource: resource.to_string() }),
            ErrorKind::SessionNotFound => err
                .message
                .strip_prefix("Session not found: ")
                .and_then(|id| id.parse().ok())
                .map(CoreError::SessionNotFound),
            ErrorKind::ConflictAlreadyResolved => err
                .message
                .strip_prefix("Conflict already resolved: ")
                .and_then(|id| id.parse().ok())
                .map(CoreError::ConflictAlreadyResolved),
            ErrorKind::ConflictNotFound => err
                .message
                .strip_prefix("Conflict not found: ")
                .and_then(|id| id.parse().ok())
                .map(CoreError::ConflictNotFound),
            _ => None,
        };

        parsed.unwrap_or_else(|| CoreError::Other(anyhow::anyhow!(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_resource_and_holder() {
        let err = CoreError::LockHeldByOther {
            resource: "tasks.json".to_string(),
            holder: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("tasks.json"));
        assert!(msg.contains('7'));
    }

    #[test]
    fn test_store_unavailable_conversion() {
        let store_err = agentmesh_store::StorageError::store_unavailable("disk full");
        let err: CoreError = store_err.into();
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
    }

    #[test]
    fn test_conflict_not_found_and_already_resolved_stay_distinct() {
        let not_found: CoreError = agentmesh_store::StorageError::conflict_not_found("42").into();
        assert!(matches!(not_found, CoreError::ConflictNotFound(42)));

        let already_resolved: CoreError =
            agentmesh_store::StorageError::conflict_already_resolved("7").into();
        assert!(matches!(already_resolved, CoreError::ConflictAlreadyResolved(7)));
    }

    #[test]
    fn test_session_not_found_conversion_preserves_id() {
        let store_err = agentmesh_store::StorageError::session_not_found("123");
        let err: CoreError = store_err.into();
        assert!(matches!(err, CoreError::SessionNotFound(123)));
    }

    #[test]
    fn test_lock_held_by_other_conversion_preserves_resource_and_holder() {
        let store_err = agentmesh_store::StorageError::lock_held_by_other("tasks.json", "9");
        let err: CoreError = store_err.into();
        match err {
            CoreError::LockHeldByOther { resource, holder } => {
                assert_eq!(resource, "tasks.json");
                assert_eq!(holder, 9);
            }
            other => panic!("expected LockHeldByOther, got {other:?}"),
        }
    }
}
