//! Integration tests exercising `SqliteCoordinationStore` against a real file
//! on disk, including the "process restart" scenario from the coordination
//! spec's testable-properties section: a lock acquired by one store handle,
//! abandoned (simulating a crash), and reclaimed by a second handle opened
//! against the same file.

use agentmesh_store::{
    ConflictResolution, ConflictSeverity, ConflictType, ConflictingSession, CoordinationStore,
    SessionRecord, SqliteCoordinationStore,
};
use chrono::Utc;

fn temp_db_path(name: &str) -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    // leak the tempdir so the file outlives this function; the OS cleans up
    // the process temp root eventually and tests don't care about leaks.
    std::mem::forget(dir);
    path
}

#[tokio::test]
async fn test_lock_persists_across_store_handles() {
    let path = temp_db_path("coord.sqlite3");

    {
        let store = SqliteCoordinationStore::open(&path).unwrap();
        let outcome = store.acquire_lock("tasks.json", 1, 50).await.unwrap();
        assert!(outcome.acquired);
        // process "crashes": store handle dropped without releasing.
    }

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;

    let store2 = SqliteCoordinationStore::open(&path).unwrap();
    let outcome = store2.acquire_lock("tasks.json", 2, 60_000).await.unwrap();
    assert!(outcome.acquired);
    assert!(!outcome.extended);
}

#[tokio::test]
async fn test_sessions_and_heartbeat_persist_across_handles() {
    let path = temp_db_path("coord.sqlite3");

    let id = {
        let store = SqliteCoordinationStore::open(&path).unwrap();
        store
            .register_session(SessionRecord::new("/repo", "claude").with_pid(4242))
            .await
            .unwrap()
    };

    let store2 = SqliteCoordinationStore::open(&path).unwrap();
    let active = store2.get_active_sessions(60_000).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].pid, Some(4242));
}

#[tokio::test]
async fn test_system_info_survives_reopen() {
    let path = temp_db_path("coord.sqlite3");

    {
        let store = SqliteCoordinationStore::open(&path).unwrap();
        store
            .set_system_info("session_registry_next_id", "17")
            .await
            .unwrap();
    }

    let store2 = SqliteCoordinationStore::open(&path).unwrap();
    assert_eq!(
        store2
            .get_system_info("session_registry_next_id")
            .await
            .unwrap(),
        Some("17".to_string())
    );
}

#[tokio::test]
async fn test_conflict_lifecycle_on_disk() {
    let path = temp_db_path("coord.sqlite3");
    let store = SqliteCoordinationStore::open(&path).unwrap();

    let conflict = agentmesh_store::Conflict::new(
        ConflictType::StaleLock,
        "tasks.json",
        ConflictSeverity::Critical,
        ConflictingSession {
            session_id: 1,
            data: serde_json::json!({"status": "active"}),
            version: 3,
            timestamp: Utc::now(),
        },
        ConflictingSession {
            session_id: 2,
            data: serde_json::json!({"status": "ended"}),
            version: 1,
            timestamp: Utc::now(),
        },
    );
    let id = store.record_conflict(conflict).await.unwrap();
    assert_eq!(store.get_pending_conflicts().await.unwrap().len(), 1);

    store
        .resolve_conflict(id, ConflictResolution::VersionA, None, Some("stale handoff".into()))
        .await
        .unwrap();
    assert_eq!(store.get_pending_conflicts().await.unwrap().len(), 0);

    // Resolved conflicts older than the retention window are pruned; a
    // second resolve attempt on the same id still fails as already-resolved.
    let removed = store.prune_old_conflicts(0).await.unwrap();
    assert_eq!(removed, 1);
    let err = store
        .resolve_conflict(id, ConflictResolution::VersionA, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, agentmesh_store::ErrorKind::ConflictNotFound);
}

#[tokio::test]
async fn test_with_lock_ext_releases_on_failure() {
    use agentmesh_store::{CoordinationStoreExt, WithLockOptions};

    let store = SqliteCoordinationStore::open_in_memory().unwrap();
    let opts = WithLockOptions {
        ttl_ms: 1_000,
        timeout_ms: 200,
        retry_interval_ms: 10,
    };

    let result: agentmesh_store::Result<()> = store
        .with_lock("tasks.json", 1, opts, || {
            Err(agentmesh_store::StorageError::database("boom"))
        })
        .await;
    assert!(result.is_err());

    // lock must have been released despite the closure failing
    assert!(!store.is_lock_held("tasks.json").await.unwrap());
}

#[tokio::test]
async fn test_with_lock_times_out_when_contended() {
    use agentmesh_store::{CoordinationStoreExt, WithLockOptions};

    let store = SqliteCoordinationStore::open_in_memory().unwrap();
    store.acquire_lock("tasks.json", 1, 10_000).await.unwrap();

    let opts = WithLockOptions {
        ttl_ms: 1_000,
        timeout_ms: 50,
        retry_interval_ms: 10,
    };
    let result: agentmesh_store::Result<()> =
        store.with_lock("tasks.json", 2, opts, || Ok(())).await;

    assert!(result.is_err());
    assert_eq!(
        result.unwrap_err().kind,
        agentmesh_store::ErrorKind::LockTimeout
    );
}
