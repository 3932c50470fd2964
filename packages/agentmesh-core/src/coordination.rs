//! Thin event-emitting wrapper over a [`CoordinationStore`].
//!
//! The store itself stays pure CRUD, returning outcome structs; this module
//! is the seam named in §9's events-as-callbacks note — it translates those
//! outcomes into [`Event`]s on an [`EventBus`], the way `orchestrator.rs`
//! wraps `PipelineDAG` mutations with its own progress callbacks without the
//! DAG knowing about them.

use std::sync::Arc;

use agentmesh_store::{
    ChangeJournalEntry, Conflict, ConflictResolution, CoordinationStore, CoordinationStoreExt,
    LockAcquireOutcome, WithLockOptions,
};

use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};

pub struct CoordinationService {
    store: Arc<dyn CoordinationStore>,
    events: EventBus,
}

impl CoordinationService {
    pub fn new(store: Arc<dyn CoordinationStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub async fn acquire_lock(
        &self,
        resource: &str,
        session_id: i64,
        ttl_ms: i64,
    ) -> Result<LockAcquireOutcome> {
        let outcome = self.store.acquire_lock(resource, session_id, ttl_ms).await?;
        if outcome.acquired {
            if outcome.extended {
                self.events.emit(Event::LockExtended {
                    resource: resource.to_string(),
                    session_id,
                    refresh_count: outcome.refresh_count.unwrap_or(0),
                });
            } else {
                if let Some(previous_holder) = outcome.previous_holder {
                    self.events.emit(Event::LockExpired {
                        resource: resource.to_string(),
                        previous_holder,
                    });
                }
                self.events.emit(Event::LockAcquired {
                    resource: resource.to_string(),
                    session_id,
                });
            }
        }
        Ok(outcome)
    }

    pub async fn release_lock(&self, resource: &str, session_id: i64) -> Result<bool> {
        let released = self.store.release_lock(resource, session_id).await?;
        if released {
            self.events.emit(Event::LockReleased {
                resource: resource.to_string(),
                session_id,
            });
        }
        Ok(released)
    }

    pub async fn refresh_lock(&self, resource: &str, session_id: i64, ttl_ms: i64) -> Result<()> {
        self.store.refresh_lock(resource, session_id, ttl_ms).await?;
        self.events.emit(Event::LockRefreshed {
            resource: resource.to_string(),
            session_id,
        });
        Ok(())
    }

    pub async fn cleanup_expired_locks(&self) -> Result<u64> {
        let removed = self.store.cleanup_expired_locks().await?;
        if removed > 0 {
            self.events.emit(Event::LocksCleanup { removed });
        }
        Ok(removed)
    }

    /// Acquire, run `f`, and release on every exit path, retrying until
    /// `opts.timeout_ms` elapses. Emits the same lock events the direct
    /// acquire/release calls do, at each attempt.
    pub async fn with_lock<F, T>(
        &self,
        resource: &str,
        session_id: i64,
        opts: WithLockOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
    {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(opts.timeout_ms.max(0) as u64);
        loop {
            let outcome = self.acquire_lock(resource, session_id, opts.ttl_ms).await?;
            if outcome.acquired {
                let result = f();
                let _ = self.release_lock(resource, session_id).await;
                return result;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::LockTimeout { resource: resource.to_string() });
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                opts.retry_interval_ms.max(1) as u64,
            ))
            .await;
        }
    }

    pub async fn record_change(&self, entry: ChangeJournalEntry) -> Result<i64> {
        let resource = entry.resource.clone();
        let id = self.store.record_change(entry).await?;
        self.events.emit(Event::ChangeRecorded { change_id: id, resource });
        Ok(id)
    }

    pub async fn mark_change_applied(&self, id: i64) -> Result<()> {
        self.store.mark_change_applied(id).await?;
        self.events.emit(Event::ChangeApplied { change_id: id });
        Ok(())
    }

    pub async fn prune_old_changes(&self, max_age_ms: i64) -> Result<u64> {
        let removed = self.store.prune_old_changes(max_age_ms).await?;
        if removed > 0 {
            self.events.emit(Event::JournalPruned { removed });
        }
        Ok(removed)
    }

    pub async fn record_conflict(&self, conflict: Conflict) -> Result<i64> {
        let resource = conflict.resource.clone();
        let id = self.store.record_conflict(conflict).await?;
        self.events.emit(Event::ConflictDetected { conflict_id: id, resource });
        Ok(id)
    }

    pub async fn resolve_conflict(
        &self,
        id: i64,
        resolution: ConflictResolution,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> Result<()> {
        self.store.resolve_conflict(id, resolution, resolved_by, notes).await?;
        self.events.emit(Event::ConflictResolved { conflict_id: id });
        Ok(())
    }

    pub async fn prune_old_conflicts(&self, max_age_ms: i64) -> Result<u64> {
        let removed = self.store.prune_old_conflicts(max_age_ms).await?;
        if removed > 0 {
            self.events.emit(Event::ConflictsPruned { removed });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_store::SqliteCoordinationStore;

    fn store() -> Arc<dyn CoordinationStore> {
        Arc::new(SqliteCoordinationStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_acquire_lock_emits_acquired_not_extended() {
        let svc = CoordinationService::new(store(), EventBus::new());
        let mut rx = svc.events.subscribe();
        svc.acquire_lock("r1", 1, 60_000).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::LockAcquired { .. }));
    }

    #[tokio::test]
    async fn test_acquire_lock_extension_emits_extended_only() {
        let svc = CoordinationService::new(store(), EventBus::new());
        svc.acquire_lock("r1", 1, 60_000).await.unwrap();
        let mut rx = svc.events.subscribe();
        svc.acquire_lock("r1", 1, 60_000).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::LockExtended { .. }));
    }

    #[tokio::test]
    async fn test_acquire_lock_after_expiry_emits_expired_then_acquired() {
        let svc = CoordinationService::new(store(), EventBus::new());
        svc.acquire_lock("r1", 1, 10).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut rx = svc.events.subscribe();
        let outcome = svc.acquire_lock("r1", 2, 60_000).await.unwrap();
        assert!(outcome.acquired);
        assert!(!outcome.extended);

        let first = rx.recv().await.unwrap();
        match first {
            Event::LockExpired { resource, previous_holder } => {
                assert_eq!(resource, "r1");
                assert_eq!(previous_holder, 1);
            }
            other => panic!("expected LockExpired, got {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::LockAcquired { session_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_with_lock_releases_and_emits_released() {
        let svc = CoordinationService::new(store(), EventBus::new());
        let mut rx = svc.events.subscribe();
        svc.with_lock(
            "r1",
            1,
            WithLockOptions::default(),
            || Ok(()),
        )
        .await
        .unwrap();

        let mut saw_acquired = false;
        let mut saw_released = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::LockAcquired { .. } => saw_acquired = true,
                Event::LockReleased { .. } => saw_released = true,
                _ => {}
            }
        }
        assert!(saw_acquired);
        assert!(saw_released);
    }

    #[tokio::test]
    async fn test_prune_old_conflicts_emits_event() {
        use agentmesh_store::{Conflict, ConflictSeverity, ConflictType, ConflictingSession};

        let svc = CoordinationService::new(store(), EventBus::new());
        let conflict = Conflict::new(
            ConflictType::StaleLock,
            "tasks.json",
            ConflictSeverity::Warning,
            ConflictingSession {
                session_id: 1,
                data: serde_json::json!({}),
                version: 1,
                timestamp: chrono::Utc::now(),
            },
            ConflictingSession {
                session_id: 2,
                data: serde_json::json!({}),
                version: 1,
                timestamp: chrono::Utc::now(),
            },
        );
        let id = svc.record_conflict(conflict).await.unwrap();
        svc.resolve_conflict(id, ConflictResolution::Merged, None, None)
            .await
            .unwrap();

        let mut rx = svc.events.subscribe();
        let removed = svc.prune_old_conflicts(0).await.unwrap();
        assert_eq!(removed, 1);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ConflictsPruned { removed: 1 }));
    }

    #[tokio::test]
    async fn test_record_and_apply_change_emits_both_events() {
        let svc = CoordinationService::new(store(), EventBus::new());
        let mut rx = svc.events.subscribe();
        let entry = ChangeJournalEntry::new(1, "r1", "update", serde_json::json!({"a": 1}));
        let id = svc.record_change(entry).await.unwrap();
        svc.mark_change_applied(id).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Event::ChangeRecorded { .. }));
        assert!(matches!(second, Event::ChangeApplied { .. }));
    }
}
