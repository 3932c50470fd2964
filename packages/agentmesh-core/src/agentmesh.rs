//! Top-level facade wiring Components B through F together over a shared
//! [`CoordinationService`], the way `orchestrator.rs`'s `PipelineOrchestrator`
//! wires a DAG, a checkpoint manager, and stage handlers behind one
//! constructor. Optional — every subsystem is independently usable; this
//! exists for callers that want the whole core with one `new`.

use std::sync::Arc;

use agentmesh_store::CoordinationStore;

use crate::config::Config;
use crate::coordination::CoordinationService;
use crate::delegation::DelegationDecider;
use crate::error::Result;
use crate::events::EventBus;
use crate::governor::RateLimitGovernor;
use crate::metrics::MetricsAggregator;
use crate::session::SessionRegistry;
use crate::state_machine::AgentStateMachine;

pub struct AgentMesh {
    pub config: Config,
    pub events: EventBus,
    pub coordination: CoordinationService,
    pub sessions: SessionRegistry,
    pub agents: AgentStateMachine,
    pub delegation: DelegationDecider,
    pub governor: RateLimitGovernor,
    pub metrics: MetricsAggregator,
}

impl AgentMesh {
    /// Build the full core over a durable coordination store.
    pub fn new(config: Config, store: Arc<dyn CoordinationStore>) -> Self {
        let events = EventBus::new();
        Self {
            coordination: CoordinationService::new(store.clone(), events.clone()),
            sessions: SessionRegistry::new(config.clone(), Some(store), events.clone()),
            agents: AgentStateMachine::new(events.clone()),
            delegation: DelegationDecider::new(
                config.min_delegation_score,
                config.max_delegation_depth,
                config.cache_max_age_ms,
            ),
            governor: RateLimitGovernor::new(crate::governor::GovernorLimits::for_tier(
                crate::governor::RateLimitTier::Pro,
            )),
            metrics: MetricsAggregator::new(events.clone()),
            events,
            config,
        }
    }

    /// Build the core memory-only: the Registry proceeds without a durable
    /// store (§9's "IDs remain unique within a process lifetime").
    pub fn memory_only(config: Config) -> Self {
        let events = EventBus::new();
        Self {
            coordination: CoordinationService::new(
                Arc::new(NullStore),
                events.clone(),
            ),
            sessions: SessionRegistry::new(config.clone(), None, events.clone()),
            agents: AgentStateMachine::new(events.clone()),
            delegation: DelegationDecider::new(
                config.min_delegation_score,
                config.max_delegation_depth,
                config.cache_max_age_ms,
            ),
            governor: RateLimitGovernor::new(crate::governor::GovernorLimits::for_tier(
                crate::governor::RateLimitTier::Pro,
            )),
            metrics: MetricsAggregator::new(events.clone()),
            events,
            config,
        }
    }

    /// One pass of the periodic maintenance timers described in §2's flow
    /// ("stale sessions or locks are reaped by timers in A and D").
    pub async fn run_maintenance_sweep(&self) -> Result<MaintenanceReport> {
        let expired_locks = self.coordination.cleanup_expired_locks().await.unwrap_or(0);
        let stale_sessions = self.sessions.cleanup_stale(self.config.stale_session_threshold_ms);
        let pruned_journal = self
            .coordination
            .prune_old_changes(self.config.journal_retention_ms)
            .await
            .unwrap_or(0);
        let pruned_conflicts = self
            .coordination
            .prune_old_conflicts(self.config.journal_retention_ms)
            .await
            .unwrap_or(0);

        Ok(MaintenanceReport {
            expired_locks,
            stale_sessions,
            pruned_journal,
            pruned_conflicts,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    pub expired_locks: u64,
    pub stale_sessions: u64,
    pub pruned_journal: u64,
    pub pruned_conflicts: u64,
}

/// A store stand-in for memory-only operation: every call reports
/// unavailability rather than panicking, so callers relying on
/// [`CoordinationService`] degrade gracefully instead of needing an `Option`.
struct NullStore;

#[async_trait::async_trait]
impl CoordinationStore for NullStore {
    async fn acquire_lock(
        &self,
        _resource: &str,
        _session_id: i64,
        _ttl_ms: i64,
    ) -> agentmesh_store::Result<agentmesh_store::LockAcquireOutcome> {
        Err(agentmesh_store::StorageError::store_unavailable("memory-only mode"))
    }

    async fn release_lock(&self, _resource: &str, _session_id: i64) -> agentmesh_store::Result<bool> {
        Ok(true)
    }

    async fn refresh_lock(&self, _resource: &str, _session_id: i64, _ttl_ms: i64) -> agentmesh_store::Result<()> {
        Err(agentmesh_store::StorageError::store_unavailable("memory-only mode"))
    }

    async fn is_lock_held(&self, _resource: &str) -> agentmesh_store::Result<bool> {
        Ok(false)
    }

    async fn cleanup_expired_locks(&self) -> agentmesh_store::Result<u64> {
        Ok(0)
    }

    async fn register_session(&self, _session: agentmesh_store::SessionRecord) -> agentmesh_store::Result<i64> {
        Err(agentmesh_store::StorageError::store_unavailable("memory-only mode"))
    }

    async fn update_heartbeat(&self, _session_id: i64) -> agentmesh_store::Result<()> {
        Ok(())
    }

    async fn deregister_session(&self, _session_id: i64) -> agentmesh_store::Result<()> {
        Ok(())
    }

    async fn get_active_sessions(&self, _threshold_ms: i64) -> agentmesh_store::Result<Vec<agentmesh_store::SessionRecord>> {
        Ok(Vec::new())
    }

    async fn cleanup_stale_sessions(&self, _threshold_ms: i64) -> agentmesh_store::Result<u64> {
        Ok(0)
    }

    async fn record_change(&self, _entry: agentmesh_store::ChangeJournalEntry) -> agentmesh_store::Result<i64> {
        Err(agentmesh_store::StorageError::store_unavailable("memory-only mode"))
    }

    async fn get_recent_changes(&self, _limit: usize) -> agentmesh_store::Result<Vec<agentmesh_store::ChangeJournalEntry>> {
        Ok(Vec::new())
    }

    async fn mark_change_applied(&self, _id: i64) -> agentmesh_store::Result<()> {
        Ok(())
    }

    async fn prune_old_changes(&self, _max_age_ms: i64) -> agentmesh_store::Result<u64> {
        Ok(0)
    }

    async fn record_conflict(&self, _conflict: agentmesh_store::Conflict) -> agentmesh_store::Result<i64> {
        Err(agentmesh_store::StorageError::store_unavailable("memory-only mode"))
    }

    async fn get_pending_conflicts(&self) -> agentmesh_store::Result<Vec<agentmesh_store::Conflict>> {
        Ok(Vec::new())
    }

    async fn resolve_conflict(
        &self,
        _id: i64,
        _resolution: agentmesh_store::ConflictResolution,
        _resolved_by: Option<String>,
        _notes: Option<String>,
    ) -> agentmesh_store::Result<()> {
        Ok(())
    }

    async fn prune_old_conflicts(&self, _max_age_ms: i64) -> agentmesh_store::Result<u64> {
        Ok(0)
    }

    async fn get_system_info(&self, _key: &str) -> agentmesh_store::Result<Option<String>> {
        Ok(None)
    }

    async fn set_system_info(&self, _key: &str, _value: &str) -> agentmesh_store::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_only_maintenance_sweep_runs_without_store() {
        let mesh = AgentMesh::memory_only(Config::default());
        let report = mesh.run_maintenance_sweep().await.unwrap();
        assert_eq!(report.expired_locks, 0);
    }

    #[test]
    fn test_memory_only_wires_every_subsystem() {
        let mesh = AgentMesh::memory_only(Config::default());
        assert_eq!(mesh.config.max_child_agents, 7);
        let decision = mesh.delegation.decide(
            &crate::delegation::Task {
                task_id: "t1".to_string(),
                title: "x".to_string(),
                description: "short".to_string(),
                phase: None,
                depends_on: vec![],
                acceptance_criteria: vec!["a".to_string(), "b".to_string()],
                estimate_hours: None,
                has_children: false,
            },
            &crate::delegation::AgentView::default(),
            true,
        );
        assert!(decision.score <= 100);
    }
}
