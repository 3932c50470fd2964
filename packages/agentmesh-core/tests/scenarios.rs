//! Integration tests over the full flow from §2: a session registers, opens
//! an agent entry, a task is scored for delegation, a call passes the
//! governor, and metrics/rollups propagate — all wired through `AgentMesh`
//! over a real on-disk SQLite-backed coordination store.

use std::sync::Arc;

use agentmesh_core::{
    AgentMesh, AgentState, AgentView, Config, DelegationStatus, FamilyTransitionOptions,
    InitialSession, SessionDelegation, SessionUpdate, Task,
};
use agentmesh_store::SqliteCoordinationStore;

fn temp_db_path() -> std::path::PathBuf {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentmesh.sqlite3");
    std::mem::forget(dir);
    path
}

fn mesh() -> AgentMesh {
    let store = Arc::new(SqliteCoordinationStore::open(&temp_db_path()).unwrap());
    AgentMesh::new(Config::default(), store)
}

#[tokio::test]
async fn test_end_to_end_session_to_delegation_flow() {
    let mesh = mesh();

    let root = mesh
        .sessions
        .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
        .await
        .unwrap();
    mesh.agents.register_agent("agent-root", None);

    let task = Task {
        task_id: "task-1".to_string(),
        title: "Parallelize the independent subtasks".to_string(),
        description: "Split these independent parallel subtasks:\n- a\n- b\n- c".to_string(),
        phase: Some("implementation".to_string()),
        depends_on: vec![],
        acceptance_criteria: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        estimate_hours: Some(4.0),
        has_children: false,
    };
    let agent_view = AgentView {
        agent_id: "agent-root".to_string(),
        confidence: Some(50),
        max_children: 7,
        max_queue_depth: 10,
        ..Default::default()
    };

    let decision = mesh.delegation.decide(&task, &agent_view, true);
    assert!(decision.should_delegate);

    let admitted = mesh.governor.ensure_admitted(100).unwrap();
    assert!(admitted.safe);
    mesh.governor.record_call(100);

    let delegation = SessionDelegation::new(root, "agent-child", &task.task_id);
    let delegation_id = delegation.delegation_id.clone();
    mesh.sessions.add_delegation(root, delegation).unwrap();
    mesh.sessions
        .update_delegation(root, &delegation_id, DelegationStatus::Completed, None, None)
        .unwrap();

    mesh.sessions.update(root, SessionUpdate { tokens: Some(100), ..Default::default() }).unwrap();
    mesh.sessions.propagate_metric_update(root, "tokens", 0.0).unwrap();
    let rollup = mesh.sessions.get_rollup_metrics(root).unwrap();
    assert_eq!(rollup.total_tokens, 100);

    mesh.metrics.increment_counter("delegations.completed", 1);
    assert_eq!(mesh.metrics.counter_value("delegations.completed"), 1);
}

#[tokio::test]
async fn test_atomic_family_rollback_across_real_agents() {
    let mesh = mesh();
    mesh.agents.register_agent("parent", None);
    mesh.agents.register_agent("child-a", Some("parent".to_string()));
    mesh.agents.register_agent("child-b", Some("parent".to_string()));

    for agent in ["parent", "child-a", "child-b"] {
        mesh.agents.update_state(agent, AgentState::Initializing, None, None).unwrap();
        mesh.agents.update_state(agent, AgentState::Active, None, None).unwrap();
    }
    mesh.agents.update_state("child-b", AgentState::Completing, None, None).unwrap();
    mesh.agents.update_state("child-b", AgentState::Completed, None, None).unwrap();

    let before = mesh.agents.get("parent").unwrap().version;
    let err = mesh
        .agents
        .atomic_family_transition(
            "parent",
            AgentState::Completing,
            AgentState::Failed,
            FamilyTransitionOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, agentmesh_core::CoreError::InvalidTransition { .. }));
    assert_eq!(mesh.agents.get("parent").unwrap().version, before);
    assert_eq!(mesh.agents.get("child-a").unwrap().state, AgentState::Active);
}

#[tokio::test]
async fn test_maintenance_sweep_reaps_expired_locks_and_stale_sessions() {
    let mesh = mesh();
    mesh.coordination.acquire_lock("file:a.py", 1, 1).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let report = mesh.run_maintenance_sweep().await.unwrap();
    assert_eq!(report.expired_locks, 1);
}

#[tokio::test]
async fn test_fallback_recovery_cycle() {
    let mesh = mesh();
    mesh.sessions.activate_fallback(agentmesh_core::FallbackReason::OpenFailure);
    assert!(mesh.sessions.fallback_snapshot().active);

    mesh.sessions.record_recovery_failure();
    let delayed = mesh.sessions.fallback_snapshot().current_delay_ms;
    assert!(delayed > mesh.config.recovery_interval_ms);

    mesh.sessions.record_recovery_success();
    assert!(!mesh.sessions.fallback_snapshot().active);
}
