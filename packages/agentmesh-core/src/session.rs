//! Session Registry (Component D): the in-process authoritative view of
//! active sessions, their hierarchy, delegations, and rollup metrics.
//!
//! Grounded on `orchestrator.rs`'s `PipelineOrchestrator` (an in-memory map
//! of run state, written through to a store best-effort) for the overall
//! shape, and on `job.rs`'s `JobStateMachine::fail` backoff computation for
//! the persistence fallback recovery scheduler's doubling delay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use agentmesh_store::{CoordinationStore, SessionRecord};

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};

const COMPLETED_DELEGATIONS_CAP: usize = 50;
const NEXT_ID_KEY: &str = "session_registry_next_id";

// ── Delegations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl DelegationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DelegationStatus::Completed | DelegationStatus::Failed | DelegationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Active => "active",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Failed => "failed",
            DelegationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub delegation_id: String,
    pub parent_session_id: i64,
    pub target_agent_id: String,
    pub task_id: String,
    pub status: DelegationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: serde_json::Value,
}

impl Delegation {
    pub fn new(
        parent_session_id: i64,
        target_agent_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            delegation_id: uuid::Uuid::new_v4().to_string(),
            parent_session_id,
            target_agent_id: target_agent_id.into(),
            task_id: task_id.into(),
            status: DelegationStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Active,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hierarchy {
    pub is_root: bool,
    pub parent_id: Option<i64>,
    pub child_ids: Vec<i64>,
    pub depth: u32,
    pub root_id: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RollupMetrics {
    pub total_tokens: i64,
    pub total_cost: f64,
    pub active_agent_count: u32,
    pub total_agent_count: u32,
    pub max_delegation_depth: u32,
    pub child_session_count: u32,
    pub avg_quality: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEntry {
    pub predicate: String,
    pub severity: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub project_key: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub context_percent: f64,
    pub quality_score: i64,
    pub confidence_score: i64,
    pub tokens: i64,
    pub cost: f64,
    pub hierarchy: Hierarchy,
    pub active_delegations: Vec<Delegation>,
    pub completed_delegations: VecDeque<Delegation>,
    pub rollup_metrics: RollupMetrics,
    pub ended_at: Option<DateTime<Utc>>,
    pub alerts: Vec<AlertEntry>,
}

/// Fields accepted by [`SessionRegistry::update`]; absent fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub context_percent: Option<f64>,
    pub quality_score: Option<i64>,
    pub confidence_score: Option<i64>,
    pub tokens: Option<i64>,
    pub cost: Option<f64>,
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Clone)]
pub struct InitialSession {
    pub project_key: String,
    pub parent_id: Option<i64>,
}

// ── Persistence fallback state machine ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    ModuleMissing,
    DirectoryFailure,
    OpenFailure,
    InitFailure,
    Locked,
    Corrupt,
    DiskFull,
    PermissionDenied,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    UserAction,
    Manual,
    None,
}

impl FallbackReason {
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            FallbackReason::ModuleMissing => RecoveryStrategy::Manual,
            FallbackReason::DirectoryFailure => RecoveryStrategy::Retry,
            FallbackReason::OpenFailure => RecoveryStrategy::Retry,
            FallbackReason::InitFailure => RecoveryStrategy::Retry,
            FallbackReason::Locked => RecoveryStrategy::Retry,
            FallbackReason::Corrupt => RecoveryStrategy::UserAction,
            FallbackReason::DiskFull => RecoveryStrategy::UserAction,
            FallbackReason::PermissionDenied => RecoveryStrategy::UserAction,
            FallbackReason::Unknown => RecoveryStrategy::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::ModuleMissing => "module_missing",
            FallbackReason::DirectoryFailure => "directory_failure",
            FallbackReason::OpenFailure => "open_failure",
            FallbackReason::InitFailure => "init_failure",
            FallbackReason::Locked => "locked",
            FallbackReason::Corrupt => "corrupt",
            FallbackReason::DiskFull => "disk_full",
            FallbackReason::PermissionDenied => "permission_denied",
            FallbackReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackState {
    pub active: bool,
    pub reason: Option<FallbackReason>,
    pub consecutive_failures: u32,
    pub current_delay_ms: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
}

impl FallbackState {
    fn new(base_delay_ms: i64) -> Self {
        Self {
            active: false,
            reason: None,
            consecutive_failures: 0,
            current_delay_ms: base_delay_ms,
            last_attempt_at: None,
            recovery_attempts: 0,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

pub struct SessionRegistry {
    sessions: DashMap<i64, Session>,
    next_id: AtomicI64,
    store: Option<Arc<dyn CoordinationStore>>,
    events: EventBus,
    fallback: Mutex<FallbackState>,
    config: Config,
}

impl SessionRegistry {
    pub fn new(config: Config, store: Option<Arc<dyn CoordinationStore>>, events: EventBus) -> Self {
        let base_delay = config.recovery_interval_ms;
        Self {
            sessions: DashMap::new(),
            next_id: AtomicI64::new(1),
            store,
            events,
            fallback: Mutex::new(FallbackState::new(base_delay)),
            config,
        }
    }

    /// Load `next_id` from the store, if present. Best-effort: a missing
    /// store or missing key leaves the default starting id of 1.
    pub async fn hydrate_next_id(&self) {
        if let Some(store) = &self.store {
            if let Ok(Some(raw)) = store.get_system_info(NEXT_ID_KEY).await {
                if let Ok(parsed) = raw.parse::<i64>() {
                    self.next_id.store(parsed, Ordering::SeqCst);
                }
            }
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn persist_next_id_best_effort(&self) {
        if let Some(store) = &self.store {
            let value = self.next_id.load(Ordering::SeqCst).to_string();
            let _ = store.set_system_info(NEXT_ID_KEY, &value).await;
        }
    }

    async fn persist_session_best_effort(&self, session: &Session) {
        if let Some(store) = &self.store {
            let mut record = SessionRecord::new(&session.project_key, "agent");
            // Carry the Registry's own allocated id through so the store's
            // row and the in-process session share one id space; `heartbeat`
            // and `deregister` rely on this to address the right row.
            record.id = session.id;
            let _ = store.register_session(record).await;
        }
    }

    pub async fn register(&self, initial: InitialSession) -> Result<i64> {
        let id = self.allocate_id();
        self.persist_next_id_best_effort().await;

        let (depth, root_id, is_root) = match initial.parent_id {
            Some(parent_id) => {
                let parent = self
                    .sessions
                    .get(&parent_id)
                    .ok_or(CoreError::ParentNotFound(parent_id))?;
                (parent.hierarchy.depth + 1, parent.hierarchy.root_id, false)
            }
            None => (0, id, true),
        };

        let now = Utc::now();
        let session = Session {
            id,
            project_key: initial.project_key.clone(),
            status: SessionStatus::Idle,
            start_time: now,
            last_heartbeat: now,
            context_percent: 0.0,
            quality_score: 0,
            confidence_score: 0,
            tokens: 0,
            cost: 0.0,
            hierarchy: Hierarchy {
                is_root,
                parent_id: initial.parent_id,
                child_ids: Vec::new(),
                depth,
                root_id,
            },
            active_delegations: Vec::new(),
            completed_delegations: VecDeque::new(),
            rollup_metrics: RollupMetrics::default(),
            ended_at: None,
            alerts: Vec::new(),
        };

        self.persist_session_best_effort(&session).await;
        self.sessions.insert(id, session);

        if let Some(parent_id) = initial.parent_id {
            if let Some(mut parent) = self.sessions.get_mut(&parent_id) {
                parent.hierarchy.child_ids.push(id);
            }
            self.events.emit(Event::SessionChildAdded { parent_id, child_id: id });
        }

        self.events.emit(Event::SessionRegistered {
            session_id: id,
            project_path: initial.project_key,
            parent_id: initial.parent_id,
        });

        Ok(id)
    }

    fn evaluate_alerts(session: &mut Session) {
        let mut new_alerts = Vec::new();
        if session.context_percent > 90.0 {
            new_alerts.push(("context_high", "critical"));
        } else if session.context_percent > 80.0 {
            new_alerts.push(("context_high", "warning"));
        }
        if session.confidence_score < 40 {
            new_alerts.push(("confidence_low", "critical"));
        } else if session.confidence_score < 60 {
            new_alerts.push(("confidence_low", "warning"));
        }
        let now = Utc::now();
        for (predicate, severity) in new_alerts {
            session.alerts.push(AlertEntry {
                predicate: predicate.to_string(),
                severity: severity.to_string(),
                at: now,
            });
        }
    }

    pub fn update(&self, id: i64, updates: SessionUpdate) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoreError::SessionNotFound(id))?;

        if let Some(v) = updates.context_percent {
            session.context_percent = v;
        }
        if let Some(v) = updates.quality_score {
            session.quality_score = v;
        }
        if let Some(v) = updates.confidence_score {
            session.confidence_score = v;
        }
        if let Some(v) = updates.tokens {
            session.tokens = v;
        }
        if let Some(v) = updates.cost {
            session.cost = v;
        }
        if let Some(v) = updates.status {
            session.status = v;
        }
        session.last_heartbeat = Utc::now();

        Self::evaluate_alerts(&mut session);
        Ok(())
    }

    pub async fn heartbeat(&self, id: i64) -> Result<()> {
        let at = {
            let mut session = self
                .sessions
                .get_mut(&id)
                .ok_or(CoreError::SessionNotFound(id))?;
            session.last_heartbeat = Utc::now();
            session.last_heartbeat
        };

        // Best-effort, mirroring `persist_next_id_best_effort`: a store
        // hiccup here shouldn't fail an in-process heartbeat, but the
        // durable `last_heartbeat` is what `get_active_sessions` /
        // `cleanup_stale_sessions` consult across processes, so we still try.
        if let Some(store) = &self.store {
            if let Err(err) = store.update_heartbeat(id).await {
                tracing::warn!(session_id = id, error = %err, "failed to persist heartbeat");
            }
        }

        self.events.emit(Event::SessionHeartbeat { session_id: id, at });
        Ok(())
    }

    pub fn deregister(&self, id: i64) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        session.status = SessionStatus::Ended;
        session.ended_at = Some(Utc::now());
        drop(session);
        self.events.emit(Event::SessionDeregistered { session_id: id });
        Ok(())
    }

    pub fn add_delegation(&self, session_id: i64, delegation: Delegation) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CoreError::SessionNotFound(session_id))?;
        let delegation_id = delegation.delegation_id.clone();
        session.active_delegations.push(delegation);
        drop(session);
        self.events.emit(Event::DelegationAdded { session_id, delegation_id });
        Ok(())
    }

    pub fn update_delegation(
        &self,
        session_id: i64,
        delegation_id: &str,
        status: DelegationStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(CoreError::SessionNotFound(session_id))?;

        let position = session
            .active_delegations
            .iter()
            .position(|d| d.delegation_id == delegation_id);

        match position {
            Some(idx) => {
                let mut delegation = session.active_delegations[idx].clone();
                delegation.status = status;
                delegation.updated_at = Utc::now();
                delegation.result = result;
                delegation.error = error;

                if status.is_terminal() {
                    delegation.completed_at = Some(delegation.updated_at);
                    session.active_delegations.remove(idx);
                    session.completed_delegations.push_back(delegation);
                    while session.completed_delegations.len() > COMPLETED_DELEGATIONS_CAP {
                        session.completed_delegations.pop_front();
                    }
                } else {
                    session.active_delegations[idx] = delegation;
                }
            }
            None => {
                return Err(CoreError::Other(anyhow::anyhow!(
                    "delegation not found: {delegation_id}"
                )))
            }
        }

        drop(session);
        self.events.emit(Event::DelegationUpdated {
            session_id,
            delegation_id: delegation_id.to_string(),
            status: status.as_str().to_string(),
        });
        Ok(())
    }

    /// Recursive rollup computation per §4.4; `visited` breaks cycles.
    fn compute_rollup(
        &self,
        id: i64,
        visited: &mut std::collections::HashSet<i64>,
    ) -> RollupMetrics {
        if !visited.insert(id) {
            tracing::warn!(session_id = id, "cycle detected in session hierarchy rollup");
            return RollupMetrics::default();
        }

        let Some(session) = self.sessions.get(&id) else {
            return RollupMetrics::default();
        };

        let own_active = matches!(session.status, SessionStatus::Active) as u32;
        let own_tokens = session.tokens;
        let own_cost = session.cost;
        let own_depth = session.hierarchy.depth;
        let own_quality = session.quality_score;
        let child_ids = session.hierarchy.child_ids.clone();
        drop(session);

        let mut total_tokens = own_tokens;
        let mut total_cost = own_cost;
        let mut active_agent_count = own_active;
        let mut total_agent_count = 1u32;
        let mut max_delegation_depth = own_depth;
        let mut child_session_count = child_ids.len() as u32;
        let mut quality_weighted_sum = (own_quality as f64) * 1.0;

        for child_id in &child_ids {
            let child_rollup = self.compute_rollup(*child_id, visited);
            total_tokens += child_rollup.total_tokens;
            total_cost += child_rollup.total_cost;
            active_agent_count += child_rollup.active_agent_count;
            total_agent_count += child_rollup.total_agent_count;
            max_delegation_depth = max_delegation_depth.max(child_rollup.max_delegation_depth);
            child_session_count += child_rollup.child_session_count;
            quality_weighted_sum +=
                (child_rollup.avg_quality as f64) * (child_rollup.total_agent_count as f64);
        }

        let avg_quality = if total_agent_count > 0 {
            (quality_weighted_sum / total_agent_count as f64).round() as i64
        } else {
            0
        };

        RollupMetrics {
            total_tokens,
            total_cost: (total_cost * 100.0).round() / 100.0,
            active_agent_count,
            total_agent_count,
            max_delegation_depth,
            child_session_count,
            avg_quality,
        }
    }

    pub fn get_rollup_metrics(&self, id: i64) -> Result<RollupMetrics> {
        if !self.sessions.contains_key(&id) {
            return Err(CoreError::SessionNotFound(id));
        }
        let mut visited = std::collections::HashSet::new();
        let rollup = self.compute_rollup(id, &mut visited);
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.rollup_metrics = rollup;
        }
        Ok(rollup)
    }

    /// Apply a metric delta at `id`, then recompute and cache the rollup at
    /// every ancestor up to the root, emitting `session:rollupUpdated` at
    /// each one.
    pub fn propagate_metric_update(&self, id: i64, metric: &str, delta: f64) -> Result<()> {
        {
            let mut session = self
                .sessions
                .get_mut(&id)
                .ok_or(CoreError::SessionNotFound(id))?;
            match metric {
                "tokens" => session.tokens += delta as i64,
                "cost" => session.cost += delta,
                _ => {
                    return Err(CoreError::Other(anyhow::anyhow!(
                        "unknown rollup metric: {metric}"
                    )))
                }
            }
        }

        let mut current = Some(id);
        while let Some(current_id) = current {
            let rollup = self.get_rollup_metrics(current_id)?;
            self.events.emit(Event::SessionRollupUpdated {
                session_id: current_id,
                total_tokens: rollup.total_tokens,
                total_cost: rollup.total_cost,
            });
            current = self
                .sessions
                .get(&current_id)
                .and_then(|s| s.hierarchy.parent_id);
        }
        Ok(())
    }

    pub fn list_children(&self, id: i64) -> Result<Vec<i64>> {
        self.sessions
            .get(&id)
            .map(|s| s.hierarchy.child_ids.clone())
            .ok_or(CoreError::SessionNotFound(id))
    }

    pub fn list_descendants(&self, id: i64) -> Result<Vec<i64>> {
        if !self.sessions.contains_key(&id) {
            return Err(CoreError::SessionNotFound(id));
        }
        let mut visited = std::collections::HashSet::new();
        visited.insert(id);
        let mut out = Vec::new();
        let mut stack = self.list_children(id)?;
        while let Some(next_id) = stack.pop() {
            if !visited.insert(next_id) {
                continue;
            }
            out.push(next_id);
            if let Ok(children) = self.list_children(next_id) {
                stack.extend(children);
            }
        }
        Ok(out)
    }

    /// Subtree view {sessionId, project, status, depth, isRoot,
    /// activeDelegationCount, metrics, children[]}, cycle-safe.
    pub fn get_hierarchy(&self, id: i64) -> Result<HierarchyView> {
        let mut visited = std::collections::HashSet::new();
        self.build_hierarchy_view(id, &mut visited)
    }

    fn build_hierarchy_view(
        &self,
        id: i64,
        visited: &mut std::collections::HashSet<i64>,
    ) -> Result<HierarchyView> {
        if !visited.insert(id) {
            return Err(CoreError::Other(anyhow::anyhow!(
                "cycle detected while building hierarchy view at session {id}"
            )));
        }
        let session = self
            .sessions
            .get(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        let child_ids = session.hierarchy.child_ids.clone();
        let view = HierarchyView {
            session_id: id,
            project_key: session.project_key.clone(),
            status: session.status,
            depth: session.hierarchy.depth,
            is_root: session.hierarchy.is_root,
            active_delegation_count: session.active_delegations.len(),
            metrics: session.rollup_metrics,
            children: Vec::new(),
        };
        drop(session);

        let mut view = view;
        for child_id in child_ids {
            view.children.push(self.build_hierarchy_view(child_id, visited)?);
        }
        Ok(view)
    }

    pub fn record_alert(&self, id: i64, predicate: impl Into<String>, severity: impl Into<String>) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        session.alerts.push(AlertEntry {
            predicate: predicate.into(),
            severity: severity.into(),
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn clear_alerts(&self, id: i64) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(CoreError::SessionNotFound(id))?;
        session.alerts.clear();
        Ok(())
    }

    /// Lock-free point-in-time read of every session. Never mutates.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Mark sessions whose `last_heartbeat` predates `threshold_ms` as
    /// expired, emit `session:expired`, and remove them along with their
    /// alert history.
    pub fn cleanup_stale(&self, threshold_ms: i64) -> u64 {
        let now = Utc::now();
        let stale_ids: Vec<i64> = self
            .sessions
            .iter()
            .filter(|e| (now - e.value().last_heartbeat) > chrono::Duration::milliseconds(threshold_ms))
            .map(|e| *e.key())
            .collect();

        for id in &stale_ids {
            self.sessions.remove(id);
            self.events.emit(Event::SessionExpired { session_id: *id });
        }
        stale_ids.len() as u64
    }

    // ── Persistence fallback ────────────────────────────────────────────

    pub fn activate_fallback(&self, reason: FallbackReason) {
        let mut fallback = self.fallback.lock();
        fallback.active = true;
        fallback.reason = Some(reason);
        fallback.consecutive_failures += 1;
        self.events.emit(Event::PersistenceFallback {
            reason: reason.as_str().to_string(),
        });
    }

    /// Whether the recovery scheduler should attempt recovery now, given the
    /// doubling backoff capped at 5 minutes (mirrors `job.rs`'s
    /// `next_retry_at`).
    pub fn should_attempt_recovery(&self, now: DateTime<Utc>) -> bool {
        let fallback = self.fallback.lock();
        if !fallback.active {
            return false;
        }
        if fallback.recovery_attempts >= self.config.max_recovery_attempts {
            return false;
        }
        match fallback.reason.map(|r| r.strategy()) {
            Some(RecoveryStrategy::Retry) => {}
            _ => return false,
        }
        match fallback.last_attempt_at {
            None => true,
            Some(last) => (now - last) >= chrono::Duration::milliseconds(fallback.current_delay_ms),
        }
    }

    pub fn record_recovery_attempt(&self, now: DateTime<Utc>) {
        let mut fallback = self.fallback.lock();
        fallback.last_attempt_at = Some(now);
        fallback.recovery_attempts += 1;
        self.events.emit(Event::PersistenceRecoveryAttempt {
            attempt: fallback.recovery_attempts,
        });
        if fallback.recovery_attempts >= self.config.max_recovery_attempts {
            self.events.emit(Event::PersistenceRecoveryExhausted);
        }
    }

    pub fn record_recovery_success(&self) {
        let mut fallback = self.fallback.lock();
        *fallback = FallbackState::new(self.config.recovery_interval_ms);
        self.events.emit(Event::PersistenceReconnected);
    }

    pub fn record_recovery_failure(&self) {
        let mut fallback = self.fallback.lock();
        let multiplier = self.config.recovery_backoff_multiplier.max(1) as i64;
        fallback.current_delay_ms = (fallback.current_delay_ms * multiplier).min(300_000);
        fallback.consecutive_failures += 1;
    }

    pub fn force_recovery(&self) {
        let mut fallback = self.fallback.lock();
        fallback.last_attempt_at = None;
    }

    pub fn reset_fallback_metrics(&self) {
        let mut fallback = self.fallback.lock();
        *fallback = FallbackState::new(self.config.recovery_interval_ms);
    }

    pub fn fallback_snapshot(&self) -> FallbackState {
        self.fallback.lock().clone()
    }

    /// Run the periodic health check against the store (`SELECT 1`
    /// equivalent: reading a known system_info key). On failure, classifies
    /// the error and activates fallback if previously healthy.
    pub async fn health_check(&self) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get_system_info(NEXT_ID_KEY).await {
            Ok(_) => {
                if self.fallback.lock().active {
                    self.record_recovery_success();
                }
            }
            Err(_) => {
                self.activate_fallback(FallbackReason::Unknown);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyView {
    pub session_id: i64,
    pub project_key: String,
    pub status: SessionStatus,
    pub depth: u32,
    pub is_root: bool,
    pub active_delegation_count: usize,
    pub metrics: RollupMetrics,
    pub children: Vec<HierarchyView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Config::default(), None, EventBus::new())
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_durable_last_heartbeat() {
        use agentmesh_store::SqliteCoordinationStore;

        let store: Arc<dyn CoordinationStore> =
            Arc::new(SqliteCoordinationStore::open_in_memory().unwrap());
        let reg = SessionRegistry::new(Config::default(), Some(store.clone()), EventBus::new());
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();

        let before = store.get_active_sessions(0).await.unwrap();
        let before_heartbeat = before.iter().find(|s| s.id == id).unwrap().last_heartbeat;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        reg.heartbeat(id).await.unwrap();

        let after = store.get_active_sessions(0).await.unwrap();
        let after_heartbeat = after.iter().find(|s| s.id == id).unwrap().last_heartbeat;
        assert!(after_heartbeat > before_heartbeat);
    }

    #[tokio::test]
    async fn test_register_root_session() {
        let reg = registry();
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let snap = reg.snapshot();
        let session = snap.iter().find(|s| s.id == id).unwrap();
        assert!(session.hierarchy.is_root);
        assert_eq!(session.hierarchy.depth, 0);
    }

    #[tokio::test]
    async fn test_register_child_increments_depth_and_parent_children() {
        let reg = registry();
        let parent = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let child = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(parent) })
            .await
            .unwrap();
        assert_eq!(reg.list_children(parent).unwrap(), vec![child]);
        let snap = reg.snapshot();
        let child_session = snap.iter().find(|s| s.id == child).unwrap();
        assert_eq!(child_session.hierarchy.depth, 1);
        assert_eq!(child_session.hierarchy.root_id, parent);
    }

    #[tokio::test]
    async fn test_register_missing_parent_errors() {
        let reg = registry();
        let err = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(999) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ParentNotFound(999)));
    }

    #[tokio::test]
    async fn test_update_records_alerts_above_threshold() {
        let reg = registry();
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        reg.update(
            id,
            SessionUpdate { context_percent: Some(95.0), ..Default::default() },
        )
        .unwrap();
        let snap = reg.snapshot();
        let session = snap.iter().find(|s| s.id == id).unwrap();
        assert!(session.alerts.iter().any(|a| a.predicate == "context_high" && a.severity == "critical"));
    }

    #[tokio::test]
    async fn test_deregister_keeps_session_visible() {
        let reg = registry();
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        reg.deregister(id).unwrap();
        let snap = reg.snapshot();
        let session = snap.iter().find(|s| s.id == id).unwrap();
        assert_eq!(session.status, SessionStatus::Ended);
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_delegation_lifecycle_moves_to_completed_ring() {
        let reg = registry();
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let delegation = Delegation::new(id, "agent-1", "task-1");
        let delegation_id = delegation.delegation_id.clone();
        reg.add_delegation(id, delegation).unwrap();
        reg.update_delegation(id, &delegation_id, DelegationStatus::Completed, None, None)
            .unwrap();

        let snap = reg.snapshot();
        let session = snap.iter().find(|s| s.id == id).unwrap();
        assert!(session.active_delegations.is_empty());
        assert_eq!(session.completed_delegations.len(), 1);
    }

    #[tokio::test]
    async fn test_rollup_sums_children() {
        let reg = registry();
        let parent = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let child = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(parent) })
            .await
            .unwrap();
        reg.update(parent, SessionUpdate { tokens: Some(100), ..Default::default() }).unwrap();
        reg.update(child, SessionUpdate { tokens: Some(50), ..Default::default() }).unwrap();

        let rollup = reg.get_rollup_metrics(parent).unwrap();
        assert_eq!(rollup.total_tokens, 150);
        assert_eq!(rollup.total_agent_count, 2);
        assert_eq!(rollup.child_session_count, 1);
    }

    #[tokio::test]
    async fn test_propagate_metric_update_emits_at_each_ancestor() {
        let reg = registry();
        let root = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        let mid = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(root) })
            .await
            .unwrap();
        let leaf = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(mid) })
            .await
            .unwrap();

        reg.propagate_metric_update(leaf, "tokens", 42.0).unwrap();

        assert_eq!(reg.get_rollup_metrics(root).unwrap().total_tokens, 42);
        assert_eq!(reg.get_rollup_metrics(mid).unwrap().total_tokens, 42);
    }

    #[tokio::test]
    async fn test_cleanup_stale_removes_and_emits() {
        let reg = registry();
        let id = reg
            .register(InitialSession { project_key: "/repo".to_string(), parent_id: None })
            .await
            .unwrap();
        {
            let mut snap = reg.sessions.get_mut(&id).unwrap();
            snap.last_heartbeat = Utc::now() - chrono::Duration::hours(1);
        }
        let removed = reg.cleanup_stale(30 * 60 * 1000);
        assert_eq!(removed, 1);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_fallback_reason_strategy_mapping() {
        assert_eq!(FallbackReason::DirectoryFailure.strategy(), RecoveryStrategy::Retry);
        assert_eq!(FallbackReason::Corrupt.strategy(), RecoveryStrategy::UserAction);
        assert_eq!(FallbackReason::ModuleMissing.strategy(), RecoveryStrategy::Manual);
        assert_eq!(FallbackReason::Unknown.strategy(), RecoveryStrategy::None);
    }

    #[test]
    fn test_recovery_backoff_doubles_and_caps() {
        let reg = registry();
        reg.activate_fallback(FallbackReason::OpenFailure);
        let before = reg.fallback_snapshot().current_delay_ms;
        reg.record_recovery_failure();
        let after = reg.fallback_snapshot().current_delay_ms;
        assert_eq!(after, before * 2);
    }

    #[test]
    fn test_recovery_success_resets_state() {
        let reg = registry();
        reg.activate_fallback(FallbackReason::Locked);
        reg.record_recovery_failure();
        reg.record_recovery_success();
        let state = reg.fallback_snapshot();
        assert!(!state.active);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_get_hierarchy_nests_children() {
        let reg = registry();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let parent = rt
            .block_on(reg.register(InitialSession { project_key: "/repo".to_string(), parent_id: None }))
            .unwrap();
        let child = rt
            .block_on(reg.register(InitialSession { project_key: "/repo".to_string(), parent_id: Some(parent) }))
            .unwrap();

        let view = reg.get_hierarchy(parent).unwrap();
        assert_eq!(view.children.len(), 1);
        assert_eq!(view.children[0].session_id, child);
    }
}
