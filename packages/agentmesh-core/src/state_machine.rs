//! Hierarchical Agent State Machine (Component C).
//!
//! Generalizes `codegraph-orchestration::job::JobStateMachine`'s pattern — a
//! state enum plus a thin wrapper validating the *current* state via `match`
//! before mutating — from a five-state job lifecycle to the spec's nine-state
//! agent lifecycle, adding optimistic-version checks and a bounded
//! state/event ring per agent (the same retain-based bounding
//! `checkpoint.rs` uses for its in-memory store, generalized to a fixed cap).

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};

const STATE_HISTORY_CAP: usize = 50;
const EVENT_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Initializing,
    Active,
    Delegating,
    Waiting,
    Completing,
    Completed,
    Failed,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Initializing => "initializing",
            AgentState::Active => "active",
            AgentState::Delegating => "delegating",
            AgentState::Waiting => "waiting",
            AgentState::Completing => "completing",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Terminated => "terminated",
        }
    }

    /// The transition table from §4.3, verbatim.
    pub fn allowed_transitions(&self) -> &'static [AgentState] {
        use AgentState::*;
        match self {
            Idle => &[Initializing, Terminated],
            Initializing => &[Active, Failed, Terminated],
            Active => &[Delegating, Waiting, Completing, Failed, Terminated],
            Delegating => &[Waiting, Active, Failed, Terminated],
            Waiting => &[Active, Completing, Failed, Terminated],
            Completing => &[Completed, Failed],
            Completed => &[Idle, Terminated],
            Failed => &[Idle, Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, to: AgentState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal_for_aggregate(&self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Terminated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub from: AgentState,
    pub to: AgentState,
    pub version: i64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub agent_id: String,
    pub kind: String,
    pub at: DateTime<Utc>,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateEntry {
    pub agent_id: String,
    pub state: AgentState,
    pub version: i64,
    pub parent_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state_history: VecDeque<StateHistoryEntry>,
    pub event_log: VecDeque<AgentEvent>,
}

impl AgentStateEntry {
    fn new(agent_id: String, parent_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            state: AgentState::Idle,
            version: 1,
            parent_id,
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            state_history: VecDeque::new(),
            event_log: VecDeque::new(),
        }
    }

    fn push_history(&mut self, entry: StateHistoryEntry) {
        self.state_history.push_back(entry);
        while self.state_history.len() > STATE_HISTORY_CAP {
            self.state_history.pop_front();
        }
    }

    fn push_event(&mut self, kind: impl Into<String>, detail: serde_json::Value) {
        self.event_log.push_back(AgentEvent {
            agent_id: self.agent_id.clone(),
            kind: kind.into(),
            at: Utc::now(),
            detail,
        });
        while self.event_log.len() > EVENT_LOG_CAP {
            self.event_log.pop_front();
        }
    }
}

fn merge_metadata(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_metadata(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[derive(Debug, Clone)]
pub struct AggregateState {
    pub state_counts: std::collections::HashMap<String, usize>,
    pub descendant_count: usize,
    pub active_count: usize,
    pub has_failures: bool,
    pub is_fully_complete: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FamilyTransitionOptions {
    pub max_wait_ms: i64,
}

impl Default for FamilyTransitionOptions {
    fn default() -> Self {
        Self { max_wait_ms: 5_000 }
    }
}

/// In-process registry of versioned agent state entries, keyed by agent id.
pub struct AgentStateMachine {
    entries: DashMap<String, AgentStateEntry>,
    children: DashMap<String, Vec<String>>,
    family_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    events: EventBus,
}

impl AgentStateMachine {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            children: DashMap::new(),
            family_locks: DashMap::new(),
            events,
        }
    }

    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        parent_id: Option<String>,
    ) -> AgentStateEntry {
        let agent_id = agent_id.into();
        let entry = AgentStateEntry::new(agent_id.clone(), parent_id.clone());
        self.entries.insert(agent_id.clone(), entry.clone());
        if let Some(parent) = parent_id {
            self.children.entry(parent).or_default().push(agent_id.clone());
        }
        self.events.emit(Event::AgentRegistered {
            agent_id: agent_id.clone(),
        });
        entry
    }

    pub fn unregister_agent(&self, agent_id: &str) -> Option<AgentStateEntry> {
        let removed = self.entries.remove(agent_id).map(|(_, v)| v);
        if removed.is_some() {
            self.events.emit(Event::AgentUnregistered {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentStateEntry> {
        self.entries.get(agent_id).map(|e| e.clone())
    }

    fn not_found(agent_id: &str) -> CoreError {
        CoreError::Other(anyhow::anyhow!("agent not found: {agent_id}"))
    }

    /// Validate and apply a single transition. Fails with
    /// [`CoreError::OptimisticLockConflict`] when `expected_version` is
    /// supplied and stale, or [`CoreError::InvalidTransition`] when the
    /// transition is not in the table — neither mutates the entry.
    pub fn update_state(
        &self,
        agent_id: &str,
        new_state: AgentState,
        expected_version: Option<i64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<AgentStateEntry> {
        let mut entry = self
            .entries
            .get_mut(agent_id)
            .ok_or_else(|| Self::not_found(agent_id))?;

        if let Some(expected) = expected_version {
            if expected != entry.version {
                return Err(CoreError::OptimisticLockConflict {
                    expected,
                    actual: entry.version,
                });
            }
        }

        if !entry.state.can_transition_to(new_state) {
            return Err(CoreError::InvalidTransition {
                from: entry.state.as_str().to_string(),
                to: new_state.as_str().to_string(),
            });
        }

        let from = entry.state;
        entry.state = new_state;
        entry.version += 1;
        entry.updated_at = Utc::now();
        if let Some(patch) = metadata {
            merge_metadata(&mut entry.metadata, patch);
        }
        entry.push_history(StateHistoryEntry {
            from,
            to: new_state,
            version: entry.version,
            at: entry.updated_at,
        });
        entry.push_event(
            "state:changed",
            serde_json::json!({"from": from.as_str(), "to": new_state.as_str()}),
        );

        self.events.emit(Event::StateChanged {
            agent_id: agent_id.to_string(),
            from: from.as_str().to_string(),
            to: new_state.as_str().to_string(),
            version: entry.version,
        });

        Ok(entry.clone())
    }

    fn family_lock(&self, parent_id: &str) -> Arc<AsyncMutex<()>> {
        self.family_locks
            .entry(parent_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Apply a parent transition and the same transition to every direct
    /// child atomically: validated first, applied only if every validation
    /// passes. Acquires a per-parent family lock (§4.3) so two concurrent
    /// callers never interleave partial application.
    pub async fn atomic_family_transition(
        &self,
        parent_id: &str,
        parent_state: AgentState,
        child_state: AgentState,
        opts: FamilyTransitionOptions,
    ) -> Result<()> {
        let lock = self.family_lock(parent_id);
        let guard = tokio::time::timeout(
            StdDuration::from_millis(opts.max_wait_ms.max(0) as u64),
            lock.lock(),
        )
        .await
        .map_err(|_| {
            CoreError::LockTimeout {
                resource: format!("family:{parent_id}"),
            }
        })?;

        let child_ids = self
            .children
            .get(parent_id)
            .map(|c| c.clone())
            .unwrap_or_default();

        // Validate before mutating anything.
        let parent_current = self
            .entries
            .get(parent_id)
            .ok_or_else(|| Self::not_found(parent_id))?
            .state;
        if !parent_current.can_transition_to(parent_state) {
            return Err(CoreError::InvalidTransition {
                from: parent_current.as_str().to_string(),
                to: parent_state.as_str().to_string(),
            });
        }

        for child_id in &child_ids {
            let child_current = self
                .entries
                .get(child_id)
                .ok_or_else(|| Self::not_found(child_id))?
                .state;
            if !child_current.can_transition_to(child_state) {
                return Err(CoreError::InvalidTransition {
                    from: child_current.as_str().to_string(),
                    to: child_state.as_str().to_string(),
                });
            }
        }

        // All validated: apply parent, then each child.
        self.update_state(parent_id, parent_state, None, None)?;
        for child_id in &child_ids {
            self.update_state(child_id, child_state, None, None)?;
        }

        drop(guard);
        Ok(())
    }

    fn collect_descendants(&self, agent_id: &str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        if !visited.insert(agent_id.to_string()) {
            tracing::warn!(agent_id, "cycle detected in agent hierarchy during traversal");
            return;
        }
        if let Some(children) = self.children.get(agent_id) {
            for child in children.iter() {
                out.push(child.clone());
                self.collect_descendants(child, visited, out);
            }
        }
    }

    /// Aggregate state counts over `agent_id` and every transitive
    /// descendant, cycle-safe via a visited set (§9).
    pub fn get_aggregate_state(&self, agent_id: &str) -> Option<AggregateState> {
        let root = self.entries.get(agent_id)?.clone();
        let mut visited = HashSet::new();
        let mut descendants = Vec::new();
        visited.insert(agent_id.to_string());
        self.collect_descendants(agent_id, &mut visited, &mut descendants);

        let mut state_counts = std::collections::HashMap::new();
        let mut active_count = 0usize;
        let mut has_failures = false;
        let mut is_fully_complete = true;

        for state in std::iter::once(root.state).chain(
            descendants
                .iter()
                .filter_map(|id| self.entries.get(id).map(|e| e.state)),
        ) {
            *state_counts.entry(state.as_str().to_string()).or_insert(0) += 1;
            if state == AgentState::Active {
                active_count += 1;
            }
            if state == AgentState::Failed {
                has_failures = true;
            }
            if !state.is_terminal_for_aggregate() {
                is_fully_complete = false;
            }
        }

        Some(AggregateState {
            state_counts,
            descendant_count: descendants.len(),
            active_count,
            has_failures,
            is_fully_complete,
        })
    }

    /// All per-agent event logs merged and sorted by timestamp.
    pub fn all_events(&self) -> Vec<AgentEvent> {
        let mut events: Vec<AgentEvent> = self
            .entries
            .iter()
            .flat_map(|entry| entry.event_log.iter().cloned().collect::<Vec<_>>())
            .collect();
        events.sort_by_key(|e| e.at);
        events
    }
}
