//! Delegation Decider & Pattern Selector (Component E).
//!
//! The cache keyed by `(taskId, agentId)` with opportunistic eviction is
//! grounded on `dag.rs`'s `CacheKeyManager`, and the declaration-order
//! tie-break in pattern selection mirrors `PipelineDAG::topological_sort`'s
//! stable ordering of equal-priority nodes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

const CACHE_EVICTION_THRESHOLD: usize = 100;

const TECHNICAL_KEYWORDS: &[&str] = &[
    "algorithm", "database", "concurrency", "async", "distributed", "protocol",
    "encryption", "parser", "compiler", "cache", "index", "schema", "migration",
    "race condition", "consensus",
];
const SCOPE_TERMS: &[&str] = &["refactor", "redesign", "migrate", "rewrite", "overhaul"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub phase: Option<String>,
    pub depends_on: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub estimate_hours: Option<f64>,
    pub has_children: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentView {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub confidence: Option<u32>,
    pub queue_depth: u32,
    pub max_queue_depth: u32,
    pub child_count: u32,
    pub max_children: u32,
    pub current_depth: u32,
    pub tokens_used: Option<u32>,
    pub max_tokens: Option<u32>,
    pub primary_phase: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    Parallel,
    Sequential,
    Debate,
    Review,
    Ensemble,
}

impl Pattern {
    /// Declaration order, used as the pattern-selection tie-break.
    pub const ALL: [Pattern; 5] = [
        Pattern::Parallel,
        Pattern::Sequential,
        Pattern::Debate,
        Pattern::Review,
        Pattern::Ensemble,
    ];

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Pattern::Parallel => &["parallel", "concurrent", "independent", "simultaneously"],
            Pattern::Sequential => &["sequential", "step by step", "in order", "pipeline"],
            Pattern::Debate => &["debate", "discuss", "compare approaches", "tradeoff"],
            Pattern::Review => &["review", "audit", "validate", "verify"],
            Pattern::Ensemble => &["ensemble", "combine", "vote", "consensus"],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelegationFactors {
    pub complexity: f64,
    pub context_utilization: f64,
    pub subtask_count: u32,
    pub agent_confidence: f64,
    pub agent_load: f64,
    pub depth_remaining: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationDecision {
    pub should_delegate: bool,
    pub confidence: u32,
    pub score: u32,
    pub factors: DelegationFactors,
    pub factor_contributions: HashMap<String, f64>,
    pub suggested_pattern: Pattern,
    pub reasoning: String,
    pub hints: Vec<String>,
    pub cached_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct DelegationWeights {
    pub complexity: f64,
    pub context_utilization: f64,
    pub subtask_count: f64,
    pub confidence_inverted: f64,
    pub agent_load: f64,
    pub depth_remaining: f64,
}

impl Default for DelegationWeights {
    fn default() -> Self {
        Self {
            complexity: 0.30,
            context_utilization: 0.20,
            subtask_count: 0.15,
            confidence_inverted: 0.15,
            agent_load: 0.10,
            depth_remaining: 0.10,
        }
    }
}

fn count_keyword_matches(haystack: &str, keywords: &[&str]) -> usize {
    let lower = haystack.to_lowercase();
    keywords.iter().filter(|k| lower.contains(*k)).count()
}

fn compute_complexity(task: &Task) -> f64 {
    let len = task.description.len();
    let mut score = if len <= 50 {
        5.0
    } else if len <= 200 {
        10.0
    } else if len <= 500 {
        20.0
    } else {
        25.0
    };

    let keyword_hits = count_keyword_matches(&task.description, TECHNICAL_KEYWORDS).min(5);
    score += (keyword_hits * 5) as f64;

    let scope_hits = count_keyword_matches(&task.description, SCOPE_TERMS).min(3);
    score += (scope_hits * 5) as f64;

    let dep_count = task.depends_on.len().min(5);
    score += (dep_count * 3) as f64;

    score += ((task.acceptance_criteria.len() * 2) as f64).min(15.0);

    if let Some(hours) = task.estimate_hours {
        if hours >= 8.0 {
            score += 15.0;
        } else if hours >= 4.0 {
            score += 10.0;
        } else if hours >= 2.0 {
            score += 5.0;
        }
    }

    score.min(100.0)
}

fn compute_context_utilization(agent: &AgentView) -> f64 {
    match (agent.tokens_used, agent.max_tokens) {
        (Some(used), Some(max)) if max > 0 => ((used as f64 / max as f64) * 100.0).clamp(0.0, 100.0),
        _ => 50.0,
    }
}

fn count_description_items(description: &str) -> usize {
    description
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-')
                || trimmed.starts_with('*')
                || trimmed
                    .split_once('.')
                    .map(|(prefix, _)| !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
        })
        .count()
}

fn compute_subtask_count(task: &Task) -> u32 {
    let from_criteria = task.acceptance_criteria.len();
    let from_description = count_description_items(&task.description);
    from_criteria.max(from_description) as u32
}

fn compute_agent_confidence(agent: &AgentView, task: &Task) -> f64 {
    if let Some(confidence) = agent.confidence {
        return confidence as f64;
    }
    if !agent.required_capabilities.is_empty() {
        let covered = agent
            .required_capabilities
            .iter()
            .filter(|cap| agent.capabilities.contains(cap))
            .count();
        return (covered as f64 / agent.required_capabilities.len() as f64) * 100.0;
    }
    if let Some(primary) = &agent.primary_phase {
        if Some(primary) == task.phase.as_ref() {
            return 85.0;
        }
        return 60.0;
    }
    75.0
}

fn compute_agent_load(agent: &AgentView) -> f64 {
    if agent.max_queue_depth > 0 {
        (agent.queue_depth as f64 / agent.max_queue_depth as f64) * 100.0
    } else if agent.max_children > 0 {
        (agent.child_count as f64 / agent.max_children as f64) * 100.0
    } else {
        0.0
    }
}

fn compute_depth_remaining(agent: &AgentView, max_delegation_depth: u32) -> i32 {
    max_delegation_depth as i32 - agent.current_depth as i32
}

fn is_extreme(value: f64) -> bool {
    value > 80.0 || value < 20.0
}

struct CachedDecision {
    decision: DelegationDecision,
    cached_until: DateTime<Utc>,
}

/// Computes delegation decisions and selects a collaboration pattern,
/// caching results per `(taskId, agentId)` for `cache_max_age_ms`.
pub struct DelegationDecider {
    weights: DelegationWeights,
    min_delegation_score: u32,
    max_delegation_depth: u32,
    cache_max_age_ms: i64,
    cache: DashMap<(String, String), CachedDecision>,
}

impl DelegationDecider {
    pub fn new(min_delegation_score: u32, max_delegation_depth: u32, cache_max_age_ms: i64) -> Self {
        Self {
            weights: DelegationWeights::default(),
            min_delegation_score,
            max_delegation_depth,
            cache_max_age_ms,
            cache: DashMap::new(),
        }
    }

    fn evict_if_large(&self) {
        if self.cache.len() <= CACHE_EVICTION_THRESHOLD {
            return;
        }
        let now = Utc::now();
        let expired: Vec<(String, String)> = self
            .cache
            .iter()
            .filter(|e| e.cached_until <= now)
            .map(|e| e.key().clone())
            .collect();
        for key in expired {
            self.cache.remove(&key);
        }
    }

    pub fn flush_cache(&self) {
        self.cache.clear();
    }

    fn select_pattern(&self, task: &Task, agent_confidence: f64, subtask_count: u32) -> Pattern {
        let text = format!("{} {}", task.title, task.description);
        let mut scores: HashMap<Pattern, i32> = Pattern::ALL
            .iter()
            .map(|p| (*p, (count_keyword_matches(&text, p.keywords()) * 2) as i32))
            .collect();

        if subtask_count >= 3 {
            *scores.get_mut(&Pattern::Parallel).unwrap() += 3;
        }
        if !task.depends_on.is_empty() {
            *scores.get_mut(&Pattern::Sequential).unwrap() += task.depends_on.len() as i32;
        }
        if agent_confidence < 60.0 {
            *scores.get_mut(&Pattern::Debate).unwrap() += 2;
            *scores.get_mut(&Pattern::Ensemble).unwrap() += 1;
        }
        match task.phase.as_deref() {
            Some("implementation") => {
                *scores.get_mut(&Pattern::Parallel).unwrap() += 2;
                *scores.get_mut(&Pattern::Sequential).unwrap() += 2;
            }
            Some("research") | Some("planning") => {
                *scores.get_mut(&Pattern::Debate).unwrap() += 2;
            }
            Some("design") | Some("validation") => {
                *scores.get_mut(&Pattern::Review).unwrap() += 2;
            }
            _ => {}
        }

        // `Iterator::max_by_key` keeps the *last* maximal element on ties;
        // the spec breaks ties in declaration order (parallel first), so we
        // fold manually and only replace on a strictly greater score.
        let mut best = Pattern::Parallel;
        let mut best_score = scores[&best];
        for pattern in Pattern::ALL.iter().copied().skip(1) {
            let s = scores[&pattern];
            if s > best_score {
                best = pattern;
                best_score = s;
            }
        }
        best
    }

    pub fn decide(
        &self,
        task: &Task,
        agent: &AgentView,
        skip_cache: bool,
    ) -> DelegationDecision {
        let cache_key = (task.task_id.clone(), agent.agent_id.clone());
        if !skip_cache {
            if let Some(cached) = self.cache.get(&cache_key) {
                if cached.cached_until > Utc::now() {
                    return cached.decision.clone();
                }
            }
        }

        let complexity = compute_complexity(task);
        let context_utilization = compute_context_utilization(agent);
        let subtask_count = compute_subtask_count(task);
        let agent_confidence = compute_agent_confidence(agent, task);
        let agent_load = compute_agent_load(agent);
        let depth_remaining = compute_depth_remaining(agent, self.max_delegation_depth);

        let subtask_normalized = ((subtask_count as f64) * 20.0).min(100.0);
        let depth_normalized = ((depth_remaining.max(0) as f64) / self.max_delegation_depth.max(1) as f64
            * 100.0)
            .min(100.0);
        let inverted_confidence = 100.0 - agent_confidence;

        let mut contributions = HashMap::new();
        contributions.insert("complexity".to_string(), complexity * self.weights.complexity);
        contributions.insert(
            "contextUtilization".to_string(),
            context_utilization * self.weights.context_utilization,
        );
        contributions.insert(
            "subtaskCount".to_string(),
            subtask_normalized * self.weights.subtask_count,
        );
        contributions.insert(
            "agentConfidence".to_string(),
            inverted_confidence * self.weights.confidence_inverted,
        );
        contributions.insert("agentLoad".to_string(), agent_load * self.weights.agent_load);
        contributions.insert(
            "depthRemaining".to_string(),
            depth_normalized * self.weights.depth_remaining,
        );

        let raw_score: f64 = contributions.values().sum();
        let score = raw_score.round().clamp(0.0, 100.0) as u32;

        let gates_hold = depth_remaining > 0
            && !task.has_children
            && subtask_count >= 2
            && agent.child_count < agent.max_children;

        let should_delegate = score >= self.min_delegation_score && gates_hold;

        let mut confidence = 50u32;
        if is_extreme(complexity) {
            confidence += 15;
        }
        if is_extreme(subtask_normalized) {
            confidence += 10;
        }
        if is_extreme(agent_confidence) {
            confidence += 10;
        }
        if is_extreme(context_utilization) {
            confidence += 10;
        }
        if is_extreme(score as f64) {
            confidence += 15;
        }
        let confidence = confidence.min(100);

        let suggested_pattern = self.select_pattern(task, agent_confidence, subtask_count);

        let mut hints = Vec::new();
        if !gates_hold {
            if depth_remaining <= 0 {
                hints.push("max delegation depth reached".to_string());
            }
            if task.has_children {
                hints.push("task already has child delegations".to_string());
            }
            if subtask_count < 2 {
                hints.push("fewer than two subtasks".to_string());
            }
            if agent.child_count >= agent.max_children {
                hints.push("agent has reached max child agents".to_string());
            }
        }

        let reasoning = format!(
            "score={score} (min {min}), gates_hold={gates_hold}, pattern={pattern:?}",
            min = self.min_delegation_score,
            pattern = suggested_pattern,
        );

        let cached_until = Utc::now() + chrono::Duration::milliseconds(self.cache_max_age_ms);

        let decision = DelegationDecision {
            should_delegate,
            confidence,
            score,
            factors: DelegationFactors {
                complexity,
                context_utilization,
                subtask_count,
                agent_confidence,
                agent_load,
                depth_remaining,
            },
            factor_contributions: contributions,
            suggested_pattern,
            reasoning,
            hints,
            cached_until,
        };

        if !skip_cache {
            self.cache.insert(cache_key, CachedDecision {
                decision: decision.clone(),
                cached_until,
            });
            self.evict_if_large();
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_task() -> Task {
        Task {
            task_id: "t1".to_string(),
            title: "Refactor the cache layer".to_string(),
            description: "Refactor the cache index schema and migration path for the database."
                .to_string(),
            phase: Some("implementation".to_string()),
            depends_on: vec![],
            acceptance_criteria: vec!["criterion a".to_string(), "criterion b".to_string()],
            estimate_hours: Some(3.0),
            has_children: false,
        }
    }

    fn base_agent() -> AgentView {
        AgentView {
            agent_id: "agent-1".to_string(),
            capabilities: vec!["rust".to_string()],
            required_capabilities: vec![],
            confidence: Some(80),
            queue_depth: 1,
            max_queue_depth: 10,
            child_count: 0,
            max_children: 7,
            current_depth: 0,
            tokens_used: Some(1000),
            max_tokens: Some(10000),
            primary_phase: Some("implementation".to_string()),
        }
    }

    #[test]
    fn test_acceptance_criteria_contribution_caps_at_fifteen() {
        let mut task = base_task();
        task.acceptance_criteria =
            (0..8).map(|i| format!("criterion {i}")).collect::<Vec<_>>();
        let capped = compute_complexity(&task);

        task.acceptance_criteria =
            (0..20).map(|i| format!("criterion {i}")).collect::<Vec<_>>();
        let also_capped = compute_complexity(&task);

        // 8 criteria already contribute the full +15 (8*2=16, capped to 15);
        // going to 20 must not add anything further.
        assert_eq!(capped, also_capped);
    }

    #[test]
    fn test_decide_produces_score_in_range() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let decision = decider.decide(&base_task(), &base_agent(), true);
        assert!(decision.score <= 100);
        assert!(decision.confidence <= 100);
    }

    #[test]
    fn test_hard_gate_blocks_when_task_has_children() {
        let decider = DelegationDecider::new(0, 3, 60_000);
        let mut task = base_task();
        task.has_children = true;
        let decision = decider.decide(&task, &base_agent(), true);
        assert!(!decision.should_delegate);
    }

    #[test]
    fn test_hard_gate_blocks_when_subtasks_below_two() {
        let decider = DelegationDecider::new(0, 3, 60_000);
        let mut task = base_task();
        task.acceptance_criteria = vec!["only one".to_string()];
        let decision = decider.decide(&task, &base_agent(), true);
        assert!(!decision.should_delegate);
    }

    #[test]
    fn test_hard_gate_blocks_at_max_depth() {
        let decider = DelegationDecider::new(0, 3, 60_000);
        let mut agent = base_agent();
        agent.current_depth = 3;
        let decision = decider.decide(&base_task(), &agent, true);
        assert!(!decision.should_delegate);
        assert!(decision.factors.depth_remaining <= 0);
    }

    #[test]
    fn test_cache_returns_same_decision_until_expiry() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let first = decider.decide(&base_task(), &base_agent(), false);
        let second = decider.decide(&base_task(), &base_agent(), false);
        assert_eq!(first.score, second.score);
        assert_eq!(decider.cache.len(), 1);
    }

    #[test]
    fn test_skip_cache_does_not_populate_cache() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        decider.decide(&base_task(), &base_agent(), true);
        assert!(decider.cache.is_empty());
    }

    #[test]
    fn test_pattern_selection_favors_parallel_for_many_subtasks() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let mut task = base_task();
        task.description = "Do these independent parallel things:\n- a\n- b\n- c\n".to_string();
        task.acceptance_criteria = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let decision = decider.decide(&task, &base_agent(), true);
        assert_eq!(decision.suggested_pattern, Pattern::Parallel);
    }

    #[test]
    fn test_pattern_selection_favors_sequential_with_dependencies() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let mut task = base_task();
        task.description = "Run this sequential pipeline step by step.".to_string();
        task.depends_on = vec!["t0".to_string(), "t-1".to_string()];
        let decision = decider.decide(&task, &base_agent(), true);
        assert_eq!(decision.suggested_pattern, Pattern::Sequential);
    }

    #[test]
    fn test_pattern_tie_break_favors_declaration_order() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let mut task = base_task();
        task.title = String::new();
        task.description = "Nothing relevant to any pattern keyword set.".to_string();
        task.depends_on = vec![];
        let decision = decider.decide(&task, &base_agent(), true);
        assert_eq!(decision.suggested_pattern, Pattern::Parallel);
    }

    #[test]
    fn test_low_confidence_nudges_debate_and_ensemble() {
        let decider = DelegationDecider::new(60, 3, 60_000);
        let task = base_task();
        let mut agent = base_agent();
        agent.confidence = Some(40);
        let decision_low = decider.decide(&task, &agent, true);
        agent.confidence = Some(90);
        let decision_high = decider.decide(&task, &agent, true);
        assert!(decision_low.factors.agent_confidence < decision_high.factors.agent_confidence);
    }
}
