//! agentmesh-core — Components B through F of the multi-session agent
//! coordination core: the Rate-Limit Governor, the Hierarchical Agent State
//! Machine, the Session Registry (with its persistence fallback state
//! machine), the Delegation Decider and Pattern Selector, and the Metrics
//! Aggregator.
//!
//! Depends on `agentmesh-store` through its `CoordinationStore` port trait
//! only, so the Registry can run store-backed or memory-only.

pub mod agentmesh;
pub mod config;
pub mod coordination;
pub mod delegation;
pub mod error;
pub mod events;
pub mod governor;
pub mod metrics;
pub mod session;
pub mod state_machine;

pub use agentmesh::{AgentMesh, MaintenanceReport};
pub use config::Config;
pub use coordination::CoordinationService;
pub use delegation::{
    AgentView, DelegationDecider, DelegationDecision, DelegationFactors, DelegationWeights,
    Pattern, Task,
};
pub use error::{CoreError, Result};
pub use events::{Event, EventBus};
pub use governor::{
    AdmissionDecision, GovernorLimits, RateLimitGovernor, RateLimitTier, SafetyLevel,
};
pub use metrics::{Histogram, HistogramSummary, MetricsAggregator, MetricsSnapshot};
pub use session::{
    AlertEntry, Delegation as SessionDelegation, DelegationStatus, FallbackReason,
    FallbackState, HierarchyView, InitialSession, RecoveryStrategy, RollupMetrics, Session,
    SessionRegistry, SessionStatus, SessionUpdate,
};
pub use state_machine::{
    AgentEvent, AgentState, AgentStateEntry, AgentStateMachine, AggregateState,
    FamilyTransitionOptions, StateHistoryEntry,
};
