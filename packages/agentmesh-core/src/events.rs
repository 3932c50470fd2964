//! Event surface for every service in the core.
//!
//! The source system emits events as per-component callbacks; this is
//! rendered here as a single closed [`Event`] enum broadcast over a
//! `tokio::sync::broadcast` channel, one per service instance, exactly as
//! §9's "Rust rendering" design note specifies. `send` does not await, so
//! emission stays synchronous with the mutation it describes: by the time a
//! mutating method returns, every current subscriber has the event queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// The default channel capacity for a fresh [`EventBus`]. Slow subscribers
/// that fall behind this many events receive `RecvError::Lagged` rather than
/// blocking emitters — emission must never suspend on a subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Every event name the coordination spec lists as contract (§6), carrying
/// the fields a dashboard or test harness needs to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    SessionRegistered { session_id: i64, project_path: String, parent_id: Option<i64> },
    SessionHeartbeat { session_id: i64, at: DateTime<Utc> },
    SessionDeregistered { session_id: i64 },
    SessionExpired { session_id: i64 },
    SessionChildAdded { parent_id: i64, child_id: i64 },
    SessionRollupUpdated { session_id: i64, total_tokens: i64, total_cost: f64 },

    LockAcquired { resource: String, session_id: i64 },
    LockExtended { resource: String, session_id: i64, refresh_count: u32 },
    LockRefreshed { resource: String, session_id: i64 },
    LockReleased { resource: String, session_id: i64 },
    LockExpired { resource: String, previous_holder: i64 },
    LocksCleanup { removed: u64 },

    ChangeRecorded { change_id: i64, resource: String },
    ChangeApplied { change_id: i64 },
    JournalPruned { removed: u64 },

    ConflictDetected { conflict_id: i64, resource: String },
    ConflictResolved { conflict_id: i64 },
    ConflictsPruned { removed: u64 },

    StateChanged { agent_id: String, from: String, to: String, version: i64 },
    AgentRegistered { agent_id: String },
    AgentUnregistered { agent_id: String },

    DelegationAdded { session_id: i64, delegation_id: String },
    DelegationUpdated { session_id: i64, delegation_id: String, status: String },
    DelegationRetry { session_id: i64, delegation_id: String },
    DelegationTimeout { session_id: i64, delegation_id: String },
    DelegationStarted { session_id: i64, delegation_id: String },
    DelegationCompleted { session_id: i64, delegation_id: String },

    MetricsSnapshot { snapshot_id: u64 },
    MetricsReset,
    MetricsPersist,
    MetricsClosed,

    PersistenceFallback { reason: String },
    PersistenceReconnected,
    PersistenceRecoveryAttempt { attempt: u32 },
    PersistenceRecoveryExhausted,

    ShadowEnabled,
    ShadowDisabled,
}

/// A per-service broadcast channel. Cloning an `EventBus` clones the sender
/// handle, not the channel — all clones publish to and can spawn subscribers
/// of the same underlying broadcast.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to this bus's events from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event. A send with no subscribers is not an error — it simply
    /// has no effect, matching the teacher's fire-and-forget tracing calls.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::LockAcquired {
            resource: "tasks.json".to_string(),
            session_id: 1,
        });

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::LockAcquired { session_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::MetricsReset);
    }

    #[tokio::test]
    async fn test_two_subscribers_see_same_ordering() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::SessionExpired { session_id: 1 });
        bus.emit(Event::SessionExpired { session_id: 2 });

        let a1 = rx1.recv().await.unwrap();
        let a2 = rx1.recv().await.unwrap();
        let b1 = rx2.recv().await.unwrap();
        let b2 = rx2.recv().await.unwrap();

        assert!(matches!(a1, Event::SessionExpired { session_id: 1 }));
        assert!(matches!(a2, Event::SessionExpired { session_id: 2 }));
        assert!(matches!(b1, Event::SessionExpired { session_id: 1 }));
        assert!(matches!(b2, Event::SessionExpired { session_id: 2 }));
    }
}
