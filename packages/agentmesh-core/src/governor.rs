//! Rate-Limit Governor (Component B): rolling-window admission control for
//! outbound model calls. Mirrors the window-and-threshold config shape of
//! `budget::BudgetConfig`'s preset constructors, generalized from a single
//! budget ceiling to rolling request/token windows with a tiered admission
//! verdict rather than a bare allow/deny.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A single rolling window's counters, reset in place once `reset_at` has
/// passed — lazily advanced by the next call that touches it, never by a
/// background timer (§4.6 describes this as advancing "before any external
/// call").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub calls: u64,
    pub tokens: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitWindow {
    fn new(now: DateTime<Utc>, span: Duration) -> Self {
        Self {
            calls: 0,
            tokens: 0,
            reset_at: now + span,
        }
    }

    fn advance(&mut self, now: DateTime<Utc>, span: Duration) {
        if now >= self.reset_at {
            self.calls = 0;
            self.tokens = 0;
            self.reset_at = now + span;
        }
    }
}

/// Per-window request/token ceilings. `Custom` carries explicit values;
/// named tiers supply a fixed preset, the way `BudgetConfig::enterprise()`
/// supplies fixed spend ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitTier {
    Free,
    Pro,
    Team,
    Enterprise,
    Custom,
}

impl GovernorLimits {
    pub fn for_tier(tier: RateLimitTier) -> Self {
        match tier {
            RateLimitTier::Free => Self {
                requests_per_minute: 5,
                requests_per_hour: 100,
                requests_per_day: 200,
                tokens_per_minute: 20_000,
                tokens_per_day: 200_000,
            },
            RateLimitTier::Pro => Self {
                requests_per_minute: 50,
                requests_per_hour: 1_000,
                requests_per_day: 1_000,
                tokens_per_minute: 200_000,
                tokens_per_day: 4_000_000,
            },
            RateLimitTier::Team => Self {
                requests_per_minute: 100,
                requests_per_hour: 3_000,
                requests_per_day: 10_000,
                tokens_per_minute: 500_000,
                tokens_per_day: 20_000_000,
            },
            RateLimitTier::Enterprise => Self {
                requests_per_minute: 500,
                requests_per_hour: 20_000,
                requests_per_day: 100_000,
                tokens_per_minute: 2_000_000,
                tokens_per_day: 200_000_000,
            },
            RateLimitTier::Custom => Self {
                requests_per_minute: u64::MAX,
                requests_per_hour: u64::MAX,
                requests_per_day: u64::MAX,
                tokens_per_minute: u64::MAX,
                tokens_per_day: u64::MAX,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Ok,
    Warning,
    Critical,
    Emergency,
}

impl SafetyLevel {
    pub fn action(&self) -> &'static str {
        match self {
            SafetyLevel::Ok => "proceed",
            SafetyLevel::Warning => "proceed-with-caution",
            SafetyLevel::Critical => "wrap-up-now",
            SafetyLevel::Emergency => "halt-immediately",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub safe: bool,
    pub level: SafetyLevel,
    pub action: &'static str,
    pub utilization: f64,
    pub limiting_factor: &'static str,
    pub time_to_reset_ms: i64,
}

struct GovernorState {
    minute: RateLimitWindow,
    hour: RateLimitWindow,
    day: RateLimitWindow,
}

/// Rolling-window admission gate in front of every outbound model call.
pub struct RateLimitGovernor {
    limits: GovernorLimits,
    warning_threshold: f64,
    critical_threshold: f64,
    emergency_threshold: f64,
    state: Mutex<GovernorState>,
}

impl RateLimitGovernor {
    pub fn new(limits: GovernorLimits) -> Self {
        Self::with_thresholds(limits, 0.80, 0.90, 0.95)
    }

    pub fn for_tier(tier: RateLimitTier) -> Self {
        Self::new(GovernorLimits::for_tier(tier))
    }

    pub fn with_thresholds(
        limits: GovernorLimits,
        warning_threshold: f64,
        critical_threshold: f64,
        emergency_threshold: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            limits,
            warning_threshold,
            critical_threshold,
            emergency_threshold,
            state: Mutex::new(GovernorState {
                minute: RateLimitWindow::new(now, Duration::minutes(1)),
                hour: RateLimitWindow::new(now, Duration::hours(1)),
                day: RateLimitWindow::new(now, Duration::days(1)),
            }),
        }
    }

    fn advance_all(state: &mut GovernorState, now: DateTime<Utc>) {
        state.minute.advance(now, Duration::minutes(1));
        state.hour.advance(now, Duration::hours(1));
        state.day.advance(now, Duration::days(1));
    }

    fn level_for(&self, utilization: f64) -> SafetyLevel {
        if utilization >= self.emergency_threshold {
            SafetyLevel::Emergency
        } else if utilization >= self.critical_threshold {
            SafetyLevel::Critical
        } else if utilization >= self.warning_threshold {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Ok
        }
    }

    /// Evaluate whether a call estimated to cost `estimated_tokens` is safe
    /// to make right now, without recording it.
    pub fn can_make_call(&self, estimated_tokens: u64) -> AdmissionDecision {
        let now = Utc::now();
        let mut state = self.state.lock();
        Self::advance_all(&mut state, now);

        let constraints: [(&str, f64, DateTime<Utc>); 5] = [
            (
                "requests_per_minute",
                (state.minute.calls + 1) as f64 / self.limits.requests_per_minute.max(1) as f64,
                state.minute.reset_at,
            ),
            (
                "requests_per_hour",
                (state.hour.calls + 1) as f64 / self.limits.requests_per_hour.max(1) as f64,
                state.hour.reset_at,
            ),
            (
                "requests_per_day",
                (state.day.calls + 1) as f64 / self.limits.requests_per_day.max(1) as f64,
                state.day.reset_at,
            ),
            (
                "tokens_per_minute",
                (state.minute.tokens + estimated_tokens) as f64
                    / self.limits.tokens_per_minute.max(1) as f64,
                state.minute.reset_at,
            ),
            (
                "tokens_per_day",
                (state.day.tokens + estimated_tokens) as f64
                    / self.limits.tokens_per_day.max(1) as f64,
                state.day.reset_at,
            ),
        ];

        let (limiting_factor, utilization, reset_at) = constraints
            .into_iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .expect("constraints is non-empty");

        let level = self.level_for(utilization);
        let time_to_reset_ms = match level {
            SafetyLevel::Ok | SafetyLevel::Warning => 0,
            _ => (reset_at - now).num_milliseconds().max(0),
        };

        AdmissionDecision {
            safe: !matches!(level, SafetyLevel::Critical | SafetyLevel::Emergency),
            level,
            action: level.action(),
            utilization,
            limiting_factor,
            time_to_reset_ms,
        }
    }

    /// Record a completed call, advancing windows first.
    pub fn record_call(&self, tokens: u64) {
        let now = Utc::now();
        let mut state = self.state.lock();
        Self::advance_all(&mut state, now);
        state.minute.calls += 1;
        state.hour.calls += 1;
        state.day.calls += 1;
        state.minute.tokens += tokens;
        state.hour.tokens += tokens;
        state.day.tokens += tokens;
    }

    /// Milliseconds until the next call is safe; 0 if already safe.
    pub fn time_until_available(&self) -> i64 {
        self.can_make_call(0).time_to_reset_ms
    }

    /// Guard used by callers that must hard-fail rather than degrade when
    /// admission is refused, surfacing `CoreError::RateLimitExceeded`.
    pub fn ensure_admitted(&self, estimated_tokens: u64) -> Result<AdmissionDecision> {
        let decision = self.can_make_call(estimated_tokens);
        if decision.safe {
            Ok(decision)
        } else {
            Err(CoreError::RateLimitExceeded {
                level: format!("{:?}", decision.level).to_lowercase(),
                message: format!(
                    "{} at {:.0}% utilization ({})",
                    decision.action,
                    decision.utilization * 100.0,
                    decision.limiting_factor
                ),
            })
        }
    }
}
