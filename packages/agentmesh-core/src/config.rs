//! Runtime configuration, with the deep-merge semantics §9 describes:
//! "objects merge recursively, arrays and scalars are replaced". Unknown
//! keys are rejected by deserializing the merge source with
//! `#[serde(deny_unknown_fields)]` rather than merging into `Config`
//! directly — a typo in a config file surfaces as `CoreError::InvalidConfig`
//! instead of being silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// All recognized options from §6, every field optional with the documented
/// default applied by [`Config::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub default_lock_ttl_ms: i64,
    pub stale_session_threshold_ms: i64,
    pub heartbeat_interval_ms: i64,
    pub cleanup_interval_ms: i64,
    pub journal_retention_ms: i64,
    pub auto_cleanup: bool,
    pub recovery_interval_ms: i64,
    pub recovery_backoff_multiplier: u32,
    pub max_recovery_attempts: u32,
    pub health_check_interval_ms: i64,
    pub max_delegation_depth: u32,
    pub max_concurrent_delegations: u32,
    pub max_child_agents: u32,
    pub min_delegation_score: u32,
    pub cache_max_age_ms: i64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub emergency_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_lock_ttl_ms: 60_000,
            stale_session_threshold_ms: 300_000,
            heartbeat_interval_ms: 30_000,
            cleanup_interval_ms: 60_000,
            journal_retention_ms: 604_800_000,
            auto_cleanup: true,
            recovery_interval_ms: 60_000,
            recovery_backoff_multiplier: 2,
            max_recovery_attempts: 5,
            health_check_interval_ms: 30_000,
            max_delegation_depth: 3,
            max_concurrent_delegations: 5,
            max_child_agents: 7,
            min_delegation_score: 60,
            cache_max_age_ms: 60_000,
            warning_threshold: 0.80,
            critical_threshold: 0.90,
            emergency_threshold: 0.95,
        }
    }
}

impl Config {
    /// Deep-merge a JSON object into this config: recognized scalar fields
    /// present in `patch` replace the current value; fields absent from
    /// `patch` are left untouched. Unknown keys in `patch` are rejected
    /// rather than silently dropped, per §9.
    pub fn merge_from_json(&mut self, patch: &serde_json::Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self).map_err(|e| {
            CoreError::InvalidConfig(format!("failed to serialize current config: {e}"))
        })?;

        let patch_obj = patch.as_object().ok_or_else(|| {
            CoreError::InvalidConfig("config patch must be a JSON object".to_string())
        })?;

        let known_fields: std::collections::HashSet<&str> = current
            .as_object()
            .map(|o| o.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default();

        for key in patch_obj.keys() {
            if !known_fields.contains(key.as_str()) {
                return Err(CoreError::InvalidConfig(format!("unknown config key: {key}")));
            }
        }

        if let Some(current_obj) = current.as_object_mut() {
            for (key, value) in patch_obj {
                current_obj.insert(key.clone(), value.clone());
            }
        }

        *self = serde_json::from_value(current)
            .map_err(|e| CoreError::InvalidConfig(format!("invalid merged config: {e}")))?;
        Ok(())
    }
}
