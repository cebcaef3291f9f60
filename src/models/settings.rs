use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Per-pool rotation and health policy, hot-reloadable through [`PolicyUpdate`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPolicy {
    /// How often a consumer's endpoint is eligible for rotation
    pub interval_minutes: u32,
    /// Endpoints below this success rate are not selected
    pub min_success_rate: f64,
    /// Consecutive failures that force quarantine
    pub auto_quarantine_threshold: u32,
    /// Minimum quarantine age before a passing probe releases it (0 = never)
    pub quarantine_cooldown_minutes: u32,
    /// Bound on a single health probe
    pub probe_timeout_secs: u64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            min_success_rate: 0.8,
            auto_quarantine_threshold: 3,
            quarantine_cooldown_minutes: 30,
            probe_timeout_secs: 5,
        }
    }
}

impl RotationPolicy {
    /// Reject values that would silently degrade pool quality
    pub fn validate(&self) -> Result<()> {
        if self.interval_minutes == 0 {
            return Err(PoolError::InvalidConfig(
                "intervalMinutes must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(PoolError::InvalidConfig(
                "minSuccessRate must be within [0, 1]".into(),
            ));
        }
        if self.auto_quarantine_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "autoQuarantineThreshold must be at least 1".into(),
            ));
        }
        if !(1..=60).contains(&self.probe_timeout_secs) {
            return Err(PoolError::InvalidConfig(
                "probeTimeoutSecs must be between 1 and 60".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.interval_minutes))
    }

    pub fn quarantine_cooldown(&self) -> Option<chrono::Duration> {
        (self.quarantine_cooldown_minutes > 0)
            .then(|| chrono::Duration::minutes(i64::from(self.quarantine_cooldown_minutes)))
    }

    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_timeout_secs)
    }

    /// Apply a partial update, validating the merged result
    pub fn merged(&self, update: &PolicyUpdate) -> Result<Self> {
        let merged = Self {
            interval_minutes: update.interval_minutes.unwrap_or(self.interval_minutes),
            min_success_rate: update.min_success_rate.unwrap_or(self.min_success_rate),
            auto_quarantine_threshold: update
                .auto_quarantine_threshold
                .unwrap_or(self.auto_quarantine_threshold),
            quarantine_cooldown_minutes: update
                .quarantine_cooldown_minutes
                .unwrap_or(self.quarantine_cooldown_minutes),
            probe_timeout_secs: update.probe_timeout_secs.unwrap_or(self.probe_timeout_secs),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial policy update; absent fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
    pub interval_minutes: Option<u32>,
    pub min_success_rate: Option<f64>,
    pub auto_quarantine_threshold: Option<u32>,
    pub quarantine_cooldown_minutes: Option<u32>,
    pub probe_timeout_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = RotationPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.interval_minutes, 60);
        assert!((policy.min_success_rate - 0.8).abs() < f64::EPSILON);
        assert_eq!(policy.interval(), chrono::Duration::minutes(60));
        assert_eq!(policy.probe_timeout(), std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_merged_keeps_absent_fields() {
        let policy = RotationPolicy::default();
        let update = PolicyUpdate {
            interval_minutes: Some(15),
            ..PolicyUpdate::default()
        };

        let merged = policy.merged(&update).unwrap();
        assert_eq!(merged.interval_minutes, 15);
        assert_eq!(merged.min_success_rate, policy.min_success_rate);
        assert_eq!(merged.probe_timeout_secs, policy.probe_timeout_secs);
    }

    #[test]
    fn test_merged_rejects_invalid_values() {
        let policy = RotationPolicy::default();

        let bad_rate = PolicyUpdate {
            min_success_rate: Some(1.5),
            ..PolicyUpdate::default()
        };
        assert!(matches!(
            policy.merged(&bad_rate),
            Err(PoolError::InvalidConfig(_))
        ));

        let bad_interval = PolicyUpdate {
            interval_minutes: Some(0),
            ..PolicyUpdate::default()
        };
        assert!(policy.merged(&bad_interval).is_err());

        let bad_timeout = PolicyUpdate {
            probe_timeout_secs: Some(0),
            ..PolicyUpdate::default()
        };
        assert!(policy.merged(&bad_timeout).is_err());

        let bad_threshold = PolicyUpdate {
            auto_quarantine_threshold: Some(0),
            ..PolicyUpdate::default()
        };
        assert!(policy.merged(&bad_threshold).is_err());
    }

    #[test]
    fn test_cooldown_zero_disables_recovery() {
        let policy = RotationPolicy {
            quarantine_cooldown_minutes: 0,
            ..RotationPolicy::default()
        };
        assert!(policy.quarantine_cooldown().is_none());
    }

    #[test]
    fn test_policy_update_deserializes_partial_camel_case() {
        let update: PolicyUpdate =
            serde_json::from_str(r#"{"minSuccessRate":0.6,"intervalMinutes":30}"#).unwrap();
        assert_eq!(update.min_success_rate, Some(0.6));
        assert_eq!(update.interval_minutes, Some(30));
        assert!(update.probe_timeout_secs.is_none());
    }
}
