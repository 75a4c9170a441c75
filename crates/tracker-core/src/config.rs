//! Tracker configuration with defaults and validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration shared by the storage, integrity and CLI layers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub storage: StorageConfig,
    pub health: HealthConfig,
    pub validation: ValidationConfig,
    pub rollback: RollbackConfig,
}

/// Storage backend limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Byte budget of the store (keys + values), mirroring a browser quota.
    pub quota_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Health monitor cadence, history limits and thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between scheduled checks.
    pub interval_secs: u64,
    /// Reports retained in memory.
    pub memory_history: usize,
    /// Reports retained in storage.
    pub persisted_history: usize,
    /// Persist history every N checks (0 disables persistence).
    pub persist_every: u32,
    /// Quota usage ratio that degrades storage to warning.
    pub storage_warning_ratio: f64,
    /// Quota usage ratio that makes storage critical.
    pub storage_critical_ratio: f64,
    /// A full check slower than this is reported as a performance warning.
    pub slow_check_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            memory_history: 100,
            persisted_history: 50,
            persist_every: 1,
            storage_warning_ratio: 0.8,
            storage_critical_ratio: 0.95,
            slow_check_ms: 250,
        }
    }
}

/// Validator thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Cross-reference differences at or above this count are errors, below are warnings.
    pub cross_reference_error_threshold: usize,
    /// Orphaned entries at or above this count are errors.
    pub orphan_error_threshold: usize,
    /// Minimum validation score for a migration to be kept.
    pub migration_min_score: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cross_reference_error_threshold: 3,
            orphan_error_threshold: 5,
            migration_min_score: 80.0,
        }
    }
}

/// Rollback manager retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Rollback operations kept in the audit history.
    pub history_cap: usize,
    /// Emergency backups kept (newest last).
    pub emergency_backup_cap: usize,
    /// Capture an emergency checkpoint before each rollback.
    pub checkpoint_before: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            history_cap: 20,
            emergency_backup_cap: 5,
            checkpoint_before: true,
        }
    }
}

impl TrackerConfig {
    /// Parse YAML; missing sections fall back to defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: TrackerConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        if h.interval_secs == 0 {
            return Err(ConfigError::Invalid("health.interval_secs must be > 0".into()));
        }
        if h.memory_history == 0 {
            return Err(ConfigError::Invalid("health.memory_history must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&h.storage_warning_ratio)
            || !(0.0..=1.0).contains(&h.storage_critical_ratio)
            || h.storage_warning_ratio > h.storage_critical_ratio
        {
            return Err(ConfigError::Invalid(
                "health storage ratios must satisfy 0 <= warning <= critical <= 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.validation.migration_min_score) {
            return Err(ConfigError::Invalid(
                "validation.migration_min_score must be within [0,100]".into(),
            ));
        }
        if self.validation.cross_reference_error_threshold == 0 {
            return Err(ConfigError::Invalid(
                "validation.cross_reference_error_threshold must be > 0".into(),
            ));
        }
        if self.storage.quota_bytes == 0 {
            return Err(ConfigError::Invalid("storage.quota_bytes must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = TrackerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.health.interval_secs, 30);
        assert_eq!(cfg.health.memory_history, 100);
        assert_eq!(cfg.health.persisted_history, 50);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = TrackerConfig::from_yaml_str("health:\n  interval_secs: 5\n").unwrap();
        assert_eq!(cfg.health.interval_secs, 5);
        assert_eq!(cfg.health.memory_history, 100);
        assert_eq!(cfg.rollback.history_cap, 20);
    }

    #[test]
    fn inverted_ratios_rejected() {
        let yaml = "health:\n  storage_warning_ratio: 0.9\n  storage_critical_ratio: 0.5\n";
        assert!(matches!(
            TrackerConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        assert!(matches!(
            TrackerConfig::from_yaml_str("health: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
