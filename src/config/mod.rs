//! Settings layering for the CLI.
//!
//! Defaults, then an optional TOML file, then `Sql_Trigger_*` environment
//! variables, then explicit command-line flags. The result is validated once.

pub mod duration;

pub use duration::parse_duration;

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use trigger_core::TriggerConfig;

/// Settings given explicitly on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub max_batch_size: Option<usize>,
    pub polling_interval: Option<Duration>,
    pub max_changes_per_worker: Option<u64>,
    pub lease_interval: Option<Duration>,
    pub max_attempt_count: Option<u32>,
}

impl ConfigOverrides {
    fn apply(&self, mut config: TriggerConfig) -> TriggerConfig {
        if let Some(value) = self.max_batch_size {
            config.max_batch_size = value;
        }
        if let Some(value) = self.polling_interval {
            config.polling_interval_ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(value) = self.max_changes_per_worker {
            config.max_changes_per_worker = value;
        }
        if let Some(value) = self.lease_interval {
            config.lease_interval_secs = value.as_secs();
        }
        if let Some(value) = self.max_attempt_count {
            config.max_attempt_count = value;
        }
        config
    }
}

/// Read a TOML file whose top-level keys are [`TriggerConfig`] fields.
pub fn load_config_file(path: &Path) -> Result<TriggerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Build the effective configuration, reading the environment through `env`.
pub fn resolve_config<F>(
    path: Option<&Path>,
    overrides: &ConfigOverrides,
    env: F,
) -> Result<TriggerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config = match path {
        Some(path) => load_config_file(path)?,
        None => TriggerConfig::default(),
    };
    let config = overrides.apply(config.with_overrides(env)?);
    config.validate()?;
    tracing::debug!("Effective trigger configuration: {config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_win_over_environment() {
        let overrides = ConfigOverrides {
            max_batch_size: Some(7),
            polling_interval: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        let config = resolve_config(None, &overrides, |key| match key {
            "Sql_Trigger_MaxBatchSize" => Some("50".to_string()),
            "Sql_Trigger_MaxChangesPerWorker" => Some("20".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_batch_size, 7);
        assert_eq!(config.polling_interval_ms, 250);
        assert_eq!(config.max_changes_per_worker, 20);
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let overrides = ConfigOverrides {
            lease_interval: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        assert!(resolve_config(None, &overrides, |_| None).is_err());
    }
}
