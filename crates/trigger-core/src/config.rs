//! Trigger configuration.
//!
//! A [`TriggerConfig`] is built once (defaults, then a config file, then
//! environment overrides) and passed by value into every component that
//! needs it. Nothing reads settings from global state after startup.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;
pub const MIN_POLLING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_CHANGES_PER_WORKER: u64 = 1000;
pub const DEFAULT_LEASE_INTERVAL_SECS: u64 = 30;
pub const MIN_LEASE_INTERVAL_SECS: u64 = 2;
/// One day.
pub const MAX_LEASE_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_MAX_ATTEMPT_COUNT: u32 = 5;
pub const DEFAULT_MAX_LEASE_RENEWAL_COUNT: u32 = 5;

/// Environment key for the maximum number of changes per batch.
pub const MAX_BATCH_SIZE_KEY: &str = "Sql_Trigger_MaxBatchSize";
/// Older name for [`MAX_BATCH_SIZE_KEY`], honoured when the new key is unset.
pub const LEGACY_BATCH_SIZE_KEY: &str = "Sql_Trigger_BatchSize";
pub const POLLING_INTERVAL_KEY: &str = "Sql_Trigger_PollingIntervalMs";
pub const MAX_CHANGES_PER_WORKER_KEY: &str = "Sql_Trigger_MaxChangesPerWorker";

/// Settings for one change monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Maximum number of changes fetched and delivered per batch
    pub max_batch_size: usize,

    /// Delay between polls when the previous poll did not fill a batch
    pub polling_interval_ms: u64,

    /// Backlog one worker is expected to absorb, used for scale decisions
    pub max_changes_per_worker: u64,

    /// How long an acquired lease stays valid without renewal
    pub lease_interval_secs: u64,

    /// Attempts allowed per change before it is dead-lettered
    pub max_attempt_count: u32,

    /// Renewal cycles an execution may span before it is cancelled as stuck
    pub max_lease_renewal_count: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            polling_interval_ms: DEFAULT_POLLING_INTERVAL_MS,
            max_changes_per_worker: DEFAULT_MAX_CHANGES_PER_WORKER,
            lease_interval_secs: DEFAULT_LEASE_INTERVAL_SECS,
            max_attempt_count: DEFAULT_MAX_ATTEMPT_COUNT,
            max_lease_renewal_count: DEFAULT_MAX_LEASE_RENEWAL_COUNT,
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_minimum("MaxBatchSize", self.max_batch_size as u64, 1)?;
        check_minimum(
            "PollingIntervalMs",
            self.polling_interval_ms,
            MIN_POLLING_INTERVAL_MS,
        )?;
        check_minimum("MaxChangesPerWorker", self.max_changes_per_worker, 1)?;
        check_minimum(
            "LeaseIntervalSeconds",
            self.lease_interval_secs,
            MIN_LEASE_INTERVAL_SECS,
        )?;
        if self.lease_interval_secs > MAX_LEASE_INTERVAL_SECS {
            return Err(ConfigError::AboveMaximum {
                setting: "LeaseIntervalSeconds",
                value: self.lease_interval_secs,
                maximum: MAX_LEASE_INTERVAL_SECS,
            });
        }
        check_minimum("MaxAttemptCount", self.max_attempt_count as u64, 1)?;
        check_minimum(
            "MaxLeaseRenewalCount",
            self.max_lease_renewal_count as u64,
            1,
        )?;
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn lease_interval(&self) -> Duration {
        Duration::from_secs(self.lease_interval_secs)
    }

    /// Cadence of the renewal loop: half the lease interval, so a lease is
    /// extended at least once before it can expire.
    pub fn lease_renewal_interval(&self) -> Duration {
        self.lease_interval() / 2
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// `Sql_Trigger_MaxBatchSize` wins over the legacy `Sql_Trigger_BatchSize`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let batch_size = match lookup(MAX_BATCH_SIZE_KEY) {
            Some(value) => Some((MAX_BATCH_SIZE_KEY, value)),
            None => lookup(LEGACY_BATCH_SIZE_KEY).map(|value| (LEGACY_BATCH_SIZE_KEY, value)),
        };
        if let Some((key, value)) = batch_size {
            self.max_batch_size = parse_override(key, &value)? as usize;
        }
        if let Some(value) = lookup(POLLING_INTERVAL_KEY) {
            self.polling_interval_ms = parse_override(POLLING_INTERVAL_KEY, &value)?;
        }
        if let Some(value) = lookup(MAX_CHANGES_PER_WORKER_KEY) {
            self.max_changes_per_worker = parse_override(MAX_CHANGES_PER_WORKER_KEY, &value)?;
        }
        Ok(self)
    }
}

fn check_minimum(setting: &'static str, value: u64, minimum: u64) -> Result<(), ConfigError> {
    if value < minimum {
        return Err(ConfigError::BelowMinimum {
            setting,
            value,
            minimum,
        });
    }
    Ok(())
}

fn parse_override(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
