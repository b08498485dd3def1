//! Backlog metrics for scale decisions.

use crate::store::ChangeTrackingStore;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A point-in-time sample of a trigger's backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleMetrics {
    pub unprocessed_change_count: i64,
    pub timestamp: DateTime<Utc>,
}

/// Read-only view of how far behind a trigger is.
#[derive(Clone)]
pub struct ScaleMetricsProvider {
    store: Arc<dyn ChangeTrackingStore>,
    max_changes_per_worker: u64,
}

impl ScaleMetricsProvider {
    pub fn new(store: Arc<dyn ChangeTrackingStore>, max_changes_per_worker: u64) -> Self {
        Self {
            store,
            max_changes_per_worker,
        }
    }

    pub async fn unprocessed_change_count(&self) -> Result<i64> {
        self.store.unprocessed_change_count().await
    }

    pub async fn metrics(&self) -> Result<ScaleMetrics> {
        let unprocessed_change_count = self.unprocessed_change_count().await?;
        debug!(
            "Table {} has {unprocessed_change_count} unprocessed changes",
            self.store.table().name
        );
        Ok(ScaleMetrics {
            unprocessed_change_count,
            timestamp: Utc::now(),
        })
    }

    /// Workers needed for the sampled backlog at the configured
    /// `max_changes_per_worker`.
    pub fn target_worker_count(&self, metrics: &ScaleMetrics) -> u64 {
        // max_changes_per_worker is validated to be at least 1 at startup
        target_worker_count(
            metrics.unprocessed_change_count,
            self.max_changes_per_worker.max(1),
        )
        .unwrap_or_default()
    }
}

/// `ceil(unprocessed / concurrency)`, with a negative backlog counted as zero.
pub fn target_worker_count(unprocessed_change_count: i64, concurrency: u64) -> Result<u64> {
    if concurrency < 1 {
        bail!("Concurrency must be at least 1, got {concurrency}");
    }
    let backlog = u64::try_from(unprocessed_change_count).unwrap_or(0);
    Ok(backlog.div_ceil(concurrency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_worker_count_rounds_up() {
        assert_eq!(target_worker_count(0, 1000).unwrap(), 0);
        assert_eq!(target_worker_count(1, 1000).unwrap(), 1);
        assert_eq!(target_worker_count(1000, 1000).unwrap(), 1);
        assert_eq!(target_worker_count(1001, 1000).unwrap(), 2);
        assert_eq!(target_worker_count(-5, 10).unwrap(), 0);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        assert!(target_worker_count(10, 0).is_err());
    }
}
