//! Storage seam for the lease protocol.
//!
//! A backend owns the lease table and the watermark for one
//! (function, table) pair. The monitor only ever sees these two traits:
//! - `MemoryDatabase` in this crate (tests, embedding)
//! - `PostgresBackend` in the `sql-trigger-postgresql` crate

use crate::config::TriggerConfig;
use crate::error::TriggerError;
use crate::types::{ChangeRow, TriggerTarget, WatchedTable};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Opens a [`ChangeTrackingStore`] for a trigger target.
#[async_trait]
pub trait ChangeTrackingBackend: Send + Sync {
    /// Resolve the watched table, create the lease table if needed and make
    /// sure a watermark row exists.
    ///
    /// Every failure here is fatal to starting the trigger.
    async fn open(
        &self,
        target: &TriggerTarget,
        config: &TriggerConfig,
    ) -> std::result::Result<Arc<dyn ChangeTrackingStore>, TriggerError>;
}

/// Per-cycle lease and watermark operations.
///
/// Each method is one short transaction. None of them retry internally.
#[async_trait]
pub trait ChangeTrackingStore: Send + Sync {
    fn table(&self) -> &WatchedTable;

    /// Fetch up to `max_batch_size` eligible changes past the watermark, in
    /// version order, and acquire leases on all of them in the same
    /// transaction. A change is eligible when its lease is free (released for
    /// an older version) or expired, and its attempt count is below the limit.
    async fn poll_changes(&self) -> Result<Vec<ChangeRow>>;

    /// Extend the leases of rows still leased at the given versions.
    /// Returns how many leases were extended; lost leases are skipped.
    async fn renew_leases(&self, rows: &[ChangeRow]) -> Result<u64>;

    /// Release the leases of a successfully processed batch, then try to
    /// advance the watermark to `candidate_version`, all in one transaction.
    /// Returns whether the watermark moved.
    async fn release_leases(&self, rows: &[ChangeRow], candidate_version: i64) -> Result<bool>;

    /// Number of changes past the watermark that still need processing.
    async fn unprocessed_change_count(&self) -> Result<i64>;
}
