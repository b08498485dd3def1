//! Lease table operations.
//!
//! Each method is a single statement; the caller decides which transaction
//! it runs in. Nothing here retries.

use crate::queries::{key_tuples, QueryFragments};
use crate::sql::{SqlExecutor, SqlTransaction, Statement};
use anyhow::{Context, Result};
use std::sync::Arc;
use trigger_core::ChangeRow;

#[derive(Debug, Clone)]
pub struct LeaseStore {
    fragments: Arc<QueryFragments>,
    lease_interval_secs: i64,
}

impl LeaseStore {
    pub fn new(fragments: Arc<QueryFragments>, lease_interval_secs: u64) -> Self {
        Self {
            fragments,
            lease_interval_secs: i64::try_from(lease_interval_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn fragments(&self) -> &QueryFragments {
        &self.fragments
    }

    /// Create the lease table if it does not exist yet.
    pub async fn ensure_table(&self, tx: &mut dyn SqlTransaction) -> Result<()> {
        tx.execute_batch(&self.fragments.create_lease_table())
            .await
            .with_context(|| format!("Failed to create lease table {}", self.fragments.lease_table))
    }

    /// Insert or take over leases for `rows`, bumping their attempt counts.
    pub async fn acquire(&self, tx: &mut dyn SqlTransaction, rows: &[ChangeRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        tx.execute(
            &Statement::new(self.fragments.acquire_leases())
                .bind(key_tuples(rows))
                .bind(self.lease_interval_secs),
        )
        .await
    }

    /// Extend leases still held at the rows' versions.
    pub async fn renew(&self, executor: &dyn SqlExecutor, rows: &[ChangeRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        executor
            .execute(
                &Statement::new(self.fragments.renew_leases())
                    .bind(key_tuples(rows))
                    .bind(self.lease_interval_secs),
            )
            .await
    }

    /// Mark `rows` as processed at their versions.
    pub async fn release(&self, tx: &mut dyn SqlTransaction, rows: &[ChangeRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        tx.execute(&Statement::new(self.fragments.release_leases()).bind(key_tuples(rows)))
            .await
    }

    /// Drop leases the watermark has moved past.
    pub async fn delete_processed(&self, tx: &mut dyn SqlTransaction, upto_version: i64) -> Result<u64> {
        tx.execute(&Statement::new(self.fragments.delete_processed_leases()).bind(upto_version))
            .await
    }
}
