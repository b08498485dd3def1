//! Per (function, table) watermark in `sql_trigger.global_state`.

use crate::lease_store::LeaseStore;
use crate::sql::{SqlTransaction, Statement};
use anyhow::{anyhow, Result};
use tracing::debug;
use trigger_core::UserFunctionId;

pub const GLOBAL_STATE_TABLE: &str = "sql_trigger.global_state";

const CREATE_GLOBAL_STATE: &str = "CREATE TABLE IF NOT EXISTS sql_trigger.global_state (
    user_function_id text NOT NULL,
    user_table_id bigint NOT NULL,
    last_sync_version bigint NOT NULL,
    last_access_time timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (user_function_id, user_table_id)
)";

const ENSURE_ROW: &str = "INSERT INTO sql_trigger.global_state
    (user_function_id, user_table_id, last_sync_version, last_access_time)
VALUES ($1::text, $2::bigint, $3::bigint, now())
ON CONFLICT (user_function_id, user_table_id) DO NOTHING";

const CATCH_UP: &str = "UPDATE sql_trigger.global_state g
SET last_sync_version = t.min_valid_version, last_access_time = now()
FROM sql_trigger.change_tracking_tables t
WHERE t.table_id = g.user_table_id
  AND g.user_function_id = $1::text
  AND g.user_table_id = $2::bigint
  AND g.last_sync_version < t.min_valid_version";

const SELECT_WATERMARK: &str = "SELECT last_sync_version FROM sql_trigger.global_state
WHERE user_function_id = $1::text AND user_table_id = $2::bigint";

const ADVANCE: &str = "UPDATE sql_trigger.global_state
SET last_sync_version = $3::bigint, last_access_time = now()
WHERE user_function_id = $1::text
  AND user_table_id = $2::bigint
  AND last_sync_version < $3::bigint";

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    function_id: UserFunctionId,
    table_id: i64,
    max_attempt_count: i64,
}

impl WatermarkStore {
    pub fn new(function_id: UserFunctionId, table_id: i64, max_attempt_count: u32) -> Self {
        Self {
            function_id,
            table_id,
            max_attempt_count: max_attempt_count.into(),
        }
    }

    fn keyed(&self, sql: &str) -> Statement {
        Statement::new(sql)
            .bind(self.function_id.as_str())
            .bind(self.table_id)
    }

    /// Create the state table and seed the watermark at `min_valid_version`
    /// unless a row already exists.
    pub async fn ensure_row(&self, tx: &mut dyn SqlTransaction, min_valid_version: i64) -> Result<()> {
        tx.execute_batch(CREATE_GLOBAL_STATE).await?;
        let inserted = tx.execute(&self.keyed(ENSURE_ROW).bind(min_valid_version)).await?;
        if inserted > 0 {
            debug!(
                "Initialized watermark of {} for table {} at version {min_valid_version}",
                self.function_id, self.table_id
            );
        }
        Ok(())
    }

    /// Raise a watermark that fell below the feed's minimum valid version.
    pub async fn catch_up(&self, tx: &mut dyn SqlTransaction) -> Result<bool> {
        let updated = tx.execute(&self.keyed(CATCH_UP)).await?;
        Ok(updated > 0)
    }

    pub async fn current(&self, tx: &mut dyn SqlTransaction) -> Result<i64> {
        let rows = tx.query(&self.keyed(SELECT_WATERMARK)).await?;
        let row = rows.first().ok_or_else(|| {
            anyhow!(
                "Missing watermark for function {} on table {}",
                self.function_id,
                self.table_id
            )
        })?;
        row.try_i64("last_sync_version")
    }

    /// Move the watermark to `candidate` if every change up to it has been
    /// released or dead-lettered, then drop the leases it covers.
    pub async fn try_advance(
        &self,
        tx: &mut dyn SqlTransaction,
        leases: &LeaseStore,
        candidate: i64,
    ) -> Result<bool> {
        let watermark = self.current(tx).await?;
        if candidate <= watermark {
            return Ok(false);
        }

        let rows = tx
            .query(
                &Statement::new(leases.fragments().count_unresolved_changes())
                    .bind(watermark)
                    .bind(candidate)
                    .bind(self.max_attempt_count),
            )
            .await?;
        let unresolved = match rows.first() {
            Some(row) => row.try_i64("unresolved")?,
            None => 0,
        };
        if unresolved > 0 {
            debug!(
                "Watermark stays at {watermark}: {unresolved} changes up to {candidate} are unresolved"
            );
            return Ok(false);
        }

        let advanced = tx.execute(&self.keyed(ADVANCE).bind(candidate)).await?;
        if advanced == 0 {
            return Ok(false);
        }
        leases.delete_processed(tx, candidate).await?;
        debug!("Advanced watermark from {watermark} to {candidate}");
        Ok(true)
    }
}
