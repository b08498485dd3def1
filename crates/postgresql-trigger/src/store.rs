//! PostgreSQL implementation of the change-tracking storage seam.

use crate::change_tracking::{min_valid_version, SETUP_LOCK};
use crate::lease_store::LeaseStore;
use crate::queries::QueryFragments;
use crate::schema::resolve_table;
use crate::sql::{IsolationLevel, SqlExecutor, SqlRow, Statement};
use crate::watermark_store::WatermarkStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};
use trigger_core::{
    ChangeOperation, ChangeRow, ChangeTrackingBackend, ChangeTrackingStore, RowValues,
    TriggerConfig, TriggerError, TriggerTarget, UserFunctionId, WatchedTable,
};

/// Opens stores against one database.
#[derive(Clone)]
pub struct PostgresBackend {
    executor: Arc<dyn SqlExecutor>,
}

impl PostgresBackend {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn SqlExecutor> {
        &self.executor
    }
}

#[async_trait]
impl ChangeTrackingBackend for PostgresBackend {
    async fn open(
        &self,
        target: &TriggerTarget,
        config: &TriggerConfig,
    ) -> std::result::Result<Arc<dyn ChangeTrackingStore>, TriggerError> {
        let executor = self.executor.as_ref();
        let (table, table_name) = resolve_table(executor, &target.table_name).await?;
        let min_valid_version = min_valid_version(executor, &table).await?;

        let store = PostgresChangeTrackingStore::new(
            self.executor.clone(),
            target.function_id.clone(),
            QueryFragments::new(&table, &table_name, &target.function_id),
            table,
            config,
        );

        let mut tx = executor.begin(IsolationLevel::ReadCommitted).await?;
        tx.execute_batch(SETUP_LOCK).await?;
        store.leases.ensure_table(tx.as_mut()).await?;
        store
            .watermark
            .ensure_row(tx.as_mut(), min_valid_version)
            .await?;
        tx.commit().await?;

        info!(
            "Opened lease table {} for function {} on table {table_name}",
            store.leases.fragments().lease_table,
            target.function_id
        );
        Ok(Arc::new(store))
    }
}

/// Lease and watermark operations for one (function, table) pair.
pub struct PostgresChangeTrackingStore {
    executor: Arc<dyn SqlExecutor>,
    function_id: UserFunctionId,
    table: WatchedTable,
    leases: LeaseStore,
    watermark: WatermarkStore,
    max_batch_size: i64,
    max_attempt_count: i64,
}

impl PostgresChangeTrackingStore {
    pub(crate) fn new(
        executor: Arc<dyn SqlExecutor>,
        function_id: UserFunctionId,
        fragments: QueryFragments,
        table: WatchedTable,
        config: &TriggerConfig,
    ) -> Self {
        Self {
            leases: LeaseStore::new(Arc::new(fragments), config.lease_interval_secs),
            watermark: WatermarkStore::new(function_id.clone(), table.id, config.max_attempt_count),
            executor,
            function_id,
            table,
            max_batch_size: i64::try_from(config.max_batch_size).unwrap_or(i64::MAX),
            max_attempt_count: config.max_attempt_count.into(),
        }
    }

    fn keyed(&self, sql: String) -> Statement {
        Statement::new(sql)
            .bind(self.function_id.as_str())
            .bind(self.table.id)
            .bind(self.max_attempt_count)
    }
}

fn object(value: Option<&JsonValue>, column: &str) -> Result<Option<RowValues>> {
    match value {
        None => Ok(None),
        Some(JsonValue::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(anyhow!("Expected a JSON object in column '{column}', got {other}")),
    }
}

fn change_row(row: &SqlRow) -> Result<ChangeRow> {
    let primary_key = object(row.try_opt_json("primary_key")?, "primary_key")?
        .ok_or_else(|| anyhow!("Change row without primary key"))?;
    let code = row.try_str("operation")?;
    let operation = ChangeOperation::from_code(code)
        .ok_or_else(|| anyhow!("Unknown change operation '{code}'"))?;
    Ok(ChangeRow {
        primary_key,
        data: object(row.try_opt_json("data")?, "data")?,
        version: row.try_i64("version")?,
        operation,
        attempt_count: u32::try_from(row.try_i64("attempt_count")?)?,
    })
}

#[async_trait]
impl ChangeTrackingStore for PostgresChangeTrackingStore {
    fn table(&self) -> &WatchedTable {
        &self.table
    }

    async fn poll_changes(&self) -> Result<Vec<ChangeRow>> {
        let mut tx = self.executor.begin(IsolationLevel::RepeatableRead).await?;
        if self.watermark.catch_up(tx.as_mut()).await? {
            info!(
                "Watermark for table {} was behind the minimum valid version and has been raised",
                self.table.name
            );
        }

        let rows = tx
            .query(
                &self
                    .keyed(self.leases.fragments().poll_changes())
                    .bind(self.max_batch_size),
            )
            .await?
            .iter()
            .map(change_row)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to read changes of table {}", self.table.name))?;

        self.leases.acquire(tx.as_mut(), &rows).await?;
        tx.commit().await?;
        if !rows.is_empty() {
            debug!("Leased {} changes of table {}", rows.len(), self.table.name);
        }
        Ok(rows)
    }

    async fn renew_leases(&self, rows: &[ChangeRow]) -> Result<u64> {
        self.leases.renew(self.executor.as_ref(), rows).await
    }

    async fn release_leases(&self, rows: &[ChangeRow], candidate_version: i64) -> Result<bool> {
        let mut tx = self.executor.begin(IsolationLevel::RepeatableRead).await?;
        self.leases.release(tx.as_mut(), rows).await?;
        let advanced = self
            .watermark
            .try_advance(tx.as_mut(), &self.leases, candidate_version)
            .await?;
        tx.commit().await?;
        Ok(advanced)
    }

    async fn unprocessed_change_count(&self) -> Result<i64> {
        let rows = self
            .executor
            .query(&self.keyed(self.leases.fragments().unprocessed_change_count()))
            .await?;
        match rows.first() {
            Some(row) => row.try_i64("unprocessed"),
            None => Ok(0),
        }
    }
}
