//! In-process change tracking backend.
//!
//! `MemoryDatabase` holds tables, a coalescing change feed per tracked table,
//! lease tables and watermarks, and implements the same lease protocol as
//! the SQL backends. Every store operation runs under one lock, which stands
//! in for the serializable transaction a database would use.
//!
//! Lease expiry uses `tokio::time::Instant`, so tests can drive it with a
//! paused clock.

use crate::config::TriggerConfig;
use crate::error::{SchemaError, TriggerError};
use crate::store::{ChangeTrackingBackend, ChangeTrackingStore};
use crate::types::{
    ChangeOperation, ChangeRow, PrimaryKeyColumn, RowValues, TriggerTarget, UserFunctionId,
    WatchedTable,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, info};

type LeaseKey = (UserFunctionId, i64);

#[derive(Debug, Clone)]
struct TrackedChange {
    primary_key: RowValues,
    version: i64,
    /// Version of the last insert of this key, if it happened while tracked
    creation_version: Option<i64>,
    last_operation: ChangeOperation,
}

impl TrackedChange {
    /// Operation as seen by a consumer whose watermark is `watermark`.
    fn operation_since(&self, watermark: i64) -> ChangeOperation {
        match self.last_operation {
            ChangeOperation::Delete => ChangeOperation::Delete,
            _ if self.creation_version.is_some_and(|v| v > watermark) => ChangeOperation::Insert,
            _ => ChangeOperation::Update,
        }
    }
}

#[derive(Debug, Clone)]
struct ChangeTracking {
    min_valid_version: i64,
    changes: BTreeMap<String, TrackedChange>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    id: i64,
    primary_key: Vec<PrimaryKeyColumn>,
    columns: Vec<String>,
    rows: BTreeMap<String, RowValues>,
    tracking: Option<ChangeTracking>,
}

#[derive(Debug, Clone)]
struct LeaseRow {
    change_version: i64,
    attempt_count: u32,
    expires_at: Option<Instant>,
}

impl LeaseRow {
    /// The poll's eligibility rule: free for an older version, or expired,
    /// and not yet out of attempts.
    fn is_available(&self, version: i64, now: Instant, max_attempt_count: u32) -> bool {
        let free = match self.expires_at {
            None => self.change_version < version,
            Some(expires_at) => expires_at < now,
        };
        free && self.attempt_count < max_attempt_count
    }

    /// Whether the change at `version` still counts as outstanding.
    fn is_unresolved(&self, version: i64, max_attempt_count: u32) -> bool {
        (self.change_version != version || self.expires_at.is_some())
            && self.attempt_count < max_attempt_count
    }

    /// Whether the change at `version` still counts towards the backlog.
    fn is_pending(&self, version: i64, max_attempt_count: u32) -> bool {
        (self.change_version < version || self.expires_at.is_some())
            && self.attempt_count < max_attempt_count
    }
}

#[derive(Debug, Clone)]
struct GlobalStateRow {
    last_sync_version: i64,
    last_access_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct DatabaseState {
    next_table_id: i64,
    current_version: i64,
    tables: BTreeMap<String, MemoryTable>,
    global_state: HashMap<LeaseKey, GlobalStateRow>,
    leases: HashMap<LeaseKey, BTreeMap<String, LeaseRow>>,
    injected_poll_failures: u32,
}

/// A lease as seen from outside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub change_version: i64,
    pub attempt_count: u32,
    /// Whether an expiration time is set, i.e. the lease was acquired and
    /// not released
    pub held: bool,
}

/// An in-memory database with change tracking.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a table. `primary_key` lists `(column, sql type)` pairs; every
    /// key column must also appear in `columns`.
    pub fn create_table(
        &self,
        name: &str,
        primary_key: &[(&str, &str)],
        columns: &[&str],
    ) -> Result<i64> {
        let mut state = self.lock();
        if state.tables.contains_key(name) {
            bail!("Table '{name}' already exists");
        }
        for (column, _) in primary_key {
            if !columns.contains(column) {
                bail!("Primary key column '{column}' is not a column of table '{name}'");
            }
        }
        state.next_table_id += 1;
        let id = state.next_table_id;
        state.tables.insert(
            name.to_string(),
            MemoryTable {
                id,
                primary_key: primary_key
                    .iter()
                    .map(|(column, sql_type)| PrimaryKeyColumn::new(*column, *sql_type))
                    .collect(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
                tracking: None,
            },
        );
        Ok(id)
    }

    /// Start recording changes for a table. Changes made before this call
    /// are not visible to consumers.
    pub fn enable_change_tracking(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let current_version = state.current_version;
        let table = state
            .tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("Could not find table '{name}'"))?;
        if table.tracking.is_none() {
            table.tracking = Some(ChangeTracking {
                min_valid_version: current_version,
                changes: BTreeMap::new(),
            });
            info!("Enabled change tracking on table {name} at version {current_version}");
        }
        Ok(())
    }

    pub fn disable_change_tracking(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        let table = state
            .tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("Could not find table '{name}'"))?;
        table.tracking = None;
        Ok(())
    }

    /// Run several writes as one transaction: all of them share one change
    /// version, and none are applied if `f` fails.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut MemoryTransaction<'_>) -> Result<R>,
    {
        let mut state = self.lock();
        let mut working = state.clone();
        let result = {
            let mut tx = MemoryTransaction {
                state: &mut working,
                version: None,
            };
            f(&mut tx)?
        };
        *state = working;
        Ok(result)
    }

    pub fn insert(&self, table: &str, row: Value) -> Result<()> {
        self.transaction(|tx| tx.insert(table, row))
    }

    pub fn update(&self, table: &str, row: Value) -> Result<()> {
        self.transaction(|tx| tx.update(table, row))
    }

    pub fn delete(&self, table: &str, key: Value) -> Result<()> {
        self.transaction(|tx| tx.delete(table, key))
    }

    /// The latest change version handed out.
    pub fn current_version(&self) -> i64 {
        self.lock().current_version
    }

    /// Make the next `count` polls from any store fail.
    pub fn inject_poll_failures(&self, count: u32) {
        self.lock().injected_poll_failures = count;
    }

    pub fn watermark(&self, function_id: &UserFunctionId, table: &str) -> Option<i64> {
        let state = self.lock();
        let id = state.tables.get(table)?.id;
        state
            .global_state
            .get(&(function_id.clone(), id))
            .map(|g| g.last_sync_version)
    }

    pub fn lease(
        &self,
        function_id: &UserFunctionId,
        table: &str,
        key: Value,
    ) -> Option<LeaseSnapshot> {
        let state = self.lock();
        let table = state.tables.get(table)?;
        let key = match key {
            Value::Object(values) => key_string(&table.primary_key, &values).ok()?,
            _ => return None,
        };
        state
            .leases
            .get(&(function_id.clone(), table.id))?
            .get(&key)
            .map(|lease| LeaseSnapshot {
                change_version: lease.change_version,
                attempt_count: lease.attempt_count,
                held: lease.expires_at.is_some(),
            })
    }
}

/// Writes inside [`MemoryDatabase::transaction`].
pub struct MemoryTransaction<'a> {
    state: &'a mut DatabaseState,
    version: Option<i64>,
}

impl MemoryTransaction<'_> {
    fn change_version(&mut self) -> i64 {
        let state = &mut *self.state;
        *self.version.get_or_insert_with(|| {
            state.current_version += 1;
            state.current_version
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.state
            .tables
            .get_mut(name)
            .ok_or_else(|| anyhow!("Could not find table '{name}'"))
    }

    fn record(&mut self, table: &str, key: String, primary_key: RowValues, op: ChangeOperation) {
        let tracked = self
            .state
            .tables
            .get(table)
            .is_some_and(|t| t.tracking.is_some());
        if !tracked {
            return;
        }
        let version = self.change_version();
        let Some(tracking) = self
            .state
            .tables
            .get_mut(table)
            .and_then(|t| t.tracking.as_mut())
        else {
            return;
        };
        let creation_version = (op == ChangeOperation::Insert).then_some(version);
        tracking
            .changes
            .entry(key)
            .and_modify(|change| {
                change.version = version;
                change.last_operation = op;
                if creation_version.is_some() {
                    change.creation_version = creation_version;
                }
            })
            .or_insert(TrackedChange {
                primary_key,
                version,
                creation_version,
                last_operation: op,
            });
    }

    pub fn insert(&mut self, table: &str, row: Value) -> Result<()> {
        let target = self.table_mut(table)?;
        let values = into_object(row)?;
        let (key, primary_key) = extract_key(&target.primary_key, &values)?;
        if target.rows.contains_key(&key) {
            bail!("Duplicate key {key} in table '{table}'");
        }
        let mut full = RowValues::new();
        for column in &target.columns {
            full.insert(
                column.clone(),
                values.get(column).cloned().unwrap_or(Value::Null),
            );
        }
        if let Some(unknown) = values.keys().find(|c| !target.columns.contains(c)) {
            bail!("Invalid column name '{unknown}' for table '{table}'");
        }
        target.rows.insert(key.clone(), full);
        self.record(table, key, primary_key, ChangeOperation::Insert);
        Ok(())
    }

    /// Update the columns present in `row` of the row with the same key.
    pub fn update(&mut self, table: &str, row: Value) -> Result<()> {
        let target = self.table_mut(table)?;
        let values = into_object(row)?;
        let (key, primary_key) = extract_key(&target.primary_key, &values)?;
        let columns = target.columns.clone();
        let existing = target
            .rows
            .get_mut(&key)
            .ok_or_else(|| anyhow!("No row with key {key} in table '{table}'"))?;
        for (column, value) in values {
            if !columns.contains(&column) {
                bail!("Invalid column name '{column}' for table '{table}'");
            }
            existing.insert(column, value);
        }
        self.record(table, key, primary_key, ChangeOperation::Update);
        Ok(())
    }

    pub fn delete(&mut self, table: &str, key: Value) -> Result<()> {
        let target = self.table_mut(table)?;
        let values = into_object(key)?;
        let (key, primary_key) = extract_key(&target.primary_key, &values)?;
        if target.rows.remove(&key).is_none() {
            bail!("No row with key {key} in table '{table}'");
        }
        self.record(table, key, primary_key, ChangeOperation::Delete);
        Ok(())
    }
}

fn into_object(value: Value) -> Result<RowValues> {
    match value {
        Value::Object(values) => Ok(values),
        other => bail!("Expected a JSON object, got {other}"),
    }
}

fn key_string(primary_key: &[PrimaryKeyColumn], values: &RowValues) -> Result<String> {
    let parts = primary_key
        .iter()
        .map(|column| match values.get(&column.name) {
            None | Some(Value::Null) => bail!("Primary key column '{}' is null", column.name),
            Some(value) => Ok(value),
        })
        .collect::<Result<Vec<_>>>()?;
    serde_json::to_string(&parts).context("Failed to encode primary key")
}

fn extract_key(primary_key: &[PrimaryKeyColumn], values: &RowValues) -> Result<(String, RowValues)> {
    let key = key_string(primary_key, values)?;
    let key_values = primary_key
        .iter()
        .filter_map(|c| values.get(&c.name).map(|v| (c.name.clone(), v.clone())))
        .collect();
    Ok((key, key_values))
}

#[async_trait]
impl ChangeTrackingBackend for MemoryDatabase {
    async fn open(
        &self,
        target: &TriggerTarget,
        config: &TriggerConfig,
    ) -> std::result::Result<Arc<dyn ChangeTrackingStore>, TriggerError> {
        let mut state = self.lock();
        let table = state
            .tables
            .get(&target.table_name)
            .ok_or_else(|| SchemaError::TableNotFound(target.table_name.clone()))?;
        let watched = WatchedTable::new(
            table.id,
            target.table_name.clone(),
            table.primary_key.clone(),
            table.columns.clone(),
        )?;
        let min_valid_version = table
            .tracking
            .as_ref()
            .map(|t| t.min_valid_version)
            .ok_or_else(|| TriggerError::ChangeTrackingNotEnabled(target.table_name.clone()))?;

        let key = (target.function_id.clone(), watched.id);
        state.leases.entry(key.clone()).or_default();
        state.global_state.entry(key).or_insert_with(|| {
            debug!(
                "Initialized watermark of {} for table {} at version {min_valid_version}",
                target.function_id, target.table_name
            );
            GlobalStateRow {
                last_sync_version: min_valid_version,
                last_access_time: Utc::now(),
            }
        });

        Ok(Arc::new(MemoryChangeTrackingStore {
            db: self.clone(),
            function_id: target.function_id.clone(),
            table: watched,
            config: config.clone(),
        }))
    }
}

/// Lease and watermark operations for one (function, table) pair.
pub struct MemoryChangeTrackingStore {
    db: MemoryDatabase,
    function_id: UserFunctionId,
    table: WatchedTable,
    config: TriggerConfig,
}

impl MemoryChangeTrackingStore {
    fn lease_key(&self) -> LeaseKey {
        (self.function_id.clone(), self.table.id)
    }

    fn row_key(&self, row: &ChangeRow) -> Result<String> {
        key_string(&self.table.primary_key, &row.primary_key)
    }

    fn lease_expiry(&self, now: Instant) -> Result<Instant> {
        now.checked_add(self.config.lease_interval()).ok_or_else(|| {
            anyhow!(
                "Lease interval of {}s is out of range",
                self.config.lease_interval_secs
            )
        })
    }
}

/// Split borrows of the pieces of state one (function, table) pair touches.
struct PairState<'a> {
    table: &'a MemoryTable,
    tracking: &'a ChangeTracking,
    global: &'a mut GlobalStateRow,
    leases: &'a mut BTreeMap<String, LeaseRow>,
}

fn pair_state<'a>(
    state: &'a mut DatabaseState,
    table_name: &str,
    key: &LeaseKey,
) -> Result<PairState<'a>> {
    let DatabaseState {
        tables,
        global_state,
        leases,
        ..
    } = state;
    let table = tables
        .get(table_name)
        .ok_or_else(|| anyhow!("Could not find table '{table_name}'"))?;
    let tracking = table
        .tracking
        .as_ref()
        .ok_or_else(|| anyhow!("Change tracking is not enabled on table '{table_name}'"))?;
    let global = global_state
        .get_mut(key)
        .ok_or_else(|| anyhow!("Missing watermark for table '{table_name}'"))?;
    let leases = leases.entry(key.clone()).or_default();
    Ok(PairState {
        table,
        tracking,
        global,
        leases,
    })
}

#[async_trait]
impl ChangeTrackingStore for MemoryChangeTrackingStore {
    fn table(&self) -> &WatchedTable {
        &self.table
    }

    async fn poll_changes(&self) -> Result<Vec<ChangeRow>> {
        let now = Instant::now();
        let mut state = self.db.lock();
        if state.injected_poll_failures > 0 {
            state.injected_poll_failures -= 1;
            bail!("Injected poll failure");
        }

        let key = self.lease_key();
        let mut pair = pair_state(&mut state, &self.table.name, &key)?;
        if pair.global.last_sync_version < pair.tracking.min_valid_version {
            pair.global.last_sync_version = pair.tracking.min_valid_version;
        }
        let watermark = pair.global.last_sync_version;
        let max_attempt_count = self.config.max_attempt_count;

        let mut eligible: Vec<(&String, &TrackedChange)> = pair
            .tracking
            .changes
            .iter()
            .filter(|(_, change)| change.version > watermark)
            .filter(|(row_key, change)| {
                pair.leases
                    .get(*row_key)
                    .map_or(true, |lease| lease.is_available(change.version, now, max_attempt_count))
            })
            .collect();
        eligible.sort_by_key(|(_, change)| change.version);
        eligible.truncate(self.config.max_batch_size);

        let expires_at = self.lease_expiry(now)?;
        let mut rows = Vec::with_capacity(eligible.len());
        for (row_key, change) in eligible {
            let lease = pair.leases.entry(row_key.clone()).or_insert(LeaseRow {
                change_version: change.version,
                attempt_count: 0,
                expires_at: None,
            });
            lease.change_version = change.version;
            lease.attempt_count += 1;
            lease.expires_at = Some(expires_at);

            let operation = change.operation_since(watermark);
            let data = match operation {
                ChangeOperation::Delete => None,
                _ => pair.table.rows.get(row_key).cloned(),
            };
            rows.push(ChangeRow {
                primary_key: change.primary_key.clone(),
                data,
                version: change.version,
                operation,
                attempt_count: lease.attempt_count,
            });
        }
        Ok(rows)
    }

    async fn renew_leases(&self, rows: &[ChangeRow]) -> Result<u64> {
        let expires_at = self.lease_expiry(Instant::now())?;
        let keys = rows
            .iter()
            .map(|row| Ok((self.row_key(row)?, row.version)))
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.db.lock();
        let leases = state.leases.entry(self.lease_key()).or_default();
        let mut renewed = 0;
        for (row_key, version) in keys {
            if let Some(lease) = leases.get_mut(&row_key) {
                if lease.change_version == version && lease.expires_at.is_some() {
                    lease.expires_at = Some(expires_at);
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn release_leases(&self, rows: &[ChangeRow], candidate_version: i64) -> Result<bool> {
        let keys = rows
            .iter()
            .map(|row| Ok((self.row_key(row)?, row.version)))
            .collect::<Result<Vec<_>>>()?;
        let key = self.lease_key();
        let mut state = self.db.lock();
        let mut pair = pair_state(&mut state, &self.table.name, &key)?;

        for (row_key, version) in keys {
            if let Some(lease) = pair.leases.get_mut(&row_key) {
                if version >= lease.change_version {
                    lease.change_version = version;
                    lease.attempt_count = 0;
                    lease.expires_at = None;
                }
            }
        }

        let watermark = pair.global.last_sync_version;
        if candidate_version <= watermark {
            return Ok(false);
        }
        let max_attempt_count = self.config.max_attempt_count;
        let unresolved = pair
            .tracking
            .changes
            .iter()
            .filter(|(_, c)| c.version > watermark && c.version <= candidate_version)
            .filter(|(row_key, c)| {
                pair.leases
                    .get(*row_key)
                    .map_or(true, |lease| lease.is_unresolved(c.version, max_attempt_count))
            })
            .count();
        if unresolved > 0 {
            return Ok(false);
        }

        pair.global.last_sync_version = candidate_version;
        pair.global.last_access_time = Utc::now();
        pair.leases
            .retain(|_, lease| lease.change_version > candidate_version);
        Ok(true)
    }

    async fn unprocessed_change_count(&self) -> Result<i64> {
        let key = self.lease_key();
        let mut state = self.db.lock();
        let pair = pair_state(&mut state, &self.table.name, &key)?;
        let watermark = pair
            .global
            .last_sync_version
            .max(pair.tracking.min_valid_version);
        let max_attempt_count = self.config.max_attempt_count;
        let count = pair
            .tracking
            .changes
            .iter()
            .filter(|(_, c)| c.version > watermark)
            .filter(|(row_key, c)| {
                pair.leases
                    .get(*row_key)
                    .map_or(true, |lease| lease.is_pending(c.version, max_attempt_count))
            })
            .count();
        Ok(count as i64)
    }
}
