//! Trigger-based change feed.
//!
//! Enabling tracking on a table installs a row trigger that upserts one row
//! per primary key into `sql_trigger.changes_<table_id>`, stamped with the
//! writing transaction's id (`txid_current()`). Only the latest change per
//! key is kept, so consumers see net changes.
//!
//! A transaction id is assigned at first write but becomes visible at
//! commit, so readers only consume versions below their snapshot's xmin:
//! every transaction with a lower id has finished by then.

use crate::queries::SCHEMA;
use crate::schema::{quote_identifier, resolve_table, TableName};
use crate::sql::{IsolationLevel, SqlExecutor, SqlTransaction, Statement};
use anyhow::{Context, Result};
use tracing::{debug, info};
use trigger_core::{TriggerError, WatchedTable};

pub const REGISTRY_TABLE: &str = "sql_trigger.change_tracking_tables";

const TRIGGER_NAME: &str = "sql_trigger_track_changes";

/// Serializes concurrent provisioning; `CREATE OR REPLACE FUNCTION` and
/// `CREATE ... IF NOT EXISTS` race each other otherwise.
pub(crate) const SETUP_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext('sql_trigger_setup'))";

pub fn change_table_name(table_id: i64) -> String {
    format!("{SCHEMA}.{}", quote_identifier(&format!("changes_{table_id}")))
}

fn track_function_name(table_id: i64) -> String {
    format!(
        "{SCHEMA}.{}",
        quote_identifier(&format!("track_changes_{table_id}"))
    )
}

fn base_objects_ddl() -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {SCHEMA};
CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
    table_id bigint PRIMARY KEY,
    table_name text NOT NULL,
    min_valid_version bigint NOT NULL,
    enabled_at timestamptz NOT NULL DEFAULT now()
)"
    )
}

fn change_table_ddl(table: &WatchedTable) -> String {
    let change_table = change_table_name(table.id);
    let key_columns = table
        .primary_key
        .iter()
        .map(|c| format!("{} {} NOT NULL", quote_identifier(&c.name), c.sql_type))
        .collect::<Vec<_>>()
        .join(",\n    ");
    let primary_key = primary_key_list(table, "");
    let index = quote_identifier(&format!("changes_{}_version_idx", table.id));
    format!(
        "CREATE TABLE IF NOT EXISTS {change_table} (
    {key_columns},
    \"SYS_CHANGE_VERSION\" bigint NOT NULL,
    \"SYS_CHANGE_CREATION_VERSION\" bigint NULL,
    \"SYS_CHANGE_OPERATION\" char(1) NOT NULL,
    PRIMARY KEY ({primary_key})
);
CREATE INDEX IF NOT EXISTS {index} ON {change_table} (\"SYS_CHANGE_VERSION\")"
    )
}

fn primary_key_list(table: &WatchedTable, prefix: &str) -> String {
    table
        .primary_key_names()
        .map(|c| format!("{prefix}{}", quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Trigger function recording the latest operation per key.
///
/// An update that changes the primary key is a delete of the old key and an
/// insert of the new one.
fn track_function_ddl(table: &WatchedTable) -> String {
    let function = track_function_name(table.id);
    let change_table = change_table_name(table.id);
    let pk = primary_key_list(table, "");
    let old_pk = primary_key_list(table, "OLD.");
    let new_pk = primary_key_list(table, "NEW.");
    let columns = "\"SYS_CHANGE_VERSION\", \"SYS_CHANGE_CREATION_VERSION\", \"SYS_CHANGE_OPERATION\"";

    let record_insert = |key: &str| {
        format!(
            "INSERT INTO {change_table} AS ct ({pk}, {columns})
            VALUES ({key}, sql_trigger_version, sql_trigger_version, 'I')
            ON CONFLICT ({pk}) DO UPDATE SET
                \"SYS_CHANGE_VERSION\" = EXCLUDED.\"SYS_CHANGE_VERSION\",
                \"SYS_CHANGE_CREATION_VERSION\" = EXCLUDED.\"SYS_CHANGE_CREATION_VERSION\",
                \"SYS_CHANGE_OPERATION\" = 'I';"
        )
    };
    let record_delete = format!(
        "INSERT INTO {change_table} AS ct ({pk}, {columns})
            VALUES ({old_pk}, sql_trigger_version, NULL, 'D')
            ON CONFLICT ({pk}) DO UPDATE SET
                \"SYS_CHANGE_VERSION\" = EXCLUDED.\"SYS_CHANGE_VERSION\",
                \"SYS_CHANGE_OPERATION\" = 'D';"
    );
    let record_update = format!(
        "INSERT INTO {change_table} AS ct ({pk}, {columns})
            VALUES ({new_pk}, sql_trigger_version, NULL, 'U')
            ON CONFLICT ({pk}) DO UPDATE SET
                \"SYS_CHANGE_VERSION\" = EXCLUDED.\"SYS_CHANGE_VERSION\",
                \"SYS_CHANGE_OPERATION\" = 'U';"
    );
    let record_new_insert = record_insert(&new_pk);

    format!(
        "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$
        DECLARE
            sql_trigger_version bigint := txid_current();
        BEGIN
            IF TG_OP = 'INSERT' THEN
                {record_new_insert}
                RETURN NEW;
            ELSIF TG_OP = 'UPDATE' THEN
                IF ROW({old_pk}) IS DISTINCT FROM ROW({new_pk}) THEN
                    {record_delete}
                    {record_new_insert}
                ELSE
                    {record_update}
                END IF;
                RETURN NEW;
            ELSIF TG_OP = 'DELETE' THEN
                {record_delete}
                RETURN OLD;
            END IF;
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql"
    )
}

const REGISTER_TABLE: &str = "INSERT INTO sql_trigger.change_tracking_tables (table_id, table_name, min_valid_version)
SELECT $1::bigint, $2::text,
       LEAST(txid_snapshot_xmin(txid_current_snapshot()), txid_current()) - 1
ON CONFLICT (table_id) DO NOTHING";

const REGISTRY_EXISTS: &str =
    "SELECT to_regclass('sql_trigger.change_tracking_tables') IS NOT NULL AS registry_exists";

const MIN_VALID_VERSION: &str =
    "SELECT min_valid_version FROM sql_trigger.change_tracking_tables WHERE table_id = $1::bigint";

/// Install change tracking on `table_name`. Idempotent.
pub async fn enable_change_tracking(
    executor: &dyn SqlExecutor,
    table_name: &str,
) -> Result<(), TriggerError> {
    let (table, parsed) = resolve_table(executor, table_name).await?;
    let mut tx = executor.begin(IsolationLevel::ReadCommitted).await?;
    provision(tx.as_mut(), &table, &parsed)
        .await
        .with_context(|| format!("Failed to enable change tracking on table '{table_name}'"))?;
    tx.commit().await?;
    info!("Enabled change tracking on table {parsed} (id {})", table.id);
    Ok(())
}

async fn provision(
    tx: &mut dyn SqlTransaction,
    table: &WatchedTable,
    parsed: &TableName,
) -> Result<()> {
    tx.execute_batch(SETUP_LOCK).await?;
    tx.execute_batch(&base_objects_ddl()).await?;
    tx.execute_batch(&change_table_ddl(table)).await?;
    tx.execute_batch(&track_function_ddl(table)).await?;

    let trigger = quote_identifier(TRIGGER_NAME);
    let user_table = parsed.quoted();
    tx.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {trigger} ON {user_table};
CREATE TRIGGER {trigger}
AFTER INSERT OR UPDATE OR DELETE ON {user_table}
FOR EACH ROW EXECUTE FUNCTION {}()",
        track_function_name(table.id)
    ))
    .await?;

    let registered = tx
        .execute(
            &Statement::new(REGISTER_TABLE)
                .bind(table.id)
                .bind(parsed.to_string()),
        )
        .await?;
    if registered == 0 {
        debug!("Table {parsed} was already registered for change tracking");
    }
    Ok(())
}

/// Remove the trigger, the change table and the registry row. Succeeds when
/// tracking was never enabled.
pub async fn disable_change_tracking(
    executor: &dyn SqlExecutor,
    table_name: &str,
) -> Result<(), TriggerError> {
    let (table, parsed) = resolve_table(executor, table_name).await?;
    let mut tx = executor.begin(IsolationLevel::ReadCommitted).await?;
    tx.execute_batch(SETUP_LOCK).await?;
    tx.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS {} ON {};
DROP FUNCTION IF EXISTS {}();
DROP TABLE IF EXISTS {}",
        quote_identifier(TRIGGER_NAME),
        parsed.quoted(),
        track_function_name(table.id),
        change_table_name(table.id),
    ))
    .await
    .with_context(|| format!("Failed to disable change tracking on table '{table_name}'"))?;

    let registry = tx.query(&Statement::new(REGISTRY_EXISTS)).await?;
    if registry
        .first()
        .map(|row| row.try_bool("registry_exists"))
        .transpose()?
        .unwrap_or(false)
    {
        tx.execute(
            &Statement::new("DELETE FROM sql_trigger.change_tracking_tables WHERE table_id = $1::bigint")
                .bind(table.id),
        )
        .await?;
    }
    tx.commit().await?;
    info!("Disabled change tracking on table {parsed}");
    Ok(())
}

/// The feed's minimum valid version for a table, or
/// [`TriggerError::ChangeTrackingNotEnabled`].
pub async fn min_valid_version(
    executor: &dyn SqlExecutor,
    table: &WatchedTable,
) -> Result<i64, TriggerError> {
    let not_enabled = || TriggerError::ChangeTrackingNotEnabled(table.name.clone());

    let registry = executor.query(&Statement::new(REGISTRY_EXISTS)).await?;
    let registry_exists = match registry.first() {
        Some(row) => row.try_bool("registry_exists")?,
        None => false,
    };
    if !registry_exists {
        return Err(not_enabled());
    }

    let rows = executor
        .query(&Statement::new(MIN_VALID_VERSION).bind(table.id))
        .await?;
    match rows.first() {
        Some(row) => Ok(row.try_i64("min_valid_version")?),
        None => Err(not_enabled()),
    }
}
