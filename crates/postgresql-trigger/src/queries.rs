//! SQL for the lease protocol, precomputed per watched table.
//!
//! Primary-key tuples travel as a single `jsonb` array parameter and are
//! unpacked with `jsonb_to_recordset`, so every statement has a fixed
//! number of parameters regardless of batch size.

use crate::change_tracking::change_table_name;
use crate::schema::{quote_identifier, quote_literal, TableName};
use crate::watermark_store::GLOBAL_STATE_TABLE;
use serde_json::{json, Value as JsonValue};
use trigger_core::{ChangeRow, UserFunctionId, WatchedTable};

pub const SCHEMA: &str = "sql_trigger";

/// Name of the lease table shared by every worker of one function on one table.
pub fn lease_table_name(function_id: &UserFunctionId, table_id: i64) -> String {
    format!(
        "{SCHEMA}.{}",
        quote_identifier(&format!("Leases_{function_id}_{table_id}"))
    )
}

/// Select lists, join predicates and record definitions derived from the
/// watched table's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFragments {
    pub user_table: String,
    pub change_table: String,
    pub lease_table: String,
    /// `"a", "b"`
    pub primary_key_list: String,
    /// `k."a", k."b"`
    pub key_select_list: String,
    /// `jsonb_build_object('a', c."a", 'b', c."b")`
    pub primary_key_json: String,
    /// `l."a" = c."a" AND l."b" = c."b"`
    pub lease_join: String,
    /// `u."a" = c."a" AND u."b" = c."b"`
    pub user_join: String,
    /// `l."a" = k."a" AND l."b" = k."b"`
    pub key_join: String,
    /// `u."a"`; null exactly when the joined user row is missing
    pub user_row_probe: String,
    /// `"a" integer, "b" text, "ChangeVersion" bigint`
    pub record_definition: String,
    /// `"a" integer NOT NULL, "b" text NOT NULL`
    pub key_column_definitions: String,
}

impl QueryFragments {
    pub fn new(table: &WatchedTable, table_name: &TableName, function_id: &UserFunctionId) -> Self {
        let quoted: Vec<String> = table
            .primary_key_names()
            .map(quote_identifier)
            .collect();
        let typed: Vec<String> = table
            .primary_key
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.sql_type))
            .collect();
        let join = |left: &str, right: &str| {
            quoted
                .iter()
                .map(|c| format!("{left}.{c} = {right}.{c}"))
                .collect::<Vec<_>>()
                .join(" AND ")
        };

        Self {
            user_table: table_name.quoted(),
            change_table: change_table_name(table.id),
            lease_table: lease_table_name(function_id, table.id),
            primary_key_list: quoted.join(", "),
            key_select_list: quoted
                .iter()
                .map(|c| format!("k.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            primary_key_json: format!(
                "jsonb_build_object({})",
                table
                    .primary_key
                    .iter()
                    .map(|c| format!("{}, c.{}", quote_literal(&c.name), quote_identifier(&c.name)))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            lease_join: join("l", "c"),
            user_join: join("u", "c"),
            key_join: join("l", "k"),
            user_row_probe: format!("u.{}", quoted[0]),
            record_definition: format!("{}, \"ChangeVersion\" bigint", typed.join(", ")),
            key_column_definitions: typed
                .iter()
                .map(|c| format!("{c} NOT NULL"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn create_lease_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    {},
    \"ChangeVersion\" bigint NOT NULL,
    \"AttemptCount\" integer NOT NULL,
    \"LeaseExpirationTime\" timestamptz NULL,
    PRIMARY KEY ({})
)",
            self.lease_table, self.key_column_definitions, self.primary_key_list
        )
    }

    /// `$1` function id, `$2` table id, `$3` max attempts, `$4` batch size.
    ///
    /// The reported attempt count is the one the acquisition in the same
    /// transaction is about to write. Versions at or above the snapshot's
    /// xmin are left for a later poll, since a transaction with a lower id
    /// may still commit.
    pub fn poll_changes(&self) -> String {
        format!(
            "SELECT {pk_json} AS primary_key,
       CASE WHEN c.\"SYS_CHANGE_OPERATION\" = 'D' OR {probe} IS NULL THEN NULL ELSE to_jsonb(u) END AS data,
       c.\"SYS_CHANGE_VERSION\" AS version,
       CASE
           WHEN c.\"SYS_CHANGE_OPERATION\" = 'D' THEN 'D'
           WHEN c.\"SYS_CHANGE_CREATION_VERSION\" > g.last_sync_version THEN 'I'
           ELSE 'U'
       END::text AS operation,
       (COALESCE(l.\"AttemptCount\", 0) + 1)::bigint AS attempt_count
FROM {change} c
JOIN {GLOBAL_STATE_TABLE} g ON g.user_function_id = $1::text AND g.user_table_id = $2::bigint
LEFT JOIN {lease} l ON {lease_join}
LEFT JOIN {user} u ON {user_join}
WHERE c.\"SYS_CHANGE_VERSION\" > g.last_sync_version
  AND c.\"SYS_CHANGE_VERSION\" < txid_snapshot_xmin(txid_current_snapshot())
  AND ((l.\"LeaseExpirationTime\" IS NULL
        AND (l.\"ChangeVersion\" IS NULL OR l.\"ChangeVersion\" < c.\"SYS_CHANGE_VERSION\"))
       OR l.\"LeaseExpirationTime\" < now())
  AND (l.\"AttemptCount\" IS NULL OR l.\"AttemptCount\" < $3::bigint)
ORDER BY c.\"SYS_CHANGE_VERSION\"
LIMIT $4::bigint",
            pk_json = self.primary_key_json,
            probe = self.user_row_probe,
            change = self.change_table,
            lease = self.lease_table,
            lease_join = self.lease_join,
            user = self.user_table,
            user_join = self.user_join,
        )
    }

    /// `$1` key tuples, `$2` lease duration in seconds.
    pub fn acquire_leases(&self) -> String {
        format!(
            "INSERT INTO {lease} AS l ({pk}, \"ChangeVersion\", \"AttemptCount\", \"LeaseExpirationTime\")
SELECT {keys}, k.\"ChangeVersion\", 1, now() + make_interval(secs => $2::bigint)
FROM jsonb_to_recordset($1::jsonb) AS k({record})
ON CONFLICT ({pk}) DO UPDATE SET
    \"ChangeVersion\" = EXCLUDED.\"ChangeVersion\",
    \"AttemptCount\" = l.\"AttemptCount\" + 1,
    \"LeaseExpirationTime\" = EXCLUDED.\"LeaseExpirationTime\"",
            lease = self.lease_table,
            pk = self.primary_key_list,
            keys = self.key_select_list,
            record = self.record_definition,
        )
    }

    /// `$1` key tuples, `$2` lease duration in seconds.
    pub fn renew_leases(&self) -> String {
        format!(
            "UPDATE {lease} AS l
SET \"LeaseExpirationTime\" = now() + make_interval(secs => $2::bigint)
FROM jsonb_to_recordset($1::jsonb) AS k({record})
WHERE {key_join}
  AND l.\"ChangeVersion\" = k.\"ChangeVersion\"
  AND l.\"LeaseExpirationTime\" IS NOT NULL",
            lease = self.lease_table,
            record = self.record_definition,
            key_join = self.key_join,
        )
    }

    /// `$1` key tuples.
    pub fn release_leases(&self) -> String {
        format!(
            "UPDATE {lease} AS l
SET \"ChangeVersion\" = k.\"ChangeVersion\", \"AttemptCount\" = 0, \"LeaseExpirationTime\" = NULL
FROM jsonb_to_recordset($1::jsonb) AS k({record})
WHERE {key_join}
  AND k.\"ChangeVersion\" >= l.\"ChangeVersion\"",
            lease = self.lease_table,
            record = self.record_definition,
            key_join = self.key_join,
        )
    }

    /// `$1` watermark, `$2` candidate version, `$3` max attempts.
    ///
    /// Changes in the range that are neither released at their own version
    /// nor dead-lettered.
    pub fn count_unresolved_changes(&self) -> String {
        format!(
            "SELECT COUNT(*) AS unresolved
FROM {change} c
LEFT JOIN {lease} l ON {lease_join}
WHERE c.\"SYS_CHANGE_VERSION\" > $1::bigint
  AND c.\"SYS_CHANGE_VERSION\" <= $2::bigint
  AND (l.\"ChangeVersion\" IS NULL
       OR l.\"ChangeVersion\" <> c.\"SYS_CHANGE_VERSION\"
       OR l.\"LeaseExpirationTime\" IS NOT NULL)
  AND (l.\"AttemptCount\" IS NULL OR l.\"AttemptCount\" < $3::bigint)",
            change = self.change_table,
            lease = self.lease_table,
            lease_join = self.lease_join,
        )
    }

    /// `$1` version up to which leases are no longer needed.
    pub fn delete_processed_leases(&self) -> String {
        format!(
            "DELETE FROM {} WHERE \"ChangeVersion\" <= $1::bigint",
            self.lease_table
        )
    }

    /// `$1` function id, `$2` table id, `$3` max attempts.
    pub fn unprocessed_change_count(&self) -> String {
        format!(
            "SELECT COUNT(*) AS unprocessed
FROM {change} c
JOIN {GLOBAL_STATE_TABLE} g ON g.user_function_id = $1::text AND g.user_table_id = $2::bigint
JOIN {SCHEMA}.change_tracking_tables t ON t.table_id = g.user_table_id
LEFT JOIN {lease} l ON {lease_join}
WHERE c.\"SYS_CHANGE_VERSION\" > GREATEST(g.last_sync_version, t.min_valid_version)
  AND (l.\"ChangeVersion\" IS NULL
       OR l.\"ChangeVersion\" < c.\"SYS_CHANGE_VERSION\"
       OR l.\"LeaseExpirationTime\" IS NOT NULL)
  AND (l.\"AttemptCount\" IS NULL OR l.\"AttemptCount\" < $3::bigint)",
            change = self.change_table,
            lease = self.lease_table,
            lease_join = self.lease_join,
        )
    }
}

/// The `jsonb` parameter carrying each row's key columns and version.
pub fn key_tuples(rows: &[ChangeRow]) -> JsonValue {
    JsonValue::Array(
        rows.iter()
            .map(|row| {
                let mut tuple = row.primary_key.clone();
                tuple.insert("ChangeVersion".to_string(), json!(row.version));
                JsonValue::Object(tuple)
            })
            .collect(),
    )
}
