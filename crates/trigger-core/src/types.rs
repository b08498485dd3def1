//! Data model shared by the monitor and the storage backends.

use crate::error::SchemaError;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Column names owned by the lease table. A watched table's primary key must
/// not use any of them (compared ASCII case-insensitively).
pub const RESERVED_LEASE_COLUMNS: [&str; 3] =
    ["ChangeVersion", "AttemptCount", "LeaseExpirationTime"];

/// Column values keyed by column name.
pub type RowValues = serde_json::Map<String, Value>;

/// A primary-key column with its exact SQL type, e.g. `character varying(20)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub sql_type: String,
}

impl PrimaryKeyColumn {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// The table under observation, resolved once when a monitor starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTable {
    /// Stable identifier of the table in its database
    pub id: i64,
    /// Name as given by the user, e.g. `dbo.Products`
    pub name: String,
    /// Primary-key columns in key order
    pub primary_key: Vec<PrimaryKeyColumn>,
    /// All column names in table order
    pub columns: Vec<String>,
}

impl WatchedTable {
    /// Build a watched table, rejecting shapes the lease protocol cannot key.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        primary_key: Vec<PrimaryKeyColumn>,
        columns: Vec<String>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if primary_key.is_empty() {
            return Err(SchemaError::MissingPrimaryKey(name));
        }
        for column in &primary_key {
            if let Some(reserved) = RESERVED_LEASE_COLUMNS
                .iter()
                .find(|reserved| reserved.eq_ignore_ascii_case(&column.name))
            {
                return Err(SchemaError::ReservedColumnName {
                    table: name,
                    column: column.name.clone(),
                    reserved: *reserved,
                });
            }
        }
        Ok(Self {
            id,
            name,
            primary_key,
            columns,
        })
    }

    pub fn primary_key_names(&self) -> impl Iterator<Item = &str> {
        self.primary_key.iter().map(|c| c.name.as_str())
    }
}

/// Kind of mutation reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Parse the single-letter code used by change feeds (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "Insert"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

/// One leased row of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// Primary-key values keyed by column name
    pub primary_key: RowValues,
    /// Current values of the whole row; `None` for deletes, or when the row
    /// vanished between the change and the poll
    pub data: Option<RowValues>,
    /// Version assigned by the change feed
    pub version: i64,
    pub operation: ChangeOperation,
    /// Attempt number recorded by the lease acquisition that claimed this row
    pub attempt_count: u32,
}

impl ChangeRow {
    /// The object delivered to the executor: primary-key columns only for
    /// deletes, the full current row otherwise.
    pub fn payload(&self) -> RowValues {
        match (&self.operation, &self.data) {
            (ChangeOperation::Delete, _) | (_, None) => self.primary_key.clone(),
            (_, Some(data)) => {
                let mut payload = data.clone();
                for (column, value) in &self.primary_key {
                    payload
                        .entry(column.clone())
                        .or_insert_with(|| value.clone());
                }
                payload
            }
        }
    }
}

/// A change delivered to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub operation: ChangeOperation,
    pub item: T,
}

impl<T: DeserializeOwned> Change<T> {
    pub fn from_row(row: &ChangeRow) -> anyhow::Result<Self> {
        let item = serde_json::from_value(Value::Object(row.payload())).with_context(|| {
            format!(
                "Failed to deserialize {} change at version {}",
                row.operation, row.version
            )
        })?;
        Ok(Self {
            operation: row.operation,
            item,
        })
    }
}

/// Deserialize a batch of rows, failing the whole batch on the first bad row.
pub fn materialize<T: DeserializeOwned>(rows: &[ChangeRow]) -> anyhow::Result<Vec<Change<T>>> {
    rows.iter().map(Change::from_row).collect()
}

/// The version the watermark may advance to after `rows` were processed.
///
/// If every row shares one version, that version. Otherwise the
/// second-highest distinct version. Backends must only hand out versions
/// below which no writer is still in flight; this rule does not replace that.
pub fn candidate_version(rows: &[ChangeRow]) -> Option<i64> {
    let mut versions: Vec<i64> = rows.iter().map(|r| r.version).collect();
    versions.sort_unstable();
    versions.dedup();
    match versions.len() {
        0 => None,
        1 => Some(versions[0]),
        n => Some(versions[n - 2]),
    }
}

/// State of a change monitor's in-memory batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    CheckingForChanges,
    ProcessingChanges,
}

/// Identity shared by every worker running the same user function.
///
/// Workers with the same id share one watermark and one lease table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserFunctionId(String);

impl UserFunctionId {
    /// Derive the id from the host id and the function name.
    pub fn new(host_id: &str, function_name: &str) -> Self {
        let name = format!("{host_id}{function_name}");
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        let mut simple = uuid.simple().to_string();
        simple.truncate(16);
        Self(simple)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserFunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a listener watches: one table on behalf of one user function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerTarget {
    pub function_id: UserFunctionId,
    pub table_name: String,
}

impl TriggerTarget {
    pub fn new(function_id: UserFunctionId, table_name: impl Into<String>) -> Self {
        Self {
            function_id,
            table_name: table_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, version: i64) -> ChangeRow {
        let mut primary_key = RowValues::new();
        primary_key.insert("id".to_string(), json!(id));
        ChangeRow {
            primary_key,
            data: None,
            version,
            operation: ChangeOperation::Update,
            attempt_count: 1,
        }
    }

    #[test]
    fn test_candidate_version_single_distinct_version() {
        let rows = vec![row(1, 7), row(2, 7), row(3, 7)];
        assert_eq!(candidate_version(&rows), Some(7));
    }

    #[test]
    fn test_candidate_version_is_second_highest_distinct() {
        let rows = vec![row(1, 3), row(2, 9), row(3, 5), row(4, 9), row(5, 9)];
        assert_eq!(candidate_version(&rows), Some(5));
    }

    #[test]
    fn test_candidate_version_many_duplicates_of_two_versions() {
        let mut rows: Vec<ChangeRow> = (0..50).map(|i| row(i, 4)).collect();
        rows.push(row(100, 11));
        assert_eq!(candidate_version(&rows), Some(4));
        assert_eq!(candidate_version(&[]), None);
    }

    #[test]
    fn test_reserved_primary_key_column_is_rejected() {
        let err = WatchedTable::new(
            1,
            "dbo.Products",
            vec![PrimaryKeyColumn::new("changeversion", "bigint")],
            vec!["changeversion".to_string()],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ReservedColumnName {
                reserved: "ChangeVersion",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_primary_key_is_rejected() {
        let err = WatchedTable::new(1, "dbo.Products", vec![], vec!["Name".to_string()])
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingPrimaryKey(_)));
    }

    #[test]
    fn test_delete_payload_carries_only_primary_key() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        #[serde(default)]
        struct Product {
            #[serde(rename = "ProductId")]
            product_id: i32,
            #[serde(rename = "Name")]
            name: Option<String>,
            #[serde(rename = "Cost")]
            cost: i32,
        }

        let mut primary_key = RowValues::new();
        primary_key.insert("ProductId".to_string(), json!(1));
        let row = ChangeRow {
            primary_key,
            data: None,
            version: 2,
            operation: ChangeOperation::Delete,
            attempt_count: 1,
        };
        let change: Change<Product> = Change::from_row(&row).unwrap();
        assert_eq!(change.operation, ChangeOperation::Delete);
        assert_eq!(
            change.item,
            Product {
                product_id: 1,
                name: None,
                cost: 0
            }
        );
    }

    #[test]
    fn test_undeserializable_row_keeps_serde_error_as_source() {
        #[derive(Debug, Deserialize)]
        struct Keyed {
            #[serde(rename = "ProductId")]
            _product_id: i32,
        }

        let mut primary_key = RowValues::new();
        primary_key.insert("ProductId".to_string(), json!("not a number"));
        let row = ChangeRow {
            primary_key,
            data: None,
            version: 7,
            operation: ChangeOperation::Delete,
            attempt_count: 1,
        };
        let err = Change::<Keyed>::from_row(&row).unwrap_err();
        assert!(err.to_string().contains("at version 7"));
        assert!(err.root_cause().is::<serde_json::Error>());
    }

    #[test]
    fn test_user_function_id_is_stable_and_short() {
        let a = UserFunctionId::new("host-1", "ProductsTrigger");
        let b = UserFunctionId::new("host-1", "ProductsTrigger");
        let c = UserFunctionId::new("host-2", "ProductsTrigger");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(ChangeOperation::from_code("D"), Some(ChangeOperation::Delete));
        assert_eq!(ChangeOperation::from_code("I "), Some(ChangeOperation::Insert));
        assert_eq!(ChangeOperation::from_code("X"), None);
        assert_eq!(ChangeOperation::Update.code(), "U");
    }
}
