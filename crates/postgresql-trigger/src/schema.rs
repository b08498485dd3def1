//! Watched-table resolution.
//!
//! Looks the table up in the catalog once at startup and captures its
//! primary key with exact column types, so the lease table and the
//! `jsonb_to_recordset` record definitions type-match the source.

use crate::sql::{SqlExecutor, Statement};
use std::fmt;
use trigger_core::{PrimaryKeyColumn, SchemaError, TriggerError, WatchedTable};

pub const DEFAULT_SCHEMA: &str = "public";

/// A `[schema.]name` table reference.
///
/// Unquoted parts fold to lower case like PostgreSQL identifiers do;
/// double-quoted parts keep their case and may contain dots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidTableName(input.to_string());
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut quoted_part = false;
        let mut chars = input.trim().chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '"' if current.is_empty() && !quoted_part => {
                    quoted_part = true;
                    loop {
                        match chars.next() {
                            Some('"') if chars.peek() == Some(&'"') => {
                                chars.next();
                                current.push('"');
                            }
                            Some('"') => break,
                            Some(c) => current.push(c),
                            None => return Err(invalid()),
                        }
                    }
                    if current.is_empty() {
                        return Err(invalid());
                    }
                }
                '.' => {
                    if current.is_empty() {
                        return Err(invalid());
                    }
                    parts.push(std::mem::take(&mut current));
                    quoted_part = false;
                }
                c if quoted_part || c.is_whitespace() || c == '"' => return Err(invalid()),
                c => current.extend(c.to_lowercase()),
            }
        }
        if current.is_empty() {
            return Err(invalid());
        }
        parts.push(current);

        match parts.len() {
            1 => Ok(Self {
                schema: DEFAULT_SCHEMA.to_string(),
                name: parts.remove(0),
            }),
            2 => {
                let name = parts.remove(1);
                Ok(Self {
                    schema: parts.remove(0),
                    name,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Fully quoted identifier for use in generated SQL.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

const TABLE_ID_QUERY: &str = "SELECT to_regclass($1::text)::oid::bigint AS table_id";

const PRIMARY_KEY_QUERY: &str = "SELECT a.attname::text AS column_name,
       format_type(a.atttypid, a.atttypmod) AS sql_type
FROM pg_constraint c
JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = ANY(c.conkey)
WHERE c.contype = 'p' AND c.conrelid = $1::bigint::oid
ORDER BY array_position(c.conkey, a.attnum)";

const COLUMNS_QUERY: &str = "SELECT attname::text AS column_name
FROM pg_attribute
WHERE attrelid = $1::bigint::oid AND attnum > 0 AND NOT attisdropped
ORDER BY attnum";

/// Resolve `table_name` to its id, primary key and column list.
pub async fn resolve_table(
    executor: &dyn SqlExecutor,
    table_name: &str,
) -> Result<(WatchedTable, TableName), TriggerError> {
    let parsed = TableName::parse(table_name)?;

    let rows = executor
        .query(&Statement::new(TABLE_ID_QUERY).bind(parsed.quoted()))
        .await?;
    let table_id = match rows.first() {
        Some(row) => row.try_opt_i64("table_id")?,
        None => None,
    }
    .ok_or_else(|| SchemaError::TableNotFound(table_name.to_string()))?;

    let primary_key = executor
        .query(&Statement::new(PRIMARY_KEY_QUERY).bind(table_id))
        .await?
        .iter()
        .map(|row| {
            Ok(PrimaryKeyColumn::new(
                row.try_str("column_name")?,
                row.try_str("sql_type")?,
            ))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let columns = executor
        .query(&Statement::new(COLUMNS_QUERY).bind(table_id))
        .await?
        .iter()
        .map(|row| Ok(row.try_str("column_name")?.to_string()))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let watched = WatchedTable::new(table_id, table_name, primary_key, columns)?;
    tracing::debug!(
        "Resolved table {parsed} (id {table_id}) with primary key ({})",
        watched.primary_key_names().collect::<Vec<_>>().join(", ")
    );
    Ok((watched, parsed))
}
