//! Database executor seam.
//!
//! The lease and watermark stores only build [`Statement`]s and read
//! [`SqlRow`]s; running them is the job of a [`SqlExecutor`]. The PostgreSQL
//! implementation lives here, and tests substitute a scripted executor.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Row};
use tracing::warn;

/// A value crossing the executor seam.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Json(JsonValue),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

/// SQL text plus positional parameters.
///
/// Every placeholder carries an explicit cast (`$1::bigint`, `$2::text`,
/// `$3::jsonb`) so parameter types never depend on inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    fn required(&self, column: &str) -> Result<&SqlValue> {
        self.get(column)
            .ok_or_else(|| anyhow!("Missing column '{column}' in result row"))
    }

    pub fn try_i64(&self, column: &str) -> Result<i64> {
        match self.required(column)? {
            SqlValue::Int(value) => Ok(*value),
            other => bail!("Expected an integer in column '{column}', got {other:?}"),
        }
    }

    pub fn try_opt_i64(&self, column: &str) -> Result<Option<i64>> {
        match self.required(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Int(value) => Ok(Some(*value)),
            other => bail!("Expected an integer in column '{column}', got {other:?}"),
        }
    }

    pub fn try_bool(&self, column: &str) -> Result<bool> {
        match self.required(column)? {
            SqlValue::Bool(value) => Ok(*value),
            other => bail!("Expected a boolean in column '{column}', got {other:?}"),
        }
    }

    pub fn try_str(&self, column: &str) -> Result<&str> {
        match self.required(column)? {
            SqlValue::Text(value) => Ok(value),
            other => bail!("Expected text in column '{column}', got {other:?}"),
        }
    }

    pub fn try_opt_json(&self, column: &str) -> Result<Option<&JsonValue>> {
        match self.required(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Json(value) => Ok(Some(value)),
            other => bail!("Expected JSON in column '{column}', got {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
        }
    }
}

/// Runs statements outside of an explicit transaction, or starts one.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Returns the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64>;

    async fn query(&self, statement: &Statement) -> Result<Vec<SqlRow>>;

    /// Run one or more parameterless statements, e.g. DDL.
    async fn execute_batch(&self, sql: &str) -> Result<()>;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SqlTransaction>>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait SqlTransaction: Send {
    async fn execute(&mut self, statement: &Statement) -> Result<u64>;

    async fn query(&mut self, statement: &Statement) -> Result<Vec<SqlRow>>;

    async fn execute_batch(&mut self, sql: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// [`SqlExecutor`] over a shared `tokio-postgres` client.
#[derive(Clone)]
pub struct PostgresExecutor {
    client: Arc<Mutex<Client>>,
}

impl PostgresExecutor {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }

    pub async fn connect(connection_string: &str) -> Result<Self> {
        Ok(Self::new(
            crate::client::new_postgresql_client(connection_string).await?,
        ))
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

fn to_params(values: &[SqlValue]) -> Vec<BoxedParam> {
    values
        .iter()
        .map(|value| -> BoxedParam {
            match value {
                // Null only ever binds to text placeholders.
                SqlValue::Null => Box::new(Option::<String>::None),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Json(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

fn param_refs(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn convert_row(row: &Row) -> Result<SqlRow> {
    let mut columns = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if *ty == Type::OID {
            row.try_get::<_, Option<u32>>(idx)?
                .map(|v| SqlValue::Int(v.into()))
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
        {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<JsonValue>>(idx)?
                .map(SqlValue::Json)
        } else {
            bail!(
                "Unsupported type {ty} for column '{}'; cast it in the query",
                column.name()
            );
        };
        columns.push((column.name().to_string(), value.unwrap_or(SqlValue::Null)));
    }
    Ok(SqlRow::new(columns))
}

async fn execute_on(client: &Client, statement: &Statement) -> Result<u64> {
    let params = to_params(&statement.params);
    client
        .execute(statement.sql.as_str(), &param_refs(&params))
        .await
        .with_context(|| format!("Failed to execute statement: {}", first_line(&statement.sql)))
}

async fn query_on(client: &Client, statement: &Statement) -> Result<Vec<SqlRow>> {
    let params = to_params(&statement.params);
    let rows = client
        .query(statement.sql.as_str(), &param_refs(&params))
        .await
        .with_context(|| format!("Failed to run query: {}", first_line(&statement.sql)))?;
    rows.iter().map(convert_row).collect()
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn execute(&self, statement: &Statement) -> Result<u64> {
        let client = self.client.lock().await;
        execute_on(&client, statement).await
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<SqlRow>> {
        let client = self.client.lock().await;
        query_on(&client, statement).await
    }

    async fn execute_batch(&self, sql: &str) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {}", first_line(sql)))
    }

    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn SqlTransaction>> {
        let client = self.client.clone().lock_owned().await;
        client
            .batch_execute(&format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql()))
            .await
            .context("Failed to begin transaction")?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }
}

/// A transaction holding the client lock until it finishes.
pub struct PostgresTransaction {
    client: Option<OwnedMutexGuard<Client>>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Client> {
        self.client
            .as_deref()
            .ok_or_else(|| anyhow!("Transaction already finished"))
    }

    async fn finish(&mut self, command: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| anyhow!("Transaction already finished"))?;
        client
            .batch_execute(command)
            .await
            .with_context(|| format!("Failed to {} transaction", command.to_lowercase()))
    }
}

#[async_trait]
impl SqlTransaction for PostgresTransaction {
    async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        execute_on(self.client()?, statement).await
    }

    async fn query(&mut self, statement: &Statement) -> Result<Vec<SqlRow>> {
        query_on(self.client()?, statement).await
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.client()?
            .batch_execute(sql)
            .await
            .with_context(|| format!("Failed to execute: {}", first_line(sql)))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        // The lock moves into the task, so nothing else can use the
        // connection until the rollback has gone through.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        warn!("Failed to roll back abandoned transaction: {e}");
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside a runtime; it was not rolled back"),
        }
    }
}
