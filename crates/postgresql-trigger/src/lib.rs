//! PostgreSQL backend for sql-trigger
//!
//! Uses a trigger-maintained change table per watched table, plus lease and
//! watermark tables in the reserved `sql_trigger` schema. Works with
//! PostgreSQL 11+.

pub mod change_tracking;
mod client;
pub mod lease_store;
pub mod queries;
pub mod schema;
pub mod sql;
pub mod store;
pub mod watermark_store;

pub use change_tracking::{disable_change_tracking, enable_change_tracking, min_valid_version};
pub use client::new_postgresql_client;
pub use lease_store::LeaseStore;
pub use queries::QueryFragments;
pub use schema::{resolve_table, TableName};
pub use sql::{
    IsolationLevel, PostgresExecutor, SqlExecutor, SqlRow, SqlTransaction, SqlValue, Statement,
};
pub use store::{PostgresBackend, PostgresChangeTrackingStore};
pub use watermark_store::WatermarkStore;

use anyhow::Result;
use std::sync::Arc;

/// Connect and wrap the connection in a [`PostgresBackend`].
pub async fn connect(connection_string: &str) -> Result<PostgresBackend> {
    let executor = PostgresExecutor::connect(connection_string).await?;
    Ok(PostgresBackend::new(Arc::new(executor)))
}
