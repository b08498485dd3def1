//! PostgreSQL client utilities
//!
//! Connection setup shared by the CLI, the backend and the integration tests.

use anyhow::{Context, Result};
use log::error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

/// Connect and drive the connection on a background task.
///
/// The client is shared behind a mutex: a transaction holds the lock for its
/// whole duration, so statements of different transactions never interleave
/// on the same connection.
pub async fn new_postgresql_client(connection_string: &str) -> Result<Arc<Mutex<Client>>> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .context("Failed to connect to PostgreSQL")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(Arc::new(Mutex::new(client)))
}
