//! The `watch` and `metrics` commands.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex};
use trigger_core::{
    CancellationToken, Change, ChangeTrackingBackend, Executor, ScaleMetricsProvider,
    TriggerConfig, TriggerListener, TriggerTarget,
};

/// Writes every delivered change as one JSON line.
pub struct JsonLinesExecutor<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesExecutor<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[async_trait]
impl<W: Write + Send> Executor<Value> for JsonLinesExecutor<W> {
    async fn try_execute(&self, changes: Vec<Change<Value>>, _cancel: CancellationToken) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow!("Output writer lock poisoned"))?;
        for change in &changes {
            serde_json::to_writer(&mut *out, change)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }
}

/// Run a listener until `shutdown` resolves, then stop it gracefully.
pub async fn watch_until<F>(
    backend: Arc<dyn ChangeTrackingBackend>,
    target: TriggerTarget,
    config: TriggerConfig,
    executor: Arc<dyn Executor<Value>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = TriggerListener::new(target.clone(), config, backend, executor);
    listener.start().await?;
    tracing::info!(
        "Watching table {} as function {}; press Ctrl+C to stop",
        target.table_name,
        target.function_id
    );

    shutdown.await;
    tracing::info!("Shutting down");
    listener.stop().await;
    Ok(())
}

/// Backlog of one trigger target, as printed by the `metrics` command.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub table: String,
    pub function_id: String,
    pub unprocessed_change_count: i64,
    pub target_worker_count: u64,
    pub timestamp: DateTime<Utc>,
}

pub async fn report_metrics(
    backend: &dyn ChangeTrackingBackend,
    target: &TriggerTarget,
    config: &TriggerConfig,
) -> Result<MetricsReport> {
    let store = backend.open(target, config).await?;
    let provider = ScaleMetricsProvider::new(store, config.max_changes_per_worker);
    let metrics = provider.metrics().await?;
    Ok(MetricsReport {
        table: target.table_name.clone(),
        function_id: target.function_id.to_string(),
        unprocessed_change_count: metrics.unprocessed_change_count,
        target_worker_count: provider.target_worker_count(&metrics),
        timestamp: metrics.timestamp,
    })
}
