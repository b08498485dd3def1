//! Listener lifecycle: one change monitor per registered function.

use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::executor::Executor;
use crate::metrics::ScaleMetricsProvider;
use crate::monitor::ChangeMonitor;
use crate::store::ChangeTrackingBackend;
use crate::types::TriggerTarget;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Lifecycle of a [`TriggerListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    NotStarted = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Stopped = 4,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Running<T> {
    monitor: ChangeMonitor<T>,
    metrics: ScaleMetricsProvider,
}

/// Starts and stops the change monitor for one trigger target.
pub struct TriggerListener<T> {
    target: TriggerTarget,
    config: TriggerConfig,
    backend: Arc<dyn ChangeTrackingBackend>,
    executor: Arc<dyn Executor<T>>,
    state: AtomicU8,
    running: Mutex<Option<Running<T>>>,
}

impl<T> TriggerListener<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        target: TriggerTarget,
        config: TriggerConfig,
        backend: Arc<dyn ChangeTrackingBackend>,
        executor: Arc<dyn Executor<T>>,
    ) -> Self {
        Self {
            target,
            config,
            backend,
            executor,
            state: AtomicU8::new(ListenerState::NotStarted as u8),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ListenerState, to: ListenerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Validate the configuration, prepare the lease and watermark state and
    /// start the monitor.
    ///
    /// Fails with [`TriggerError::AlreadyStarted`] unless the listener has
    /// never been started. A failed start leaves the listener startable again.
    pub async fn start(&self) -> Result<()> {
        if !self.transition(ListenerState::NotStarted, ListenerState::Starting) {
            return Err(TriggerError::AlreadyStarted(self.target.table_name.clone()));
        }

        match self.open().await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                self.state
                    .store(ListenerState::Started as u8, Ordering::SeqCst);
                info!(
                    "Started trigger listener for table {} (function {})",
                    self.target.table_name, self.target.function_id
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to start trigger listener for table {}: {e}",
                    self.target.table_name
                );
                self.state
                    .store(ListenerState::NotStarted as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Running<T>> {
        self.config.validate()?;
        let store = self.backend.open(&self.target, &self.config).await?;
        let metrics = ScaleMetricsProvider::new(store.clone(), self.config.max_changes_per_worker);
        let monitor = ChangeMonitor::start(store, self.executor.clone(), self.config.clone());
        Ok(Running { monitor, metrics })
    }

    /// Stop the monitor, letting an in-flight batch finish first.
    /// Stopping a listener that is not running does nothing.
    pub async fn stop(&self) {
        if !self.transition(ListenerState::Started, ListenerState::Stopping) {
            return;
        }
        if let Some(running) = self.running.lock().await.take() {
            running.monitor.stop().await;
        }
        self.state
            .store(ListenerState::Stopped as u8, Ordering::SeqCst);
        info!(
            "Stopped trigger listener for table {}",
            self.target.table_name
        );
    }

    /// Backlog metrics for the running trigger.
    pub async fn scale_metrics_provider(&self) -> Option<ScaleMetricsProvider> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.metrics.clone())
    }
}
