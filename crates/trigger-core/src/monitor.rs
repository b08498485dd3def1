//! The change monitor: poll, lease, execute, release.
//!
//! Each monitor runs two tasks against one [`ChangeTrackingStore`]:
//!
//! - the poll loop fetches and leases a batch while the monitor is checking
//!   for changes, hands it to the executor, and releases the leases and tries
//!   to advance the watermark when the executor succeeds
//! - the renewal loop extends the leases of the in-flight batch every half
//!   lease interval and cancels the execution once it has spanned
//!   `max_lease_renewal_count` renewals
//!
//! Both loops share the in-memory batch state behind one async mutex. Errors
//! inside a cycle are logged and the cycle is retried on the next tick; the
//! loops themselves never exit until the monitor is stopped.

use crate::config::TriggerConfig;
use crate::executor::Executor;
use crate::store::ChangeTrackingStore;
use crate::types::{candidate_version, materialize, ChangeRow, MonitorState, WatchedTable};
use serde::de::DeserializeOwned;
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one poll of the change feed.
#[derive(Debug)]
pub enum PollResult {
    /// Leased rows, in change-version order
    Batch(Vec<ChangeRow>),
    /// Nothing eligible past the watermark
    Empty,
    /// The poll failed; the next cycle starts over
    TransientError(anyhow::Error),
}

struct BatchState {
    state: MonitorState,
    rows: Vec<ChangeRow>,
    lease_renewal_count: u32,
}

impl BatchState {
    fn clear(&mut self) {
        self.state = MonitorState::CheckingForChanges;
        self.rows.clear();
        self.lease_renewal_count = 0;
    }
}

struct MonitorInner<T> {
    store: Arc<dyn ChangeTrackingStore>,
    executor: Arc<dyn Executor<T>>,
    config: TriggerConfig,
    batch: Mutex<BatchState>,
    execution_token: std::sync::Mutex<CancellationToken>,
}

/// Watches one table and feeds its changes to an executor.
pub struct ChangeMonitor<T> {
    inner: Arc<MonitorInner<T>>,
    poll_shutdown: CancellationToken,
    renewal_shutdown: CancellationToken,
    poll_task: Option<JoinHandle<()>>,
    renewal_task: Option<JoinHandle<()>>,
}

impl<T> ChangeMonitor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Spawn the poll and renewal loops. Must be called within a tokio runtime.
    pub fn start(
        store: Arc<dyn ChangeTrackingStore>,
        executor: Arc<dyn Executor<T>>,
        config: TriggerConfig,
    ) -> Self {
        let inner = Arc::new(MonitorInner {
            store,
            executor,
            config,
            batch: Mutex::new(BatchState {
                state: MonitorState::CheckingForChanges,
                rows: Vec::new(),
                lease_renewal_count: 0,
            }),
            execution_token: std::sync::Mutex::new(CancellationToken::new()),
        });

        let poll_shutdown = CancellationToken::new();
        let renewal_shutdown = CancellationToken::new();

        let poll_task = tokio::spawn(
            inner
                .clone()
                .run_poll_loop(poll_shutdown.clone(), renewal_shutdown.clone()),
        );
        let renewal_task = tokio::spawn(inner.clone().run_renewal_loop(renewal_shutdown.clone()));

        Self {
            inner,
            poll_shutdown,
            renewal_shutdown,
            poll_task: Some(poll_task),
            renewal_task: Some(renewal_task),
        }
    }

    pub fn table(&self) -> &WatchedTable {
        self.inner.store.table()
    }

    pub async fn state(&self) -> MonitorState {
        self.inner.batch.lock().await.state
    }

    /// Stop polling, wait for an in-flight execution to finish, then stop
    /// the renewal loop.
    ///
    /// The renewal loop keeps running while the last batch drains, so an
    /// execution that never returns is still cancelled as stuck.
    pub async fn stop(mut self) {
        let table = self.inner.store.table().name.clone();
        self.poll_shutdown.cancel();
        if let Some(task) = self.poll_task.take() {
            if let Err(e) = task.await {
                error!("Change consumption loop for table {table} terminated abnormally: {e}");
            }
        }
        self.renewal_shutdown.cancel();
        if let Some(task) = self.renewal_task.take() {
            if let Err(e) = task.await {
                error!("Lease renewal loop for table {table} terminated abnormally: {e}");
            }
        }
        info!("Stopped change monitor for table {table}");
    }
}

impl<T> Drop for ChangeMonitor<T> {
    fn drop(&mut self) {
        self.poll_shutdown.cancel();
        self.renewal_shutdown.cancel();
        self.inner
            .execution_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

impl<T> MonitorInner<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn table_name(&self) -> &str {
        &self.store.table().name
    }

    fn current_execution_token(&self) -> CancellationToken {
        self.execution_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_poll_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
        renewal_shutdown: CancellationToken,
    ) {
        info!(
            "Starting change consumption loop for table {} (max batch size {}, polling interval {:?})",
            self.table_name(),
            self.config.max_batch_size,
            self.config.polling_interval()
        );

        while !shutdown.is_cancelled() {
            let batch_was_full = self.check_and_process().await;

            // A full batch means there is likely more waiting; poll again at once.
            if batch_was_full {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.polling_interval()) => {}
            }
        }

        renewal_shutdown.cancel();
        info!(
            "Change consumption loop for table {} exited",
            self.table_name()
        );
    }

    async fn poll(&self) -> PollResult {
        match self.store.poll_changes().await {
            Ok(rows) if rows.is_empty() => PollResult::Empty,
            Ok(rows) => PollResult::Batch(rows),
            Err(e) => PollResult::TransientError(e),
        }
    }

    /// Run one poll cycle. Returns true when the batch came back full.
    async fn check_and_process(&self) -> bool {
        let rows = {
            let mut batch = self.batch.lock().await;
            if batch.state != MonitorState::CheckingForChanges {
                return false;
            }

            match self.poll().await {
                PollResult::Empty => return false,
                PollResult::TransientError(e) => {
                    error!(
                        "Failed to check for changes in table {}: {e:#}",
                        self.table_name()
                    );
                    batch.clear();
                    return false;
                }
                PollResult::Batch(rows) => {
                    debug!(
                        "Leased {} changes in table {} (versions {}..={})",
                        rows.len(),
                        self.table_name(),
                        rows.first().map(|r| r.version).unwrap_or_default(),
                        rows.last().map(|r| r.version).unwrap_or_default()
                    );
                    batch.state = MonitorState::ProcessingChanges;
                    batch.rows = rows.clone();
                    batch.lease_renewal_count = 0;
                    rows
                }
            }
        };

        let batch_was_full = rows.len() >= self.config.max_batch_size;
        self.process_batch(rows).await;
        batch_was_full
    }

    async fn process_batch(&self, rows: Vec<ChangeRow>) {
        let changes = match materialize::<T>(&rows) {
            Ok(changes) => changes,
            Err(e) => {
                error!(
                    "Failed to compose changes for table {}, abandoning batch of {}: {e:#}",
                    self.table_name(),
                    rows.len()
                );
                self.clear_batch().await;
                return;
            }
        };

        let final_attempts = rows
            .iter()
            .filter(|r| r.attempt_count >= self.config.max_attempt_count)
            .count();
        if final_attempts > 0 {
            warn!(
                "{final_attempts} changes in table {} are on their final attempt",
                self.table_name()
            );
        }

        let token = self.current_execution_token();
        let started = Instant::now();
        match self.executor.try_execute(changes, token).await {
            Ok(()) => {
                debug!(
                    "Executed batch of {} changes from table {} in {:?}",
                    rows.len(),
                    self.table_name(),
                    started.elapsed()
                );
                self.release_batch(&rows).await;
            }
            Err(e) => {
                error!(
                    "Failed to execute batch of {} changes from table {}: {e:#}",
                    rows.len(),
                    self.table_name()
                );
                self.log_dead_letters(&rows);
                self.clear_batch().await;
            }
        }
    }

    fn log_dead_letters(&self, rows: &[ChangeRow]) {
        for row in rows
            .iter()
            .filter(|r| r.attempt_count >= self.config.max_attempt_count)
        {
            error!(
                "Change at version {} with key {} in table {} failed {} times and will not be retried",
                row.version,
                serde_json::Value::Object(row.primary_key.clone()),
                self.table_name(),
                row.attempt_count
            );
        }
    }

    async fn release_batch(&self, rows: &[ChangeRow]) {
        let mut batch = self.batch.lock().await;
        if let Some(candidate) = candidate_version(rows) {
            match self.store.release_leases(rows, candidate).await {
                Ok(true) => debug!(
                    "Advanced watermark for table {} to {candidate}",
                    self.table_name()
                ),
                Ok(false) => debug!(
                    "Watermark for table {} not advanced to {candidate}; earlier changes are still outstanding",
                    self.table_name()
                ),
                Err(e) => error!(
                    "Failed to release leases for table {}: {e:#}",
                    self.table_name()
                ),
            }
        }
        batch.clear();
    }

    async fn clear_batch(&self) {
        self.batch.lock().await.clear();
    }

    async fn run_renewal_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.lease_renewal_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.renew_leases().await;
        }
        debug!("Lease renewal loop for table {} exited", self.table_name());
    }

    async fn renew_leases(&self) {
        let mut batch = self.batch.lock().await;
        if batch.state != MonitorState::ProcessingChanges {
            return;
        }

        match self.store.renew_leases(&batch.rows).await {
            Ok(renewed) if renewed < batch.rows.len() as u64 => warn!(
                "Renewed {renewed} of {} leases for table {}; the rest are no longer held",
                batch.rows.len(),
                self.table_name()
            ),
            Ok(renewed) => debug!(
                "Renewed {renewed} leases for table {}",
                self.table_name()
            ),
            Err(e) => error!(
                "Failed to renew leases for table {}: {e:#}",
                self.table_name()
            ),
        }

        batch.lease_renewal_count += 1;
        if batch.lease_renewal_count == self.config.max_lease_renewal_count {
            let mut token = self
                .execution_token
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !token.is_cancelled() {
                warn!(
                    "Execution of a batch from table {} spanned {} lease renewals; cancelling it",
                    self.table_name(),
                    batch.lease_renewal_count
                );
                token.cancel();
                *token = CancellationToken::new();
            }
        }
    }
}
