//! The handler side of a trigger.

use crate::types::Change;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Receives batches of changes from a [`crate::ChangeMonitor`].
///
/// Returning an error abandons the batch: its leases are left to expire and
/// the rows are retried until they reach the configured attempt limit.
/// `cancel` fires when the execution is considered stuck or the monitor is
/// shutting down; implementations should return promptly once it does.
#[async_trait]
pub trait Executor<T>: Send + Sync {
    async fn try_execute(
        &self,
        changes: Vec<Change<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}
