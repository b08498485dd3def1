//! Change monitor and lease protocol for sql-trigger
//!
//! Watches a table's change feed and delivers every change to an
//! [`Executor`], coordinating any number of concurrent workers through two
//! durable structures kept next to the watched table:
//!
//! - a lease table per (function, table) recording which primary-key tuples
//!   are being processed, at which change version, and how many attempts
//!   have been made
//! - a watermark per (function, table): the last change version known to be
//!   fully processed with no gaps
//!
//! # Architecture
//!
//! - [`ChangeTrackingBackend`] / [`ChangeTrackingStore`] abstract the storage
//!   engine. `MemoryDatabase` implements them in-process; the PostgreSQL
//!   implementation lives in the `sql-trigger-postgresql` crate.
//! - [`ChangeMonitor`] runs the poll loop and the lease-renewal loop.
//! - [`TriggerListener`] owns the start/stop lifecycle of one monitor.
//! - [`ScaleMetricsProvider`] reports the unprocessed backlog.

pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod monitor;
pub mod store;
pub mod types;

pub use config::TriggerConfig;
pub use error::{ConfigError, Result, SchemaError, TriggerError};
pub use executor::Executor;
pub use listener::{ListenerState, TriggerListener};
pub use memory::MemoryDatabase;
pub use metrics::{ScaleMetrics, ScaleMetricsProvider};
pub use monitor::{ChangeMonitor, PollResult};
pub use store::{ChangeTrackingBackend, ChangeTrackingStore};
pub use types::{
    candidate_version, Change, ChangeOperation, ChangeRow, MonitorState, PrimaryKeyColumn,
    RowValues, TriggerTarget, UserFunctionId, WatchedTable, RESERVED_LEASE_COLUMNS,
};

// Re-exported so executors and callers share one token type with the monitor
pub use tokio_util::sync::CancellationToken;
