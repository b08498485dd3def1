//! sql-trigger
//!
//! Delivers row changes of a PostgreSQL table to a handler, at least once,
//! with any number of workers sharing the load through lease tables.
//!
//! # CLI Usage
//!
//! ```bash
//! # Install the change feed on a table
//! sql-trigger enable --connection-string postgresql://... --table public.products
//!
//! # Print every change as a JSON line until Ctrl+C
//! sql-trigger watch --connection-string postgresql://... \
//!   --table public.products --function-name ProductsTrigger
//!
//! # Report the unprocessed backlog
//! sql-trigger metrics --connection-string postgresql://... \
//!   --table public.products --function-name ProductsTrigger
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use trigger_core::{TriggerConfig, TriggerTarget, UserFunctionId};

pub mod config;
pub mod watch;

pub use config::{parse_duration, resolve_config, ConfigOverrides};
pub use watch::{report_metrics, watch_until, JsonLinesExecutor, MetricsReport};

#[derive(Parser, Clone, Debug)]
pub struct ConnectionOpts {
    /// PostgreSQL connection string
    #[arg(long, env = "SQL_TRIGGER_CONNECTION_STRING")]
    pub connection_string: String,
}

#[derive(Parser, Clone, Debug)]
pub struct TargetOpts {
    /// Table to watch, as [schema.]name
    #[arg(long)]
    pub table: String,

    /// Name of the function consuming the changes
    #[arg(long)]
    pub function_name: String,

    /// Host identifier; workers with the same host id and function name
    /// share one set of leases
    #[arg(long, default_value = "sql-trigger", env = "SQL_TRIGGER_HOST_ID")]
    pub host_id: String,
}

impl TargetOpts {
    pub fn target(&self) -> TriggerTarget {
        TriggerTarget::new(
            UserFunctionId::new(&self.host_id, &self.function_name),
            self.table.clone(),
        )
    }
}

#[derive(Parser, Clone, Debug, Default)]
pub struct TriggerOpts {
    /// TOML file with trigger settings
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum number of changes per batch
    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Delay between polls (e.g. 500ms, 5s)
    #[arg(long, value_parser = parse_duration)]
    pub polling_interval: Option<Duration>,

    /// Backlog one worker is expected to absorb
    #[arg(long)]
    pub max_changes_per_worker: Option<u64>,

    /// Lease duration (e.g. 30s, 2m)
    #[arg(long, value_parser = parse_duration)]
    pub lease_interval: Option<Duration>,

    /// Attempts per change before it is given up on
    #[arg(long)]
    pub max_attempt_count: Option<u32>,
}

impl TriggerOpts {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_batch_size: self.max_batch_size,
            polling_interval: self.polling_interval,
            max_changes_per_worker: self.max_changes_per_worker,
            lease_interval: self.lease_interval,
            max_attempt_count: self.max_attempt_count,
        }
    }

    /// Effective settings: defaults, config file, environment, then flags.
    pub fn load(&self) -> anyhow::Result<TriggerConfig> {
        resolve_config(self.config.as_deref(), &self.overrides(), |key| {
            std::env::var(key).ok()
        })
    }
}
