//! Error types for the trigger engine.
//!
//! Startup failures (schema problems, invalid configuration, change tracking
//! not enabled) are typed so callers can react to them. Per-cycle failures
//! inside the monitor loops are plain `anyhow` errors that get logged and
//! retried on the next cycle.

use thiserror::Error;

/// Problems with the watched table's shape, detected once at startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The table name could not be parsed as `[schema.]table`.
    #[error("Invalid table name: '{0}'")]
    InvalidTableName(String),

    /// The watched table does not exist.
    #[error("Could not find table '{0}'")]
    TableNotFound(String),

    /// The watched table has no primary key.
    #[error("Could not find primary key created in table '{0}'")]
    MissingPrimaryKey(String),

    /// A primary-key column collides with a column of the lease table.
    #[error("Found reserved column name '{column}' in table '{table}'. Please rename the column; '{reserved}' is used by the lease table")]
    ReservedColumnName {
        table: String,
        column: String,
        reserved: &'static str,
    },
}

/// Invalid trigger configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric setting is below its minimum.
    #[error("Invalid value for {setting}: {value}. The minimum value is {minimum}")]
    BelowMinimum {
        setting: &'static str,
        value: u64,
        minimum: u64,
    },

    /// A numeric setting is above its maximum.
    #[error("Invalid value for {setting}: {value}. The maximum value is {maximum}")]
    AboveMaximum {
        setting: &'static str,
        value: u64,
        maximum: u64,
    },

    /// An environment override could not be parsed.
    #[error("Invalid value '{value}' for setting {key}: expected a non-negative integer")]
    InvalidOverride { key: String, value: String },
}

/// Errors returned when starting a trigger listener.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The change feed has no valid minimum version for the table.
    #[error("Change tracking is not enabled on table '{0}'")]
    ChangeTrackingNotEnabled(String),

    /// `start` was called on a listener that is not in the not-started state.
    #[error("The listener for table '{0}' has already been started")]
    AlreadyStarted(String),

    /// Any other database failure during startup.
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TriggerError>;
