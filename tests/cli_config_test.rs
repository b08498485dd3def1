//! Configuration layering as seen from the command line.

use clap::Parser;
use sql_trigger::{resolve_config, ConfigOverrides, TargetOpts, TriggerOpts};
use std::io::Write;
use std::time::Duration;
use trigger_core::UserFunctionId;

#[test]
fn test_file_then_environment_then_flags() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "max_batch_size = 10\npolling_interval_ms = 2000\nlease_interval_secs = 60"
    )
    .unwrap();

    let overrides = ConfigOverrides {
        max_attempt_count: Some(3),
        ..Default::default()
    };
    let config = resolve_config(Some(file.path()), &overrides, |key| {
        (key == "Sql_Trigger_PollingIntervalMs").then(|| "300".to_string())
    })
    .unwrap();

    assert_eq!(config.max_batch_size, 10);
    assert_eq!(config.polling_interval_ms, 300);
    assert_eq!(config.lease_interval_secs, 60);
    assert_eq!(config.max_attempt_count, 3);
    assert_eq!(config.max_changes_per_worker, 1000);
}

#[test]
fn test_legacy_batch_size_key_is_honoured() {
    let config = resolve_config(None, &ConfigOverrides::default(), |key| {
        (key == "Sql_Trigger_BatchSize").then(|| "25".to_string())
    })
    .unwrap();
    assert_eq!(config.max_batch_size, 25);
}

#[test]
fn test_bad_config_files_are_reported() {
    let missing = tempfile::tempdir().unwrap().path().join("absent.toml");
    let err = resolve_config(Some(&missing), &ConfigOverrides::default(), |_| None).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to read config file"));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_batch_size = \"lots\"").unwrap();
    let err = resolve_config(Some(file.path()), &ConfigOverrides::default(), |_| None).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "polling_interval_ms = 10").unwrap();
    let err = resolve_config(Some(file.path()), &ConfigOverrides::default(), |_| None).unwrap_err();
    assert!(format!("{err:#}").contains("PollingIntervalMs"));
}

#[test]
fn test_trigger_flags_parse_durations() {
    let opts = TriggerOpts::try_parse_from([
        "sql-trigger",
        "--polling-interval",
        "500ms",
        "--lease-interval",
        "2m",
        "--max-batch-size",
        "5",
    ])
    .unwrap();
    let overrides = opts.overrides();
    assert_eq!(overrides.polling_interval, Some(Duration::from_millis(500)));
    assert_eq!(overrides.lease_interval, Some(Duration::from_secs(120)));
    assert_eq!(overrides.max_batch_size, Some(5));

    assert!(TriggerOpts::try_parse_from(["sql-trigger", "--polling-interval", "soon"]).is_err());
}

#[test]
fn test_target_function_id_depends_on_host() {
    let opts = TargetOpts::try_parse_from([
        "sql-trigger",
        "--table",
        "dbo.products",
        "--function-name",
        "ProductsTrigger",
        "--host-id",
        "worker-pool-a",
    ])
    .unwrap();
    let target = opts.target();
    assert_eq!(target.table_name, "dbo.products");
    assert_eq!(
        target.function_id,
        UserFunctionId::new("worker-pool-a", "ProductsTrigger")
    );
}
