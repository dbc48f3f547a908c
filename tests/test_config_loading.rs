//! Configuration loading and validation tests
//!
//! Tests focus on behavior of configuration loading, validation, and the
//! settings maps handed to receivers.

mod test_helpers;

use msgrelay::config::{ConfigError, RuntimeConfig};
use msgrelay::receivers::{HttpReceiver, Receiver, ScheduledReceiver};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[runtime]
id = "relay-eu-1"
pipeline = "receive"

[scheduler]
min_interval_secs = 2
max_interval_secs = 10

[http]
bind_address = "127.0.0.1:0"
submit_path = "/as2"

[[pickup]]
key = "partner-a"
directory = "/srv/pickup/a"
"#
    )
    .unwrap();

    let config = RuntimeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.runtime.id, "relay-eu-1");
    assert_eq!(config.scheduler.min_interval_secs, 2.0);
    assert_eq!(config.scheduler.max_interval_secs, 10.0);
    assert_eq!(config.http.as_ref().unwrap().submit_path, "/as2");
    assert_eq!(config.pickup[0].key, "partner-a");
}

#[test]
fn test_missing_file_is_read_error() {
    let result = RuntimeConfig::load_from_file(std::path::Path::new("/nonexistent/msgrelay.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[runtime\nid = ").unwrap();

    let result = RuntimeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_runtime_id_is_rejected() {
    let result = RuntimeConfig::from_toml_str("[runtime]\nid = \"has spaces\"\n");
    assert!(matches!(result, Err(ConfigError::InvalidRuntimeId(_))));
}

#[test]
fn test_non_finite_scheduler_interval_is_rejected() {
    let result = RuntimeConfig::from_toml_str(
        "[runtime]\nid = \"relay\"\n\n[scheduler]\nmin_interval_secs = nan\n",
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_settings_maps_configure_receivers() {
    let mut config = test_helpers::test_config();
    config.scheduler.min_interval_secs = 3.0;
    config.scheduler.max_interval_secs = 30.0;

    let mut http = HttpReceiver::new("http");
    http.configure(&config.http_settings().unwrap()).unwrap();
    assert_eq!(http.max_concurrent_accepts(), 16);

    let mut scheduled = ScheduledReceiver::new("pickup");
    scheduled.configure(&config.scheduler_settings()).unwrap();
    assert_eq!(
        scheduled.bounds(),
        (Duration::from_secs(3), Duration::from_secs(30))
    );
}
