//! Configuration loading and validation tests
//!
//! Tests focus on behavior of loading from disk: defaults, validation and
//! error reporting.

use mqtt_playground::config::{ConfigError, PlaygroundConfig, DEFAULT_TOPIC};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com:8883"
client_id = "bench"
reconnect_interval_ms = 0

[console]
default_topic = "sensors/temp"
qos = 2
"#,
    );

    let config = PlaygroundConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtts://broker.example.com:8883");
    assert_eq!(config.console.default_topic, "sensors/temp");

    let options = config.connect_options().unwrap();
    assert_eq!(options.client_id.as_deref(), Some("bench"));
    assert_eq!(options.reconnect_interval, Some(Duration::ZERO));
}

#[test]
fn test_empty_file_gives_defaults() {
    let temp_file = write_config("");

    let config = PlaygroundConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config, PlaygroundConfig::default());
    assert_eq!(config.console.default_topic, DEFAULT_TOPIC);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = PlaygroundConfig::load_from_file(std::path::Path::new(
        "/nonexistent/playground.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[mqtt\nbroker_url = ");

    let result = PlaygroundConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_wrong_field_type_is_parse_error() {
    let temp_file = write_config(
        r#"
[mqtt]
keep_alive_secs = "sixty"
"#,
    );

    let result = PlaygroundConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_qos_fails_validation() {
    let temp_file = write_config(
        r#"
[console]
qos = 7
"#,
    );

    let result = PlaygroundConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_load_or_default_without_path() {
    let config = PlaygroundConfig::load_or_default(None).unwrap();
    assert_eq!(config, PlaygroundConfig::default());
}

#[test]
fn test_credentials_resolved_from_environment() {
    let temp_file = write_config(
        r#"
[mqtt]
username_env = "PLAYGROUND_CONFIG_TEST_USER"
password_env = "PLAYGROUND_CONFIG_TEST_PASS"
"#,
    );
    std::env::set_var("PLAYGROUND_CONFIG_TEST_USER", "alice");
    std::env::set_var("PLAYGROUND_CONFIG_TEST_PASS", "s3cret");

    let config = PlaygroundConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.connect_options().unwrap().credentials.unwrap();

    assert_eq!(credentials.username, "alice");
    assert_eq!(credentials.password, "s3cret");
    assert!(!format!("{credentials:?}").contains("s3cret"));
}
