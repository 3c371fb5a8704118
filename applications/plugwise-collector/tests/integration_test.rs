use plugwise_collector::config::{Config, DEFAULT_HOME_LOCATION_ID};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::path::PathBuf;

/// Test configuration loading
#[test]
#[serial]
fn test_config_loading() {
    let config_str = r#"
devices:
  stretch:
    ip: "10.0.0.17"
    username: "stretch"
    password: "$(TEST_STRETCH_ID)"
  smile:
    host: "10.0.0.35"
    port: 8080
    username: "smile"
    password: "abcdefgh"
    enabled: false

collection:
  timeout_secs: 5
  retry_attempts: 2
  interval_secs: 300

output:
  directory: "/var/lib/plugwise"
"#;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, config_str).unwrap();

    std::env::set_var("TEST_STRETCH_ID", "hgfedcba");
    std::env::remove_var("STRETCH_PASSWORD");
    std::env::remove_var("SMILE_PASSWORD");
    std::env::remove_var("DATABASE_URL");

    let config = Config::load(&path).unwrap();
    std::env::remove_var("TEST_STRETCH_ID");

    assert_eq!(config.devices.stretch.host, "10.0.0.17");
    assert_eq!(config.devices.stretch.port, 80);
    assert_eq!(config.devices.stretch.password, "hgfedcba");
    assert!(config.devices.stretch.enabled);
    assert_eq!(config.devices.smile.port, 8080);
    assert!(!config.devices.smile.enabled);

    assert_eq!(config.collection.timeout_secs, 5);
    assert_eq!(config.collection.retry_attempts, 2);
    assert_eq!(config.collection.retry_backoff_secs, 1);
    assert_eq!(config.collection.interval_secs, 300);
    assert!(config.collection.collect_meters);

    assert_eq!(config.output.directory, PathBuf::from("/var/lib/plugwise"));
    assert_eq!(config.output.power_filename_pattern, "power_usage_{date}.csv");
    assert_eq!(config.smile.home_location_id, DEFAULT_HOME_LOCATION_ID);
    assert!(config.database.is_none());
}

#[test]
#[serial]
fn test_missing_config_file_uses_defaults() {
    std::env::remove_var("STRETCH_PASSWORD");
    std::env::remove_var("SMILE_PASSWORD");
    std::env::remove_var("DATABASE_URL");

    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.yaml")).unwrap();

    assert_eq!(config.devices.stretch.host, "192.168.178.17");
    assert_eq!(config.devices.smile.host, "192.168.178.35");
    assert_eq!(config.collection.retry_attempts, 3);
    assert_eq!(config.collection.interval_secs, 60);
    assert_eq!(config.output.directory, PathBuf::from("data"));
}

#[test]
#[serial]
fn test_env_overrides_take_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "devices:\n  smile:\n    host: \"10.0.0.35\"\n    username: \"smile\"\n    password: \"from-file\"\n",
    )
    .unwrap();

    std::env::set_var("SMILE_PASSWORD", "from-env");
    std::env::set_var("DATABASE_URL", "postgres://localhost/plugwise");
    let config = Config::load(&path);
    std::env::remove_var("SMILE_PASSWORD");
    std::env::remove_var("DATABASE_URL");

    let config = config.unwrap();
    assert_eq!(config.devices.smile.password, "from-env");
    let db = config.database.unwrap();
    assert_eq!(db.url, "postgres://localhost/plugwise");
    assert_eq!(db.max_connections, 5);
}

#[test]
#[serial]
fn test_invalid_config_is_rejected() {
    std::env::remove_var("DATABASE_URL");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "collection:\n  retry_attempts: 0\n").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(err.to_string().contains("retry_attempts"));
}

#[test]
fn test_example_config_parses() {
    let raw = std::fs::read_to_string(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/config/config.example.yaml"
    ))
    .unwrap();
    let config = Config::from_yaml(&raw).unwrap();
    config.validate().unwrap();
    assert!(config.devices.stretch.enabled);
    assert!(config.devices.smile.enabled);
}
