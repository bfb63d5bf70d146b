//! Loading configuration files from disk.
use powergate::backend::BackendKind;
use powergate::config::Config;
use std::time::Duration;

#[tokio::test]
async fn default_file_round_trips() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("powergate.toml");
    let path = path.to_str().unwrap();

    Config::create_default(path).await.unwrap();
    let loaded = Config::load(path).await.unwrap();
    loaded.validate().unwrap();

    let defaults = Config::default();
    assert_eq!(loaded.gateway.host, defaults.gateway.host);
    assert_eq!(loaded.fleetapi.base_url, defaults.fleetapi.base_url);
    assert_ne!(loaded.fleetapi.base_url, loaded.cloud.base_url);
    assert_eq!(loaded.resilience_policy(), defaults.resilience_policy());
}

#[tokio::test]
async fn partial_file_keeps_defaults_elsewhere() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("partial.toml");
    tokio::fs::write(
        &path,
        r#"
[gateway]
password = "ABCDEFGHIJ"

[backend]
mode = "tedapi"

[cache]
status_ttl_seconds = 2

[health]
failure_threshold = 3
fail_fast = true
"#,
    )
    .await
    .unwrap();

    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    config.validate().unwrap();
    assert_eq!(config.gateway.host, "192.168.91.1");
    assert_eq!(
        config.backend.candidates().unwrap(),
        vec![BackendKind::DeviceProtocol]
    );
    assert_eq!(config.cache.ttl_for("status"), Duration::from_secs(2));
    assert_eq!(config.cache.ttl_for("config"), Duration::from_secs(5));

    let policy = config.resilience_policy();
    assert_eq!(policy.failure_threshold, 3);
    assert_eq!(policy.success_threshold, 3);
    assert!(policy.fail_fast);
    assert!(policy.graceful_degradation);
}

#[tokio::test]
async fn malformed_file_names_the_path() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("broken.toml");
    tokio::fs::write(&path, "[health\nfailure_threshold = ").await.unwrap();

    let err = Config::load(path.to_str().unwrap()).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Failed to parse"), "{message}");
    assert!(message.contains("broken.toml"), "{message}");
}

#[test]
fn missing_file_is_an_error() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("absent.toml");
    let result = tokio_test::block_on(Config::load(path.to_str().unwrap()));
    assert!(result.unwrap_err().to_string().contains("Failed to read"));
}

#[tokio::test]
async fn loaded_file_that_fails_validation() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("short.toml");
    tokio::fs::write(&path, "[health]\ndegradation_ttl_seconds = 3\n")
        .await
        .unwrap();

    let config = Config::load(path.to_str().unwrap()).await.unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("degradation_ttl_seconds"));
}
