#![allow(clippy::unwrap_used)]
// Loading and saving TOML config files.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use blocksync_api::TlsMode;
use blocksync_config::{
    Config, ConfigError, Profile, load_config_from, profile_to_node_config, save_config_to,
};

const SAMPLE: &str = r#"
default_profile = "testnet"

[logging]
level = "blocksync_core=debug,info"
json = true

[sync]
poll_interval_secs = 2
release_grace_secs = 0

[sync.reconnect]
initial_delay_ms = 250
max_retries = 6

[scanner]
limit = 64

[probes]
timeout_secs = 4

[probes.weights]
pending = 3

[profiles.testnet]
rpc_url = "https://rpc.testnet.example:9933"
insecure = true
max_retries = 1
backoff_base_ms = 100

[profiles.local]
rpc_url = "offline"
"#;

fn write_sample(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, SAMPLE).unwrap();
    path
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = load_config_from(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.default_profile.as_deref(), Some("default"));
    assert_eq!(config.logging.level, "info");
    assert!(config.profiles.is_empty());
    assert_eq!(config.sync_config().poll_interval, Duration::from_secs(5));
}

#[test]
fn test_file_values_layer_over_defaults() {
    let dir = TempDir::new().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    assert!(config.logging.json);
    assert_eq!(config.profiles.len(), 2);

    let sync = config.sync_config();
    assert_eq!(sync.poll_interval, Duration::from_secs(2));
    assert_eq!(sync.poll_timeout, Duration::from_secs(10));
    assert_eq!(sync.release_grace, Duration::ZERO);
    assert_eq!(sync.stream.reconnect.initial_delay, Duration::from_millis(250));
    assert_eq!(sync.stream.reconnect.max_delay, Duration::from_secs(30));
    assert_eq!(sync.stream.reconnect.max_retries, Some(6));
    assert_eq!(sync.scanner.limit, 64);
    assert_eq!(sync.scanner.fallback_multiplier, 4);
    assert_eq!(sync.probes.timeout, Duration::from_secs(4));
    assert_eq!(sync.probes.weights.pending, 3);
    assert_eq!(sync.probes.weights.error, 15);
}

#[test]
fn test_default_profile_resolves_to_node_config() {
    let dir = TempDir::new().unwrap();
    let config = load_config_from(&write_sample(&dir)).unwrap();

    let node = config.node_config(None).unwrap();
    assert_eq!(node.rpc_url.as_str(), "https://rpc.testnet.example:9933/");
    assert_eq!(node.stream_url.as_str(), "wss://rpc.testnet.example:9933/");
    assert!(matches!(node.transport.tls, TlsMode::DangerAcceptInvalid));
    assert_eq!(node.retry.max_retries, 1);
    assert_eq!(node.retry.backoff_base, Duration::from_millis(100));
    assert!(node.transport.auth_token.is_none());

    let local = config.node_config(Some("local")).unwrap();
    assert!(local.offline);
    assert_eq!(local.retry.max_retries, 0);

    assert!(matches!(
        config.node_config(Some("mainnet")),
        Err(ConfigError::UnknownProfile { .. })
    ));
}

#[test]
fn test_save_then_load_preserves_profiles() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::default();
    config.default_profile = Some("edge".into());
    config.sync.max_poll_failures = 5;
    config.profiles.insert(
        "edge".into(),
        Profile {
            rpc_url: "http://10.0.0.7:9933".into(),
            stream_url: Some("ws://10.0.0.7:9944".into()),
            ca_cert: Some("/etc/blocksync/ca.pem".into()),
            ..Profile::default()
        },
    );

    save_config_to(&config, &path).unwrap();
    let loaded = load_config_from(&path).unwrap();

    assert_eq!(loaded, config);
    let node = profile_to_node_config(&loaded.profiles["edge"], "edge").unwrap();
    assert_eq!(node.stream_url.as_str(), "ws://10.0.0.7:9944/");
    assert!(matches!(node.transport.tls, TlsMode::CustomCa(_)));
}

#[test]
fn test_malformed_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[sync]\npoll_interval_secs = \"soon\"\n").unwrap();

    let err = load_config_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Figment(_)));
}
