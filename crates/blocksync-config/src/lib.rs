//! Shared configuration for blocksync consumers.
//!
//! TOML profiles layered with `BLOCKSYNC_` environment overrides, bearer
//! token resolution (env + plaintext), translation to the runtime
//! `blocksync_core` config types, and tracing subscriber setup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blocksync_api::{ReconnectConfig, RetryPolicy, StreamConfig, TlsMode, TransportConfig};
use blocksync_core::{NodeConfig, ProbeConfig, ScannerConfig, ScoreWeights, SyncConfig};
use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Environment prefix; `__` separates nested keys
/// (`BLOCKSYNC_SYNC__POLL_INTERVAL_SECS=2`).
pub const ENV_PREFIX: &str = "BLOCKSYNC_";

/// Placeholder endpoints for offline profiles. Port 0 is never dialled.
const OFFLINE_RPC_URL: &str = "http://127.0.0.1:0";
const OFFLINE_STREAM_URL: &str = "ws://127.0.0.1:0";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("no auth token available for profile '{profile}' (env var '{env}' is unset)")]
    MissingToken { profile: String, env: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("failed to initialise logging: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub scanner: ScannerSection,

    #[serde(default)]
    pub probes: ProbeSection,

    /// Named node profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            logging: LoggingConfig::default(),
            sync: SyncSection::default(),
            scanner: ScannerSection::default(),
            probes: ProbeSection::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Include the event target (module path).
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            with_target: false,
        }
    }
}

/// `[sync]`: subscription and stream timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub max_poll_failures: u32,
    pub release_grace_secs: u64,
    pub connect_timeout_secs: u64,
    /// 0 disables outbound heartbeats.
    pub heartbeat_secs: u64,
    /// 0 disables idle detection.
    pub idle_timeout_secs: u64,
    pub reconnect: ReconnectSection,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            poll_timeout_secs: 10,
            max_poll_failures: 3,
            release_grace_secs: 5,
            connect_timeout_secs: 10,
            heartbeat_secs: 15,
            idle_timeout_secs: 45,
            reconnect: ReconnectSection::default(),
        }
    }
}

/// `[sync.reconnect]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Unset retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: None,
        }
    }
}

/// `[scanner]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScannerSection {
    pub limit: u32,
    pub fallback_multiplier: u32,
    pub max_pages: u32,
}

impl Default for ScannerSection {
    fn default() -> Self {
        let defaults = ScannerConfig::default();
        Self {
            limit: defaults.limit,
            fallback_multiplier: defaults.fallback_multiplier,
            max_pages: defaults.max_pages,
        }
    }
}

/// `[probes]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_secs: u64,
    pub weights: ScoreWeights,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            weights: ScoreWeights::default(),
        }
    }
}

/// A named node profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Profile {
    /// JSON-RPC endpoint. `"offline"` / `"none"` or port 0 mean offline.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Envelope stream endpoint. Derived from `rpc_url` (http→ws,
    /// https→wss) when unset.
    pub stream_url: Option<String>,

    /// Force offline mode.
    #[serde(default)]
    pub offline: bool,

    /// Bearer token (plaintext; prefer `auth_token_env`).
    pub auth_token: Option<String>,

    /// Environment variable holding the bearer token.
    pub auth_token_env: Option<String>,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Accept invalid certificates.
    #[serde(default)]
    pub insecure: bool,

    /// HTTP timeout in seconds.
    pub timeout: Option<u64>,

    /// RPC retries after the first attempt.
    pub max_retries: Option<u32>,

    /// First RPC retry delay; doubles per retry.
    pub backoff_base_ms: Option<u64>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            stream_url: None,
            offline: false,
            auth_token: None,
            auth_token_env: None,
            ca_cert: None,
            insecure: false,
            timeout: None,
            max_retries: None,
            backoff_base_ms: None,
        }
    }
}

fn default_rpc_url() -> String {
    "http://localhost:8545".into()
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "blocksync", "blocksync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("blocksync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path` (if present), then the
/// `BLOCKSYNC_` environment.
pub fn config_figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load the full Config from the platform config file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), exists = path.exists(), "Loading config");
    let config: Config = config_figment(path).extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Profiles ────────────────────────────────────────────────────────

impl Config {
    /// Look up `name`, or the default profile when `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }

    /// Node config for `name` (or the default profile).
    pub fn node_config(&self, name: Option<&str>) -> Result<NodeConfig, ConfigError> {
        let (name, profile) = self.profile(name)?;
        profile_to_node_config(profile, name)
    }

    /// Runtime sync settings from `[sync]`, `[scanner]`, and `[probes]`.
    pub fn sync_config(&self) -> SyncConfig {
        let sync = &self.sync;
        SyncConfig {
            stream: StreamConfig {
                reconnect: ReconnectConfig {
                    initial_delay: Duration::from_millis(sync.reconnect.initial_delay_ms),
                    max_delay: Duration::from_millis(sync.reconnect.max_delay_ms),
                    max_retries: sync.reconnect.max_retries,
                },
                connect_timeout: Duration::from_secs(sync.connect_timeout_secs),
                heartbeat_interval: Duration::from_secs(sync.heartbeat_secs),
                idle_timeout: Duration::from_secs(sync.idle_timeout_secs),
                ..StreamConfig::default()
            },
            poll_interval: Duration::from_secs(sync.poll_interval_secs),
            poll_timeout: Duration::from_secs(sync.poll_timeout_secs),
            max_poll_failures: sync.max_poll_failures,
            release_grace: Duration::from_secs(sync.release_grace_secs),
            scanner: ScannerConfig {
                limit: self.scanner.limit,
                fallback_multiplier: self.scanner.fallback_multiplier,
                max_pages: self.scanner.max_pages,
            },
            probes: ProbeConfig {
                timeout: Duration::from_secs(self.probes.timeout_secs),
                weights: self.probes.weights,
            },
        }
    }
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the bearer token: the profile's `auth_token_env` variable,
/// then plaintext. `Ok(None)` when the profile configures neither.
pub fn resolve_auth_token(
    profile: &Profile,
    profile_name: &str,
) -> Result<Option<SecretString>, ConfigError> {
    resolve_auth_token_with(profile, profile_name, |key| std::env::var(key).ok())
}

/// [`resolve_auth_token`] with a custom environment lookup.
pub fn resolve_auth_token_with(
    profile: &Profile,
    profile_name: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Option<SecretString>, ConfigError> {
    // 1. Profile's auth_token_env → env var lookup
    if let Some(ref env_name) = profile.auth_token_env {
        if let Some(val) = env(env_name).filter(|v| !v.is_empty()) {
            return Ok(Some(SecretString::from(val)));
        }
    }

    // 2. Plaintext in config
    if let Some(ref token) = profile.auth_token {
        return Ok(Some(SecretString::from(token.clone())));
    }

    match &profile.auth_token_env {
        Some(env_name) => Err(ConfigError::MissingToken {
            profile: profile_name.into(),
            env: env_name.clone(),
        }),
        None => Ok(None),
    }
}

// ── Translation ─────────────────────────────────────────────────────

/// `true` for the `"offline"` / `"none"` URL keywords.
fn is_offline_keyword(url: &str) -> bool {
    let url = url.trim();
    url.eq_ignore_ascii_case("offline") || url.eq_ignore_ascii_case("none")
}

fn parse_url(field: &str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url: Url = raw.trim().parse().map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("expected {} URL, got '{raw}'", schemes.join("/")),
        });
    }
    Ok(url)
}

/// Stream URL on the same host and path as `rpc`, with a ws scheme.
pub fn derive_stream_url(rpc: &Url) -> Result<Url, ConfigError> {
    let scheme = if rpc.scheme() == "https" { "wss" } else { "ws" };
    let mut url = rpc.clone();
    url.set_scheme(scheme).map_err(|()| ConfigError::Validation {
        field: "stream_url".into(),
        reason: format!("cannot derive a stream URL from '{rpc}'"),
    })?;
    Ok(url)
}

/// Build a `NodeConfig` from a profile.
pub fn profile_to_node_config(
    profile: &Profile,
    profile_name: &str,
) -> Result<NodeConfig, ConfigError> {
    let keyword = is_offline_keyword(&profile.rpc_url);
    let rpc_url = if keyword {
        parse_url("rpc_url", OFFLINE_RPC_URL, &["http"])?
    } else {
        parse_url("rpc_url", &profile.rpc_url, &["http", "https"])?
    };
    let offline = profile.offline || keyword || rpc_url.port() == Some(0);

    let stream_url = match &profile.stream_url {
        Some(raw) => parse_url("stream_url", raw, &["ws", "wss"])?,
        None if keyword => parse_url("stream_url", OFFLINE_STREAM_URL, &["ws"])?,
        None => derive_stream_url(&rpc_url)?,
    };

    let tls = if profile.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    let retry = if offline {
        RetryPolicy::none()
    } else {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: profile.max_retries.unwrap_or(defaults.max_retries),
            backoff_base: profile
                .backoff_base_ms
                .map_or(defaults.backoff_base, Duration::from_millis),
        }
    };

    Ok(NodeConfig {
        rpc_url,
        stream_url,
        offline,
        transport: TransportConfig {
            tls,
            timeout: Duration::from_secs(profile.timeout.unwrap_or(30)),
            auth_token: resolve_auth_token(profile, profile_name)?,
        },
        retry,
    })
}

// ── Logging ─────────────────────────────────────────────────────────

/// Install the global tracing subscriber. `RUST_LOG` overrides
/// `config.level`. Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ConfigError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(config, rust_log.as_deref())?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}

/// `rust_log` wins when it parses; otherwise `config.level` must.
fn log_filter(config: &LoggingConfig, rust_log: Option<&str>) -> Result<EnvFilter, ConfigError> {
    match rust_log.and_then(|directives| EnvFilter::try_new(directives).ok()) {
        Some(filter) => Ok(filter),
        None => EnvFilter::try_new(&config.level)
            .map_err(|e| ConfigError::Logging(format!("invalid level '{}': {e}", config.level))),
    }
}
