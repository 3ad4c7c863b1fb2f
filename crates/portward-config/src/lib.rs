//! Configuration for the portward worker.
//!
//! A single TOML file (`[worker]`, `[model]`, `[provider]`, `[log]`
//! sections) merged with `PORTWARD_`-prefixed environment overrides, then
//! validated and translated into the api/core config types. The worker
//! never reads config files itself — the binary loads settings here and
//! hands the typed results in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use portward_api::{ClientConfig, TlsMode};
use portward_core::FirewallMode;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML settings ───────────────────────────────────────────────────

/// Top-level settings file.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub model: EndpointSettings,

    #[serde(default)]
    pub provider: EndpointSettings,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkerSettings {
    /// `instance` or `global`.
    #[serde(default = "default_firewall_mode")]
    pub firewall_mode: String,

    /// Delay before the first restart after a worker failure (seconds).
    #[serde(default = "default_restart_initial")]
    pub restart_initial_delay_secs: u64,

    /// Upper bound on the restart backoff (seconds).
    #[serde(default = "default_restart_max")]
    pub restart_max_delay_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            firewall_mode: default_firewall_mode(),
            restart_initial_delay_secs: default_restart_initial(),
            restart_max_delay_secs: default_restart_max(),
        }
    }
}

fn default_firewall_mode() -> String {
    "instance".into()
}
fn default_restart_initial() -> u64 {
    1
}
fn default_restart_max() -> u64 {
    30
}

/// One HTTP facade endpoint (model or provider).
#[derive(Debug, Deserialize, Serialize)]
pub struct EndpointSettings {
    /// Facade base URL.
    pub endpoint: Option<String>,

    /// API key (plaintext — prefer `api_key_env`).
    pub api_key: Option<String>,

    /// Environment variable name holding the API key.
    pub api_key_env: Option<String>,

    /// Query timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Long-poll watch timeout in seconds. Must exceed the server's poll
    /// window.
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,

    /// Accept self-signed TLS certificates.
    #[serde(default)]
    pub insecure: bool,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_key_env: None,
            timeout_secs: default_timeout(),
            watch_timeout_secs: default_watch_timeout(),
            insecure: false,
            ca_cert: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_watch_timeout() -> u64 {
    90
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LogSettings {
    /// Default tracing filter, overridden by `RUST_LOG` and `-v` flags.
    pub filter: Option<String>,
}

// ── Loading ─────────────────────────────────────────────────────────

/// Resolve the settings file path via platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "portward", "portward").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("portward");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Load settings from defaults, the TOML file, and the environment.
///
/// Environment keys use `__` as the section separator, e.g.
/// `PORTWARD_WORKER__FIREWALL_MODE=global`.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("PORTWARD_").split("__"));

    let settings: Settings = figment.extract()?;
    Ok(settings)
}

// ── Validation / translation ────────────────────────────────────────

/// Parse and validate the configured firewall mode.
pub fn firewall_mode(settings: &Settings) -> Result<FirewallMode, ConfigError> {
    settings
        .worker
        .firewall_mode
        .parse()
        .map_err(|_| ConfigError::Validation {
            field: "worker.firewall_mode".into(),
            reason: format!(
                "expected 'instance' or 'global', got '{}'",
                settings.worker.firewall_mode
            ),
        })
}

/// Resolve an endpoint's API key: env var first, then plaintext.
pub fn resolve_api_key(
    endpoint: &EndpointSettings,
) -> Result<Option<SecretString>, ConfigError> {
    if let Some(ref env_name) = endpoint.api_key_env {
        if let Ok(value) = std::env::var(env_name) {
            return Ok(Some(SecretString::from(value)));
        }
    }
    if let Some(ref key) = endpoint.api_key {
        return Ok(Some(SecretString::from(key.clone())));
    }
    Ok(None)
}

/// Build a [`ClientConfig`] from one endpoint section.
pub fn client_config(
    endpoint: &EndpointSettings,
    section: &str,
) -> Result<ClientConfig, ConfigError> {
    let raw_url = endpoint
        .endpoint
        .as_deref()
        .ok_or_else(|| ConfigError::Validation {
            field: format!("{section}.endpoint"),
            reason: "no endpoint URL configured".into(),
        })?;
    let base_url: url::Url = raw_url.parse().map_err(|_| ConfigError::Validation {
        field: format!("{section}.endpoint"),
        reason: format!("invalid URL: {raw_url}"),
    })?;

    let tls = if endpoint.insecure {
        TlsMode::DangerAcceptInvalid
    } else if let Some(ref ca_path) = endpoint.ca_cert {
        TlsMode::CustomCa(ca_path.clone())
    } else {
        TlsMode::System
    };

    let mut config = ClientConfig::new(base_url);
    config.api_key = resolve_api_key(endpoint)?;
    config.tls = tls;
    config.timeout = Duration::from_secs(endpoint.timeout_secs);
    config.watch_timeout = Duration::from_secs(endpoint.watch_timeout_secs);
    Ok(config)
}

/// Restart backoff bounds for the supervising loop.
pub fn restart_backoff(settings: &Settings) -> (Duration, Duration) {
    (
        Duration::from_secs(settings.worker.restart_initial_delay_secs.max(1)),
        Duration::from_secs(settings.worker.restart_max_delay_secs.max(1)),
    )
}
