// Shared transport configuration for building reqwest::Client instances.
//
// The model and provider clients share TLS, timeout, and auth-header
// settings through this module, avoiding duplicated builder logic.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (self-signed endpoints).
    DangerAcceptInvalid,
}

/// Configuration for connecting to one HTTP facade (model or provider).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Facade base URL (e.g. `https://orchestrator:17070`).
    pub base_url: url::Url,
    /// API key sent as `X-API-Key` on every request, if set.
    pub api_key: Option<SecretString>,
    /// TLS verification mode.
    pub tls: TlsMode,
    /// Per-request timeout for queries.
    pub timeout: Duration,
    /// Per-request timeout for long-poll watch requests. Should comfortably
    /// exceed the server's poll window.
    pub watch_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            base_url,
            api_key: None,
            tls: TlsMode::default(),
            timeout: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(90),
        }
    }

    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(ref key) = self.api_key {
            let mut value = reqwest::header::HeaderValue::from_str(key.expose_secret())
                .map_err(|_| Error::InvalidApiKey)?;
            value.set_sensitive(true);
            headers.insert("X-API-Key", value);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("portward/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}
