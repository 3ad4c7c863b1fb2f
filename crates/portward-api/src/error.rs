use thiserror::Error;

/// Top-level error type for the `portward-api` crate.
///
/// Covers every failure mode the worker can observe at the model and
/// provider seams. `portward-core` keys its lifecycle transitions off the
/// predicate helpers below rather than matching variants directly.
#[derive(Debug, Error)]
pub enum Error {
    // ── Entity lookups ──────────────────────────────────────────────
    /// The named entity does not exist (or no longer exists).
    #[error("{0} not found")]
    NotFound(String),

    /// The machine has no cloud instance yet.
    #[error("{0} not provisioned")]
    NotProvisioned(String),

    /// The unit is not assigned to any machine.
    #[error("{0} not assigned to a machine")]
    NotAssigned(String),

    /// None of the requested instance ids matched a running instance.
    #[error("no matching instances found")]
    NoInstances,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The configured API key cannot be sent as a header.
    #[error("invalid API key")]
    InvalidApiKey,

    // ── API ─────────────────────────────────────────────────────────
    /// Structured error returned by the facade.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Wire formats ────────────────────────────────────────────────
    /// A protocol name outside {tcp, udp, icmp}.
    #[error("unknown protocol {value:?}")]
    UnknownProtocol { value: String },

    /// A malformed opened-ports key (no `:` separator).
    #[error("invalid ports change {key:?}")]
    InvalidPortsKey { key: String },
}

impl Error {
    /// Returns `true` if this error means the entity is gone.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            _ => false,
        }
    }

    /// Returns `true` if the machine has no cloud instance yet.
    pub fn is_not_provisioned(&self) -> bool {
        matches!(self, Self::NotProvisioned(_))
    }

    /// Returns `true` if the unit is currently unassigned.
    pub fn is_not_assigned(&self) -> bool {
        matches!(self, Self::NotAssigned(_))
    }

    /// Returns `true` if the provider reported no matching instances.
    pub fn is_no_instances(&self) -> bool {
        matches!(self, Self::NoInstances)
    }
}
