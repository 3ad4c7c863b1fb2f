// ── Cloud-provider capability traits ──
//
// The surface the worker needs from the cloud: environment-global ingress
// rule management (global firewall mode) and per-instance management
// (instance mode).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ports::IngressRule;

/// Cloud-assigned identifier of a provisioned instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The cloud provider's network-security surface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The environment-global ingress rules currently in force
    /// (global firewall mode only).
    async fn ingress_rules(&self) -> Result<Vec<IngressRule>, Error>;

    /// Open the given rules environment-wide.
    async fn open_ports(&self, rules: &[IngressRule]) -> Result<(), Error>;

    /// Close the given rules environment-wide.
    async fn close_ports(&self, rules: &[IngressRule]) -> Result<(), Error>;

    /// Resolve instance handles for the given ids. `Err` with
    /// `is_no_instances()` when none of them match.
    async fn instances(&self, ids: &[InstanceId]) -> Result<Vec<Box<dyn Instance>>, Error>;
}

/// A single provisioned cloud instance.
#[async_trait]
pub trait Instance: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &InstanceId;

    /// The ingress rules currently in force on this instance, scoped to the
    /// given machine id.
    async fn ingress_rules(&self, machine_id: &str) -> Result<Vec<IngressRule>, Error>;

    /// Open the given rules on this instance.
    async fn open_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error>;

    /// Close the given rules on this instance.
    async fn close_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error>;
}
