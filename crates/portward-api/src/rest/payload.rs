// ── Facade wire payloads ──

use serde::{Deserialize, Serialize};

use crate::life::Life;
use crate::ports::{IngressRule, PortRange};
use crate::provider::InstanceId;

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// One long-poll watch response: the next cursor plus the identifiers that
/// changed since the previous one. `changes` is omitted for bare notify
/// endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct WatchPayload {
    pub next: u64,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MachinePayload {
    #[allow(dead_code)]
    pub id: String,
    pub life: Life,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct InstanceIdPayload {
    pub instance_id: InstanceId,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubnetsPayload {
    pub subnets: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenedPortPayload {
    #[serde(flatten)]
    pub port_range: PortRange,
    pub unit: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenedPortsPayload {
    pub ports: Vec<OpenedPortPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UnitPayload {
    #[allow(dead_code)]
    pub name: String,
    pub life: Life,
    pub machine: Option<String>,
    pub application: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApplicationPayload {
    #[allow(dead_code)]
    pub name: String,
    pub exposed: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RulesPayload {
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RulesBody<'a> {
    pub rules: &'a [IngressRule],
}

#[derive(Debug, Serialize)]
pub(crate) struct InstanceRulesBody<'a> {
    pub machine: &'a str,
    pub rules: &'a [IngressRule],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct InstancesQuery<'a> {
    pub instance_ids: &'a [InstanceId],
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstancesPayload {
    pub instances: Vec<InstanceIdPayload>,
}

/// Empty acknowledgement body returned by mutation endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct Ack {}
