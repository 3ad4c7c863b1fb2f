// ── REST model client ──

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::life::Life;
use crate::model::{Application, Machine, ModelApi, Unit};
use crate::ports::PortRange;
use crate::provider::InstanceId;
use crate::tags::{ApplicationTag, MachineTag, SubnetTag, UnitTag};
use crate::transport::ClientConfig;
use crate::watch::{NotifyWatcher, StringsWatcher};

use super::payload::{
    ApplicationPayload, InstanceIdPayload, MachinePayload, OpenedPortsPayload, SubnetsPayload,
    UnitPayload,
};
use super::watch::{spawn_notify_watch, spawn_strings_watch};
use super::RestClient;

/// REST implementation of [`ModelApi`].
pub struct RestModel {
    client: Arc<RestClient>,
}

impl RestModel {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            client: Arc::new(RestClient::new(config)?),
        })
    }
}

#[async_trait]
impl ModelApi for RestModel {
    async fn watch_model_machines(&self) -> Result<StringsWatcher, Error> {
        Ok(spawn_strings_watch(
            Arc::clone(&self.client),
            vec!["v1".into(), "watch".into(), "machines".into()],
        ))
    }

    async fn watch_opened_ports(&self) -> Result<StringsWatcher, Error> {
        Ok(spawn_strings_watch(
            Arc::clone(&self.client),
            vec!["v1".into(), "watch".into(), "opened-ports".into()],
        ))
    }

    async fn machine(&self, tag: &MachineTag) -> Result<Box<dyn Machine>, Error> {
        let url = self.client.api_url(&["v1", "machines", tag.id()]);
        let payload: MachinePayload = self.client.get_json(url).await?;
        Ok(Box::new(RestMachine {
            client: Arc::clone(&self.client),
            tag: tag.clone(),
            life: payload.life,
        }))
    }

    async fn unit(&self, tag: &UnitTag) -> Result<Box<dyn Unit>, Error> {
        let url = self.client.api_url(&["v1", "units", tag.name()]);
        let payload: UnitPayload = self.client.get_json(url).await?;
        Ok(Box::new(RestUnit {
            client: Arc::clone(&self.client),
            tag: tag.clone(),
            life: payload.life,
            machine: payload.machine,
            application: payload.application,
        }))
    }
}

/// Machine handle with the lifecycle state snapshotted at fetch time.
struct RestMachine {
    client: Arc<RestClient>,
    tag: MachineTag,
    life: Life,
}

impl std::fmt::Debug for RestMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestMachine")
            .field("tag", &self.tag)
            .field("life", &self.life)
            .finish()
    }
}

#[async_trait]
impl Machine for RestMachine {
    fn tag(&self) -> &MachineTag {
        &self.tag
    }

    fn life(&self) -> Life {
        self.life
    }

    async fn instance_id(&self) -> Result<InstanceId, Error> {
        let url = self
            .client
            .api_url(&["v1", "machines", self.tag.id(), "instance"]);
        let payload: InstanceIdPayload = self.client.get_json(url).await?;
        Ok(payload.instance_id)
    }

    async fn active_subnets(&self) -> Result<Vec<SubnetTag>, Error> {
        let url = self
            .client
            .api_url(&["v1", "machines", self.tag.id(), "subnets"]);
        let payload: SubnetsPayload = self.client.get_json(url).await?;
        Ok(payload.subnets.into_iter().map(SubnetTag::new).collect())
    }

    async fn opened_ports(
        &self,
        subnet: &SubnetTag,
    ) -> Result<HashMap<PortRange, UnitTag>, Error> {
        let mut url = self
            .client
            .api_url(&["v1", "machines", self.tag.id(), "opened-ports"]);
        url.query_pairs_mut().append_pair("subnet", subnet.cidr());
        let payload: OpenedPortsPayload = self.client.get_json(url).await?;
        Ok(payload
            .ports
            .into_iter()
            .map(|p| (p.port_range, UnitTag::new(p.unit)))
            .collect())
    }

    async fn watch_units(&self) -> Result<StringsWatcher, Error> {
        Ok(spawn_strings_watch(
            Arc::clone(&self.client),
            vec![
                "v1".into(),
                "watch".into(),
                "machines".into(),
                self.tag.id().into(),
                "units".into(),
            ],
        ))
    }
}

/// Unit handle with lifecycle and assignment snapshotted at fetch time.
struct RestUnit {
    client: Arc<RestClient>,
    tag: UnitTag,
    life: Life,
    machine: Option<String>,
    application: String,
}

#[async_trait]
impl Unit for RestUnit {
    fn tag(&self) -> &UnitTag {
        &self.tag
    }

    fn life(&self) -> Life {
        self.life
    }

    async fn assigned_machine(&self) -> Result<MachineTag, Error> {
        match self.machine {
            Some(ref id) => Ok(MachineTag::new(id.clone())),
            None => Err(Error::NotAssigned(self.tag.to_string())),
        }
    }

    async fn application(&self) -> Result<Box<dyn Application>, Error> {
        let tag = ApplicationTag::new(self.application.clone());
        let url = self.client.api_url(&["v1", "applications", tag.name()]);
        // Fetch to confirm the application still exists before handing out
        // a handle; the payload itself is re-read on every is_exposed call.
        let _: ApplicationPayload = self.client.get_json(url).await?;
        Ok(Box::new(RestApplication {
            client: Arc::clone(&self.client),
            tag,
        }))
    }
}

/// Application handle. Exposure is re-read from the facade on every call,
/// so `refresh` only has to confirm existence.
struct RestApplication {
    client: Arc<RestClient>,
    tag: ApplicationTag,
}

impl RestApplication {
    async fn fetch(&self) -> Result<ApplicationPayload, Error> {
        let url = self
            .client
            .api_url(&["v1", "applications", self.tag.name()]);
        self.client.get_json(url).await
    }
}

#[async_trait]
impl Application for RestApplication {
    fn tag(&self) -> &ApplicationTag {
        &self.tag
    }

    async fn is_exposed(&self) -> Result<bool, Error> {
        Ok(self.fetch().await?.exposed)
    }

    async fn watch(&self) -> Result<NotifyWatcher, Error> {
        Ok(spawn_notify_watch(
            Arc::clone(&self.client),
            vec![
                "v1".into(),
                "watch".into(),
                "applications".into(),
                self.tag.name().into(),
            ],
        ))
    }

    async fn refresh(&self) -> Result<(), Error> {
        self.fetch().await.map(|_| ())
    }
}
