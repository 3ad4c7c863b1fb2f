// ── REST provider client ──

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::ports::IngressRule;
use crate::provider::{Instance, InstanceId, Provider};
use crate::transport::ClientConfig;

use super::payload::{Ack, InstanceRulesBody, InstancesPayload, InstancesQuery, RulesBody, RulesPayload};
use super::RestClient;

/// REST implementation of [`Provider`].
pub struct RestProvider {
    client: Arc<RestClient>,
}

impl RestProvider {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self {
            client: Arc::new(RestClient::new(config)?),
        })
    }
}

#[async_trait]
impl Provider for RestProvider {
    async fn ingress_rules(&self) -> Result<Vec<IngressRule>, Error> {
        let url = self.client.api_url(&["v1", "environ", "ingress-rules"]);
        let payload: RulesPayload = self.client.get_json(url).await?;
        Ok(payload.rules)
    }

    async fn open_ports(&self, rules: &[IngressRule]) -> Result<(), Error> {
        let url = self.client.api_url(&["v1", "environ", "open-ports"]);
        let _: Ack = self.client.post_json(url, &RulesBody { rules }).await?;
        Ok(())
    }

    async fn close_ports(&self, rules: &[IngressRule]) -> Result<(), Error> {
        let url = self.client.api_url(&["v1", "environ", "close-ports"]);
        let _: Ack = self.client.post_json(url, &RulesBody { rules }).await?;
        Ok(())
    }

    async fn instances(&self, ids: &[InstanceId]) -> Result<Vec<Box<dyn Instance>>, Error> {
        let url = self.client.api_url(&["v1", "environ", "instances"]);
        let payload: InstancesPayload = self
            .client
            .post_json(url, &InstancesQuery { instance_ids: ids })
            .await?;
        Ok(payload
            .instances
            .into_iter()
            .map(|p| {
                Box::new(RestInstance {
                    client: Arc::clone(&self.client),
                    id: p.instance_id,
                }) as Box<dyn Instance>
            })
            .collect())
    }
}

struct RestInstance {
    client: Arc<RestClient>,
    id: InstanceId,
}

impl std::fmt::Debug for RestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestInstance").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Instance for RestInstance {
    fn id(&self) -> &InstanceId {
        &self.id
    }

    async fn ingress_rules(&self, machine_id: &str) -> Result<Vec<IngressRule>, Error> {
        let mut url = self
            .client
            .api_url(&["v1", "instances", self.id.as_str(), "ingress-rules"]);
        url.query_pairs_mut().append_pair("machine", machine_id);
        let payload: RulesPayload = self.client.get_json(url).await?;
        Ok(payload.rules)
    }

    async fn open_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error> {
        let url = self
            .client
            .api_url(&["v1", "instances", self.id.as_str(), "open-ports"]);
        let _: Ack = self
            .client
            .post_json(
                url,
                &InstanceRulesBody {
                    machine: machine_id,
                    rules,
                },
            )
            .await?;
        Ok(())
    }

    async fn close_ports(&self, machine_id: &str, rules: &[IngressRule]) -> Result<(), Error> {
        let url = self
            .client
            .api_url(&["v1", "instances", self.id.as_str(), "close-ports"]);
        let _: Ack = self
            .client
            .post_json(
                url,
                &InstanceRulesBody {
                    machine: machine_id,
                    rules,
                },
            )
            .await?;
        Ok(())
    }
}
