// ── REST facade clients ──
//
// JSON/HTTP implementations of the model and provider capability traits.
// Queries are plain request/response; change streams are cursor-based
// long-polls bridged onto channel-backed watchers by relay tasks.

mod payload;
mod watch;

pub mod model;
pub mod provider;

pub use model::RestModel;
pub use provider::RestProvider;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::ClientConfig;

use payload::ErrorEnvelope;

/// Raw HTTP client for a portward facade.
///
/// Handles URL construction, the structured error envelope
/// (`{"error": {"code", "message"}}`), and the long-poll watch protocol.
/// The model and provider clients are thin method layers over this.
pub(crate) struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    watch_timeout: Duration,
}

impl RestClient {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self, Error> {
        if config.base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(url::ParseError::RelativeUrlWithoutBase));
        }
        Ok(Self {
            http: config.build_client()?,
            base_url: config.base_url.clone(),
            timeout: config.timeout,
            watch_timeout: config.watch_timeout,
        })
    }

    /// Build a URL from path segments. Segments are percent-encoded, so
    /// identifiers containing `/` (unit names) stay a single segment.
    pub(crate) fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .expect("base URL validated at construction")
            .pop_if_empty()
            .extend(segments);
        url
    }

    /// Send a GET request and parse the JSON response.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!(%url, "GET");
        let resp = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Error::Transport)?;
        parse_response(resp).await
    }

    /// Send a POST request with a JSON body and parse the JSON response.
    pub(crate) async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, Error> {
        debug!(%url, "POST");
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(Error::Transport)?;
        parse_response(resp).await
    }

    /// One long-poll round against a watch endpoint. Returns when the
    /// server reports changes past `after`, or when its poll window closes.
    pub(crate) async fn watch_poll(
        &self,
        segments: &[&str],
        after: u64,
    ) -> Result<payload::WatchPayload, Error> {
        let mut url = self.api_url(segments);
        url.query_pairs_mut()
            .append_pair("after", &after.to_string());
        debug!(%url, "GET (watch)");
        let resp = self
            .http
            .get(url)
            .timeout(self.watch_timeout)
            .send()
            .await
            .map_err(Error::Transport)?;
        parse_response(resp).await
    }
}

/// Parse a facade response: JSON payload on success, structured error
/// envelope otherwise. Error codes map onto the entity-lookup variants the
/// worker keys its transitions off.
async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    let body = resp.text().await.map_err(Error::Transport)?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        });
    }

    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let message = envelope
            .error
            .message
            .unwrap_or_else(|| status.to_string());
        return Err(match envelope.error.code.as_deref() {
            Some("not-found") => Error::NotFound(message),
            Some("not-provisioned") => Error::NotProvisioned(message),
            Some("not-assigned") => Error::NotAssigned(message),
            Some("no-instances") => Error::NoInstances,
            _ => Error::Api {
                status: status.as_u16(),
                code: envelope.error.code,
                message,
            },
        });
    }

    Err(Error::Api {
        status: status.as_u16(),
        code: None,
        message: body,
    })
}
