use crate::error::{AppSecError, Result};
use crate::remoteconfig::REMOTE_CONFIG_AGENT_ENDPOINT;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Agent discovery document served at `/info`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentInfo {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl AgentInfo {
    /// True when the agent advertises the remote configuration endpoint.
    pub fn supports_remote_config(&self) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.trim_start_matches('/') == REMOTE_CONFIG_AGENT_ENDPOINT)
    }
}

/// Pluggable "send one request" collaborator. The client owns payload
/// construction and response verification; implementations only move bytes.
pub trait ConfigTransport: Send + Sync {
    /// POST one poll request; returns the decoded JSON response body.
    fn send_request(&self, payload: Value) -> BoxFuture<'_, Result<Value>>;

    /// Fetch the agent discovery document.
    fn agent_info(&self) -> BoxFuture<'_, Result<AgentInfo>>;
}

/// HTTP transport talking to a local agent.
#[derive(Debug)]
pub struct AgentTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl AgentTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppSecError::RemoteConfigTransport(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ConfigTransport for AgentTransport {
    fn send_request(&self, payload: Value) -> BoxFuture<'_, Result<Value>> {
        async move {
            let url = format!("{}/{}", self.base_url, REMOTE_CONFIG_AGENT_ENDPOINT);
            debug!(url = %url, "Sending remote config poll request");

            let response = self
                .http_client
                .post(&url)
                .json(&payload)
                .send()
                .await
                .map_err(|e| {
                    AppSecError::RemoteConfigTransport(format!("request to {url} failed: {e}"))
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppSecError::RemoteConfigTransport(format!(
                    "agent returned status {status}"
                )));
            }

            response.json().await.map_err(|e| {
                AppSecError::RemoteConfigTransport(format!("malformed response body: {e}"))
            })
        }
        .boxed()
    }

    fn agent_info(&self) -> BoxFuture<'_, Result<AgentInfo>> {
        async move {
            let url = format!("{}/info", self.base_url);
            let response = self.http_client.get(&url).send().await.map_err(|e| {
                AppSecError::RemoteConfigTransport(format!("request to {url} failed: {e}"))
            })?;

            if !response.status().is_success() {
                return Err(AppSecError::RemoteConfigTransport(format!(
                    "agent info returned status {}",
                    response.status()
                )));
            }

            response.json().await.map_err(|e| {
                AppSecError::RemoteConfigTransport(format!("malformed agent info: {e}"))
            })
        }
        .boxed()
    }
}
