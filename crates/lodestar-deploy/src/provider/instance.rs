//! Discovery handshake against a deployed lambda instance.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::DiscoveryConfig;
use crate::error::{DeployError, DeployResult};
use crate::types::CapabilitySnapshot;

use super::{Discovery, OAuthProbe};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthResponse {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    has_form: bool,
}

/// Calls `/discover` and `/oauth` on a live instance.
pub struct InstanceClient {
    client: reqwest::Client,
    token_header: String,
    timeout: Duration,
}

impl InstanceClient {
    /// Create a client from discovery settings.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            token_header: config.token_header.clone(),
            timeout: config.timeout(),
        }
    }

    /// Run the handshake. `endpoint` is the instance base URL.
    pub async fn discover(&self, endpoint: &str, token: &str) -> DeployResult<Discovery> {
        let capabilities: CapabilitySnapshot = self.get_json(endpoint, "discover", token).await?;
        let oauth: OAuthResponse = self.get_json(endpoint, "oauth", token).await?;

        debug!(
            endpoint,
            tools = capabilities.tools.len(),
            oauth_enabled = oauth.enabled,
            "instance discovery finished"
        );

        Ok(Discovery {
            capabilities: Some(capabilities),
            oauth: OAuthProbe {
                enabled: oauth.enabled,
                has_form: oauth.has_form,
                document: None,
            },
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        token: &str,
    ) -> DeployResult<T> {
        let url = format!("{}/{path}", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header(self.token_header.as_str(), token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DeployError::discovery(format!("{url} is unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(DeployError::discovery(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DeployError::discovery(format!("{url} returned a malformed body: {e}")))
    }
}
