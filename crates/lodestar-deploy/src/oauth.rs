//! OAuth collaborators used during discovery.
//!
//! [`WellKnownDiscovery`] looks for an authorization server metadata document
//! next to a remote server, and [`HttpOAuthConfigService`] stores the
//! resulting configuration so it can be linked to the instance.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::OAuthConfig;
use crate::egress::EgressPolicy;
use crate::error::{DeployError, DeployResult};
use crate::types::{CustomServerId, InstanceId, OAuthConfigId};

const WELL_KNOWN_PATHS: [&str; 3] = [
    "/.well-known/openid-configuration",
    "/.well-known/oauth-authorization-server",
    "/.well-known/oauth-protected-resource",
];

/// A discovered authorization server metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OAuthDocument(pub Value);

impl OAuthDocument {
    /// Accept `value` only if it has the fields a client needs.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        let object = value.as_object()?;
        let has = |key: &str| object.get(key).is_some_and(Value::is_string);
        let issuer_ok = object.get("issuer").map_or(true, Value::is_string);
        (has("authorization_endpoint") && has("token_endpoint") && issuer_ok).then_some(Self(value))
    }

    /// The authorization endpoint.
    #[must_use]
    pub fn authorization_endpoint(&self) -> &str {
        self.0["authorization_endpoint"].as_str().unwrap_or_default()
    }
}

/// Finds OAuth metadata for a remote server.
#[async_trait]
pub trait OAuthDiscovery: Send + Sync {
    /// Return the metadata document, or `None` if the server has none.
    ///
    /// Lookup failures are treated as "not found".
    async fn discover(&self, server_url: &str) -> Option<OAuthDocument>;
}

/// Input to [`OAuthConfigService::create_config`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthConfigRequest {
    /// Instance the configuration is for.
    pub instance_id: InstanceId,
    /// Server owning the instance.
    pub custom_server_id: CustomServerId,
    /// Metadata found by discovery, if any.
    pub discovered: Option<OAuthDocument>,
    /// Whether the instance collects extra user input before authorizing.
    pub has_form: bool,
}

/// Stores OAuth configurations.
#[async_trait]
pub trait OAuthConfigService: Send + Sync {
    /// Create a configuration and return its identifier.
    async fn create_config(&self, request: &OAuthConfigRequest) -> DeployResult<OAuthConfigId>;
}

/// Well-known document discovery over HTTP.
pub struct WellKnownDiscovery {
    client: reqwest::Client,
    egress: EgressPolicy,
    timeout: Duration,
}

impl WellKnownDiscovery {
    /// Create a discovery client.
    #[must_use]
    pub fn new(client: reqwest::Client, egress: EgressPolicy, timeout: Duration) -> Self {
        Self {
            client,
            egress,
            timeout,
        }
    }

    /// Candidate document URLs for `url`, in lookup order.
    fn candidates(url: &Url) -> Vec<String> {
        let origin = url.origin().ascii_serialization();
        let path = url.path().trim_end_matches('/');

        let mut out = vec![url.to_string()];
        if !path.is_empty() {
            out.extend(WELL_KNOWN_PATHS.iter().map(|p| format!("{origin}{path}{p}")));
        }
        out.extend(WELL_KNOWN_PATHS.iter().map(|p| format!("{origin}{p}")));
        out.dedup();
        out
    }

    async fn fetch_document(&self, url: &str) -> Option<OAuthDocument> {
        let url = self.egress.check(url).ok()?;
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| debug!(url = %url, error = %e, "discovery document request failed"))
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: Value = response.json().await.ok()?;
        OAuthDocument::from_value(body)
    }

    /// Follow `authorization_servers` advertised on a 401 challenge.
    async fn from_challenge(&self, origin: &str) -> Option<OAuthDocument> {
        let url = self.egress.check(origin).ok()?;
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json,text/event-stream")
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return None;
        }
        let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;

        for server in parse_authorization_servers(header) {
            if let Some(document) = self.fetch_document(&server).await {
                return Some(document);
            }
        }
        None
    }
}

#[async_trait]
impl OAuthDiscovery for WellKnownDiscovery {
    async fn discover(&self, server_url: &str) -> Option<OAuthDocument> {
        let url = Url::parse(server_url).ok()?;
        if url.scheme() != "https" && !self.egress.allows_private() {
            return None;
        }

        for candidate in Self::candidates(&url) {
            if let Some(document) = self.fetch_document(&candidate).await {
                debug!(url = %candidate, "found OAuth metadata");
                return Some(document);
            }
        }

        self.from_challenge(&url.origin().ascii_serialization()).await
    }
}

/// Extract the URL list from `authorization_servers="[...]"`.
fn parse_authorization_servers(header: &str) -> Vec<String> {
    let Some(start) = header.find("authorization_servers") else {
        return Vec::new();
    };
    let rest = header[start + "authorization_servers".len()..].trim_start();
    let Some(rest) = rest.strip_prefix('=') else {
        return Vec::new();
    };
    let Some(rest) = rest.trim_start().strip_prefix('"') else {
        return Vec::new();
    };

    // The value is JSON with escaped quotes, terminated by the first bare quote.
    let mut raw = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    raw.push(next);
                }
            }
            '"' => break,
            other => raw.push(other),
        }
    }

    serde_json::from_str::<Vec<Value>>(&raw)
        .map(|values| {
            values
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct CreatedConfig {
    id: String,
}

/// Config service client over HTTP.
pub struct HttpOAuthConfigService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOAuthConfigService {
    /// Create a client for the configured service.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &OAuthConfig) -> Self {
        Self {
            client,
            base_url: config.config_service_url.trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl OAuthConfigService for HttpOAuthConfigService {
    async fn create_config(&self, request: &OAuthConfigRequest) -> DeployResult<OAuthConfigId> {
        let response = self
            .client
            .post(format!("{}/oauth-configs", self.base_url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeployError::discovery(format!(
                "OAuth config service returned {}",
                response.status()
            )));
        }

        let created: CreatedConfig = response.json().await?;
        Ok(OAuthConfigId::new(created.id))
    }
}
