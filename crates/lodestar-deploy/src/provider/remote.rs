//! User-hosted remote server adapter.
//!
//! There is nothing to build: `create` only checks the URL against the egress
//! policy and `poll_status` succeeds at once. Discovery is a liveness probe
//! followed by OAuth metadata lookup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::egress::EgressPolicy;
use crate::error::{DeployError, DeployResult};
use crate::oauth::OAuthDiscovery;
use crate::types::ProviderInstance;

use super::{Discovery, OAuthProbe, PollOutcome, ProviderAdapter};

const PROBE_BODY: &str = r#"{"jsonrpc":"2.0","id":0,"method":"ping"}"#;

/// Why a remote server failed its liveness probe.
///
/// Carries the GET attempt's outcome; the POST fallback only matters when it
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    /// HTTP status of the GET, if a response arrived.
    pub status: Option<u16>,
    /// Reason phrase, or the transport error text.
    pub status_text: String,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status} {}", self.status_text),
            None => f.write_str(&self.status_text),
        }
    }
}

/// Adapter for a user-hosted server.
pub struct RemoteAdapter {
    url: String,
    client: reqwest::Client,
    egress: EgressPolicy,
    timeout: Duration,
    oauth: Arc<dyn OAuthDiscovery>,
}

impl RemoteAdapter {
    /// Create an adapter for `url`.
    #[must_use]
    pub fn new(
        url: String,
        client: reqwest::Client,
        egress: EgressPolicy,
        timeout: Duration,
        oauth: Arc<dyn OAuthDiscovery>,
    ) -> Self {
        Self {
            url,
            client,
            egress,
            timeout,
            oauth,
        }
    }

    /// Check the server answers. GET first, then POST if GET fails.
    ///
    /// A 2xx or 401 response counts as reachable.
    pub async fn probe(&self) -> DeployResult<Result<(), ProbeFailure>> {
        let url = self.egress.check(&self.url)?;

        let get = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.timeout)
            .send()
            .await;
        let failure = match get {
            Ok(response) if reachable(response.status()) => return Ok(Ok(())),
            Ok(response) => ProbeFailure {
                status: Some(response.status().as_u16()),
                status_text: response
                    .status()
                    .canonical_reason()
                    .unwrap_or_default()
                    .to_owned(),
            },
            Err(e) => ProbeFailure {
                status: None,
                status_text: e.to_string(),
            },
        };
        debug!(url = %self.url, failure = %failure, "GET probe failed, trying POST");

        let post = self
            .client
            .post(url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(PROBE_BODY)
            .timeout(self.timeout)
            .send()
            .await;
        match post {
            Ok(response) if reachable(response.status()) => Ok(Ok(())),
            _ => Ok(Err(failure)),
        }
    }
}

fn reachable(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::UNAUTHORIZED
}

#[async_trait]
impl ProviderAdapter for RemoteAdapter {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create(&self) -> DeployResult<ProviderInstance> {
        self.egress.check(&self.url)?;
        Ok(ProviderInstance::Remote {
            url: self.url.clone(),
        })
    }

    async fn poll_status(&self) -> DeployResult<PollOutcome> {
        Ok(PollOutcome::ready())
    }

    async fn discover(&self) -> DeployResult<Discovery> {
        if let Err(failure) = self.probe().await? {
            warn!(url = %self.url, failure = %failure, "remote server unreachable");
            return Err(DeployError::discovery(format!(
                "Unable to connect to the remote server at {}: {failure}",
                self.url
            )));
        }

        let document = self.oauth.discover(&self.url).await;
        Ok(Discovery {
            capabilities: None,
            oauth: OAuthProbe {
                enabled: document.is_some(),
                has_form: false,
                document,
            },
        })
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    struct NoMetadata;

    #[async_trait]
    impl OAuthDiscovery for NoMetadata {
        async fn discover(&self, _server_url: &str) -> Option<crate::oauth::OAuthDocument> {
            None
        }
    }

    fn adapter(url: &str, egress: EgressPolicy) -> RemoteAdapter {
        RemoteAdapter::new(
            url.to_owned(),
            reqwest::Client::new(),
            egress,
            Duration::from_secs(1),
            Arc::new(NoMetadata),
        )
    }

    #[rstest]
    #[case::ok(200, true)]
    #[case::accepted(202, true)]
    #[case::unauthorized(401, true)]
    #[case::forbidden(403, false)]
    #[case::not_allowed(405, false)]
    #[case::unavailable(503, false)]
    fn reachable_statuses(#[case] status: u16, #[case] expected: bool) {
        let status = StatusCode::from_u16(status).expect("status");
        assert_eq!(reachable(status), expected);
    }

    #[test]
    fn failure_display() {
        let with_status = ProbeFailure {
            status: Some(502),
            status_text: "Bad Gateway".to_owned(),
        };
        let transport = ProbeFailure {
            status: None,
            status_text: "connection refused".to_owned(),
        };

        assert_eq!(with_status.to_string(), "502 Bad Gateway");
        assert_eq!(transport.to_string(), "connection refused");
    }

    #[tokio::test]
    async fn create_checks_egress() {
        let blocked = adapter("http://192.168.1.10/mcp", EgressPolicy::strict());
        let err = blocked.create().await.expect_err("private target");
        assert!(matches!(err, DeployError::EgressBlocked(_)));

        let allowed = adapter("https://mcp.example.com/mcp", EgressPolicy::strict());
        assert_eq!(
            allowed.create().await.expect("public target"),
            ProviderInstance::Remote {
                url: "https://mcp.example.com/mcp".to_owned(),
            }
        );
        assert_eq!(
            allowed.endpoint().as_deref(),
            Some("https://mcp.example.com/mcp")
        );
    }

    #[tokio::test]
    async fn poll_is_immediately_ready() {
        let remote = adapter("https://mcp.example.com/mcp", EgressPolicy::strict());
        assert_eq!(
            remote.poll_status().await.expect("poll"),
            PollOutcome::ready()
        );
    }
}
