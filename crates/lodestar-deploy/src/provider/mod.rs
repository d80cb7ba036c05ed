//! Provider adapters for live compute instances.
//!
//! An adapter creates or verifies the instance backing a deployment, polls
//! its build, and performs the capability discovery handshake. Adapters hold
//! per-run state (the build log offset and the routable endpoint), so the
//! [`ProviderFactory`] builds a fresh one for every run. Which provider builds
//! lambda instances is decided once, when the factory is constructed.

mod instance;
mod managed;
mod remote;
mod self_hosted;

pub use instance::InstanceClient;
pub use managed::{group_build_logs, BuildLogLine, ManagedDeployAdapter, ManagedDeployClient};
pub use remote::{ProbeFailure, RemoteAdapter};
pub use self_hosted::{SelfHostedAdapter, SelfHostedClient};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bundle::{PreparedBundle, RuntimeWrapper};
use crate::config::{DeployConfig, LambdaProvider};
use crate::egress::EgressPolicy;
use crate::error::DeployResult;
use crate::lock::ConcurrencyGuard;
use crate::oauth::{OAuthDiscovery, OAuthDocument};
use crate::store::DeploymentStore;
use crate::types::{
    CapabilitySnapshot, CustomServerRecord, DeploymentId, InstanceKind, InstanceRecord, LogBatch,
    ProviderInstance,
};

/// Env var carrying the instance's shared secret.
pub const TOKEN_SECRET_ENV: &str = "LODESTAR_AUTH_TOKEN_SECRET";

/// Build status reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Still building.
    Pending,
    /// Live.
    Success,
    /// Build failed.
    Failed,
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Current build status.
    pub status: BuildStatus,
    /// Log lines produced since the previous poll.
    pub logs: Vec<LogBatch>,
}

impl PollOutcome {
    /// Immediate success with no logs.
    #[must_use]
    pub const fn ready() -> Self {
        Self {
            status: BuildStatus::Success,
            logs: Vec::new(),
        }
    }
}

/// OAuth facts learned during discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthProbe {
    /// Whether the server requires OAuth.
    pub enabled: bool,
    /// Whether the server collects extra input before authorizing.
    pub has_form: bool,
    /// Metadata document, when one was discovered.
    pub document: Option<OAuthDocument>,
}

/// Result of the discovery handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    /// Capabilities reported by the instance. `None` keeps the version data
    /// the job was enqueued with.
    pub capabilities: Option<CapabilitySnapshot>,
    /// OAuth facts.
    pub oauth: OAuthProbe,
}

/// Everything an adapter needs to know about the run it serves.
#[derive(Debug, Clone)]
pub struct ProviderRun {
    /// Deployment being run.
    pub deployment_id: DeploymentId,
    /// Server being deployed.
    pub server: CustomServerRecord,
    /// Instance backing the version.
    pub instance: InstanceRecord,
}

/// Operations every provider supports.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Create or verify the instance.
    async fn create(&self) -> DeployResult<ProviderInstance>;

    /// Poll the build once.
    async fn poll_status(&self) -> DeployResult<PollOutcome>;

    /// Run the discovery handshake against the live instance.
    async fn discover(&self) -> DeployResult<Discovery>;

    /// Routable address, once known.
    fn endpoint(&self) -> Option<String>;
}

/// Payload shared by the managed platform and the self-hosted runner.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateDeploymentPayload {
    entry_point_url: String,
    env_vars: BTreeMap<String, String>,
    description: String,
    permissions: Permissions,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    domains: Vec<String>,
    assets: BTreeMap<String, AssetFile>,
}

#[derive(Debug, Serialize)]
struct Permissions {
    net: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AssetFile {
    kind: &'static str,
    encoding: &'static str,
    content: String,
}

impl CreateDeploymentPayload {
    pub(crate) fn new(bundle: PreparedBundle, run: &ProviderRun, domains: Vec<String>) -> Self {
        let mut env_vars = bundle.env;
        env_vars.insert(
            TOKEN_SECRET_ENV.to_owned(),
            run.instance.security_token.clone(),
        );

        Self {
            entry_point_url: bundle.entrypoint,
            env_vars,
            description: format!("CSRV {} / DEPL {}", run.server.id, run.deployment_id),
            permissions: Permissions {
                net: vec!["*".to_owned()],
            },
            domains,
            assets: bundle
                .files
                .into_iter()
                .map(|(path, content)| {
                    (
                        path,
                        AssetFile {
                            kind: "file",
                            encoding: "utf-8",
                            content,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Builds lambda backends.
enum LambdaBackend {
    Managed(Arc<ManagedDeployClient>),
    SelfHosted(Arc<SelfHostedClient>),
}

/// Builds a fresh adapter for every run.
pub struct ProviderFactory {
    lambda: LambdaBackend,
    store: Arc<dyn DeploymentStore>,
    guard: Arc<ConcurrencyGuard>,
    instances: Arc<InstanceClient>,
    oauth: Arc<dyn OAuthDiscovery>,
    egress: EgressPolicy,
    http: reqwest::Client,
    probe_timeout: std::time::Duration,
    wrapper: RuntimeWrapper,
}

impl ProviderFactory {
    /// Create a factory from configuration.
    ///
    /// Fails with a configuration error when the selected lambda provider is
    /// missing credentials.
    pub fn from_config(
        config: &DeployConfig,
        http: reqwest::Client,
        store: Arc<dyn DeploymentStore>,
        oauth: Arc<dyn OAuthDiscovery>,
    ) -> DeployResult<Self> {
        let lambda = match config.provider.lambda {
            LambdaProvider::ManagedDeploy => LambdaBackend::Managed(Arc::new(
                ManagedDeployClient::new(http.clone(), &config.managed)?,
            )),
            LambdaProvider::SelfHosted => LambdaBackend::SelfHosted(Arc::new(
                SelfHostedClient::new(http.clone(), &config.self_hosted),
            )),
        };

        Ok(Self {
            lambda,
            store,
            guard: Arc::new(ConcurrencyGuard::new()),
            instances: Arc::new(InstanceClient::new(http.clone(), &config.discovery)),
            oauth,
            egress: EgressPolicy::from(config.egress),
            http,
            probe_timeout: config.discovery.timeout(),
            wrapper: RuntimeWrapper::default(),
        })
    }

    /// Replace the runtime wrapper merged into lambda bundles.
    #[must_use]
    pub fn with_wrapper(mut self, wrapper: RuntimeWrapper) -> Self {
        self.wrapper = wrapper;
        self
    }

    /// Share a lock registry with other factories.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<ConcurrencyGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Build the adapter matching the run's instance.
    #[must_use]
    pub fn adapter(&self, run: ProviderRun) -> Box<dyn ProviderAdapter> {
        match (&run.instance.kind, &self.lambda) {
            (InstanceKind::Remote { url }, _) => Box::new(RemoteAdapter::new(
                url.clone(),
                self.http.clone(),
                self.egress,
                self.probe_timeout,
                Arc::clone(&self.oauth),
            )),
            (InstanceKind::Lambda, LambdaBackend::Managed(api)) => {
                Box::new(ManagedDeployAdapter::new(
                    Arc::clone(api),
                    Arc::clone(&self.store),
                    Arc::clone(&self.guard),
                    Arc::clone(&self.instances),
                    self.wrapper.clone(),
                    run,
                ))
            }
            (InstanceKind::Lambda, LambdaBackend::SelfHosted(runner)) => {
                Box::new(SelfHostedAdapter::new(
                    Arc::clone(runner),
                    Arc::clone(&self.store),
                    Arc::clone(&self.instances),
                    self.wrapper.clone(),
                    run,
                ))
            }
        }
    }
}

/// Message from a JSON error body, falling back to the status line.
pub(crate) async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| format!("request failed with status {status}"))
}
