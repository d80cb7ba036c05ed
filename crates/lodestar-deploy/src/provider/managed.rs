//! Managed deploy platform adapter.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::bundle::RuntimeWrapper;
use crate::config::ManagedConfig;
use crate::error::{DeployError, DeployResult};
use crate::lock::ConcurrencyGuard;
use crate::store::DeploymentStore;
use crate::types::{LogBatch, LogKind, ManagedProject, ProviderInstance};

use super::{
    error_message, BuildStatus, CreateDeploymentPayload, Discovery, InstanceClient, PollOutcome,
    ProviderAdapter, ProviderRun,
};

/// One line of the platform's build log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildLogLine {
    /// `info` or `error`.
    pub level: String,
    /// Log text.
    pub message: String,
}

impl BuildLogLine {
    fn kind(&self) -> LogKind {
        if self.level.eq_ignore_ascii_case("error") {
            LogKind::Error
        } else {
            LogKind::Info
        }
    }
}

/// Group consecutive lines of the same kind into one batch each.
#[must_use]
pub fn group_build_logs(lines: &[BuildLogLine]) -> Vec<LogBatch> {
    let mut batches: Vec<LogBatch> = Vec::new();
    for line in lines {
        let kind = line.kind();
        match batches.last_mut() {
            Some(batch) if batch.kind == kind => batch.lines.push(line.message.clone()),
            _ => batches.push(LogBatch {
                kind,
                lines: vec![line.message.clone()],
            }),
        }
    }
    batches
}

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct DeploymentStatusResponse {
    status: BuildStatus,
    #[serde(default)]
    domains: Vec<String>,
}

/// Authenticated client for the managed platform API.
pub struct ManagedDeployClient {
    client: reqwest::Client,
    api_url: String,
    organization_id: String,
    token: SecretString,
    project_prefix: String,
    noise_patterns: Vec<String>,
    domain_template: String,
}

impl ManagedDeployClient {
    /// Create a client.
    ///
    /// Returns a configuration error when the organization or token is unset.
    pub fn new(client: reqwest::Client, config: &ManagedConfig) -> DeployResult<Self> {
        let organization_id = config
            .organization_id
            .clone()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| {
                DeployError::configuration("managed deploy organization id is not configured")
            })?;
        let token = config.token.clone().ok_or_else(|| {
            DeployError::configuration("managed deploy API token is not configured")
        })?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            organization_id,
            token,
            project_prefix: config.project_prefix.clone(),
            noise_patterns: config.noise_patterns.clone(),
            domain_template: config.domain_template.clone(),
        })
    }

    fn project_name(&self) -> String {
        let id = ulid::Ulid::new().to_string().to_lowercase();
        let suffix = &id[id.len() - 15..];
        format!("{}-{suffix}", self.project_prefix).to_lowercase()
    }

    async fn post<T>(&self, url: String, body: &T) -> DeployResult<Created>
    where
        T: serde::Serialize + ?Sized,
    {
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeployError::provider(error_message(response).await));
        }
        Ok(response.json().await?)
    }

    async fn create_project(&self) -> DeployResult<String> {
        let url = format!(
            "{}/organizations/{}/projects",
            self.api_url, self.organization_id
        );
        let created = self
            .post(url, &serde_json::json!({ "name": self.project_name() }))
            .await?;
        Ok(created.id)
    }

    async fn create_deployment(
        &self,
        project_id: &str,
        payload: &CreateDeploymentPayload,
    ) -> DeployResult<String> {
        let url = format!("{}/projects/{project_id}/deployments", self.api_url);
        Ok(self.post(url, payload).await?.id)
    }

    async fn deployment_status(
        &self,
        deployment_id: &str,
    ) -> DeployResult<DeploymentStatusResponse> {
        let response = self
            .client
            .get(format!("{}/deployments/{deployment_id}", self.api_url))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeployError::provider(error_message(response).await));
        }
        Ok(response.json().await?)
    }

    async fn build_logs(&self, deployment_id: &str) -> DeployResult<Vec<BuildLogLine>> {
        let response = self
            .client
            .get(format!("{}/deployments/{deployment_id}/build_logs", self.api_url))
            .bearer_auth(self.token.expose_secret())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeployError::provider(error_message(response).await));
        }

        let lines: Vec<BuildLogLine> = response.json().await?;
        Ok(lines
            .into_iter()
            .filter(|l| !self.noise_patterns.iter().any(|p| l.message.contains(p.as_str())))
            .collect())
    }
}

#[derive(Debug, Default)]
struct RunState {
    project_id: Option<String>,
    deployment_id: Option<String>,
    endpoint: Option<String>,
    log_offset: usize,
}

/// Adapter for one run on the managed platform.
pub struct ManagedDeployAdapter {
    api: Arc<ManagedDeployClient>,
    store: Arc<dyn DeploymentStore>,
    guard: Arc<ConcurrencyGuard>,
    instances: Arc<InstanceClient>,
    wrapper: RuntimeWrapper,
    run: ProviderRun,
    state: Mutex<RunState>,
}

impl ManagedDeployAdapter {
    pub(crate) fn new(
        api: Arc<ManagedDeployClient>,
        store: Arc<dyn DeploymentStore>,
        guard: Arc<ConcurrencyGuard>,
        instances: Arc<InstanceClient>,
        wrapper: RuntimeWrapper,
        run: ProviderRun,
    ) -> Self {
        Self {
            api,
            store,
            guard,
            instances,
            wrapper,
            run,
            state: Mutex::new(RunState::default()),
        }
    }

    fn state(&self) -> DeployResult<MutexGuard<'_, RunState>> {
        self.state
            .lock()
            .map_err(|_| DeployError::internal("lock poisoned"))
    }

    /// Find the server's project, creating it if this is the first deployment.
    async fn ensure_project(&self) -> DeployResult<String> {
        let server_id = &self.run.server.id;
        self.guard
            .using_lock(server_id.as_str(), async {
                if let Some(project) = self.store.find_managed_project(server_id).await? {
                    return Ok::<_, DeployError>(project.external_project_id);
                }

                let external_project_id = self.api.create_project().await?;
                self.store
                    .insert_managed_project(&ManagedProject {
                        custom_server_id: server_id.clone(),
                        external_project_id: external_project_id.clone(),
                    })
                    .await?;
                info!(
                    custom_server_id = %server_id,
                    project_id = %external_project_id,
                    "created managed deploy project"
                );
                Ok::<_, DeployError>(external_project_id)
            })
            .await
    }

    fn provider_instance(&self) -> DeployResult<ProviderInstance> {
        let state = self.state()?;
        match (&state.project_id, &state.deployment_id) {
            (Some(project), Some(deployment)) => Ok(ProviderInstance::ManagedDeploy {
                external_project_id: project.clone(),
                external_deployment_id: deployment.clone(),
                access_endpoint: state.endpoint.clone(),
            }),
            _ => Err(DeployError::internal("managed deployment was not created")),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ManagedDeployAdapter {
    fn name(&self) -> &'static str {
        "managed_deploy"
    }

    async fn create(&self) -> DeployResult<ProviderInstance> {
        let bundle = self
            .wrapper
            .prepare(&self.run.instance.id, &self.run.instance.assets)?;

        let project_id = self.ensure_project().await?;
        let payload = CreateDeploymentPayload::new(
            bundle,
            &self.run,
            vec![self.api.domain_template.clone()],
        );
        let deployment_id = self.api.create_deployment(&project_id, &payload).await?;

        {
            let mut state = self.state()?;
            state.project_id = Some(project_id);
            state.deployment_id = Some(deployment_id.clone());
        }

        let provider = self.provider_instance()?;
        self.store
            .set_instance_provider(&self.run.instance.id, &provider)
            .await?;
        debug!(
            deployment_id = %self.run.deployment_id,
            external_deployment_id = %deployment_id,
            "managed deployment created"
        );
        Ok(provider)
    }

    async fn poll_status(&self) -> DeployResult<PollOutcome> {
        let deployment_id = self
            .state()?
            .deployment_id
            .clone()
            .ok_or_else(|| DeployError::internal("poll before create"))?;

        let status = self.api.deployment_status(&deployment_id).await?;
        if let Some(domain) = status.domains.first() {
            let endpoint = if domain.contains("://") {
                domain.clone()
            } else {
                format!("https://{domain}")
            };
            let changed = {
                let mut state = self.state()?;
                let changed = state.endpoint.as_deref() != Some(endpoint.as_str());
                state.endpoint = Some(endpoint);
                changed
            };
            if changed {
                let provider = self.provider_instance()?;
                self.store
                    .set_instance_provider(&self.run.instance.id, &provider)
                    .await?;
            }
        }

        let lines = self.api.build_logs(&deployment_id).await?;
        let fresh = {
            let mut state = self.state()?;
            let start = state.log_offset.min(lines.len());
            let fresh = &lines[start..];
            state.log_offset += fresh.len();
            group_build_logs(fresh)
        };

        Ok(PollOutcome {
            status: status.status,
            logs: fresh,
        })
    }

    async fn discover(&self) -> DeployResult<Discovery> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| DeployError::discovery("instance has no routable endpoint yet"))?;
        self.instances
            .discover(&endpoint, &self.run.instance.security_token)
            .await
    }

    fn endpoint(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.endpoint.clone())
    }
}
