//! Self-hosted runner adapter.
//!
//! The runner starts the instance synchronously, so the instance is live as
//! soon as the create call returns.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::bundle::RuntimeWrapper;
use crate::config::SelfHostedConfig;
use crate::error::{DeployError, DeployResult};
use crate::store::DeploymentStore;
use crate::types::ProviderInstance;

use super::{
    error_message, CreateDeploymentPayload, Discovery, InstanceClient, PollOutcome,
    ProviderAdapter, ProviderRun,
};

#[derive(Deserialize)]
struct Created {
    id: String,
}

/// Client for the runner API.
pub struct SelfHostedClient {
    client: reqwest::Client,
    runner_url: String,
}

impl SelfHostedClient {
    /// Create a client.
    #[must_use]
    pub fn new(client: reqwest::Client, config: &SelfHostedConfig) -> Self {
        Self {
            client,
            runner_url: config.runner_url.trim_end_matches('/').to_owned(),
        }
    }

    async fn create_deployment(&self, payload: &CreateDeploymentPayload) -> DeployResult<String> {
        let response = self
            .client
            .post(format!("{}/deployments", self.runner_url))
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeployError::provider(error_message(response).await));
        }
        let created: Created = response.json().await?;
        Ok(created.id)
    }

    fn endpoint_for(&self, deployment_id: &str) -> String {
        format!("{}/{deployment_id}", self.runner_url)
    }
}

/// Adapter for one run on the self-hosted runner.
pub struct SelfHostedAdapter {
    runner: Arc<SelfHostedClient>,
    store: Arc<dyn DeploymentStore>,
    instances: Arc<InstanceClient>,
    wrapper: RuntimeWrapper,
    run: ProviderRun,
    endpoint: Mutex<Option<String>>,
}

impl SelfHostedAdapter {
    pub(crate) fn new(
        runner: Arc<SelfHostedClient>,
        store: Arc<dyn DeploymentStore>,
        instances: Arc<InstanceClient>,
        wrapper: RuntimeWrapper,
        run: ProviderRun,
    ) -> Self {
        Self {
            runner,
            store,
            instances,
            wrapper,
            run,
            endpoint: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SelfHostedAdapter {
    fn name(&self) -> &'static str {
        "self_hosted"
    }

    async fn create(&self) -> DeployResult<ProviderInstance> {
        let bundle = self
            .wrapper
            .prepare(&self.run.instance.id, &self.run.instance.assets)?;
        let payload = CreateDeploymentPayload::new(bundle, &self.run, Vec::new());

        let deployment_id = self.runner.create_deployment(&payload).await?;
        let endpoint = self.runner.endpoint_for(&deployment_id);
        *self
            .endpoint
            .lock()
            .map_err(|_| DeployError::internal("lock poisoned"))? = Some(endpoint.clone());

        let provider = ProviderInstance::SelfHosted {
            deployment_id,
            endpoint,
        };
        self.store
            .set_instance_provider(&self.run.instance.id, &provider)
            .await?;
        debug!(deployment_id = %self.run.deployment_id, "runner deployment created");
        Ok(provider)
    }

    async fn poll_status(&self) -> DeployResult<PollOutcome> {
        Ok(PollOutcome::ready())
    }

    async fn discover(&self) -> DeployResult<Discovery> {
        let endpoint = self
            .endpoint()
            .ok_or_else(|| DeployError::discovery("runner deployment was not created"))?;
        self.instances
            .discover(&endpoint, &self.run.instance.security_token)
            .await
    }

    fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().ok().and_then(|e| e.clone())
    }
}
