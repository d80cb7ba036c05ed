//! Deployment pipeline driver.
//!
//! One call to [`DeploymentOrchestrator::run`] takes a deployment through
//! its named steps:
//!
//! ```text
//! started ──▶ provider_create ──▶ provider_build ──▶ discovering ──▶ publishing
//!                  │                (lambda only)        │               │
//!                  └───────────────────┴─────────────────┴───────────────┴──▶ failed
//! ```
//!
//! Errors raised after the `started` step are recorded on the step that was
//! running, the deployment and its version are marked failed, and `run`
//! returns `Ok`. Errors before that point (missing records, storage outages)
//! are returned so the queue can retry the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::oauth::{
    HttpOAuthConfigService, OAuthConfigRequest, OAuthConfigService, WellKnownDiscovery,
};
use crate::provider::{BuildStatus, Discovery, ProviderAdapter, ProviderFactory, ProviderRun};
use crate::queue::DeployJob;
use crate::state::{AnyDeployment, Deployment, Deploying};
use crate::steps::{StepHandle, StepManager};
use crate::store::{DeploymentStore, PublishRequest};
use crate::types::{
    CapabilitySnapshot, CustomServerRecord, DeploymentRecord, DeploymentStatus, InstanceRecord,
    LogBatch, StepStatus, StepType, VersionRecord,
};

/// Default delay between build status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Records loaded for one job.
struct RunContext {
    deployment: DeploymentRecord,
    version: VersionRecord,
    server: CustomServerRecord,
    instance: InstanceRecord,
}

impl RunContext {
    fn flavor(&self) -> &'static str {
        if self.instance.kind.is_lambda() {
            "managed"
        } else {
            "remote"
        }
    }
}

/// Drives deployments through the step sequence.
pub struct DeploymentOrchestrator {
    store: Arc<dyn DeploymentStore>,
    providers: ProviderFactory,
    oauth_configs: Arc<dyn OAuthConfigService>,
    poll_interval: Duration,
}

impl DeploymentOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        providers: ProviderFactory,
        oauth_configs: Arc<dyn OAuthConfigService>,
    ) -> Self {
        Self {
            store,
            providers,
            oauth_configs,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Build an orchestrator and its HTTP collaborators from configuration.
    ///
    /// Fails with a configuration error if the lambda provider is missing
    /// credentials. Nothing is written to the store.
    pub fn from_config(
        config: &DeployConfig,
        http: reqwest::Client,
        store: Arc<dyn DeploymentStore>,
    ) -> DeployResult<Self> {
        let discovery = Arc::new(WellKnownDiscovery::new(
            http.clone(),
            config.egress.into(),
            config.oauth.discovery_timeout(),
        ));
        let providers =
            ProviderFactory::from_config(config, http.clone(), Arc::clone(&store), discovery)?;
        let oauth_configs = Arc::new(HttpOAuthConfigService::new(http, &config.oauth));

        Ok(Self::new(store, providers, oauth_configs)
            .with_poll_interval(config.build.poll_interval()))
    }

    /// Override the delay between build status polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The store the orchestrator writes to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    /// Run the pipeline for one job.
    ///
    /// Safe to call again for the same job: a terminal deployment is left
    /// untouched, and a deployment found `deploying` is restarted from the
    /// first step after its abandoned steps are closed as failed. A run that
    /// loses a race with another delivery keeps the winner's outcome.
    pub async fn run(&self, job: &DeployJob) -> DeployResult<()> {
        let ctx = self.load(job).await?;
        let deployment = AnyDeployment::from_record(ctx.deployment.clone());

        if deployment.is_terminal() {
            info!(
                deployment_id = %ctx.deployment.id,
                status = %deployment.status(),
                "deployment already finished, skipping"
            );
            return Ok(());
        }

        let restarted = deployment.status() == DeploymentStatus::Deploying;
        let deploying = deployment.begin()?;
        match self.store.update_deployment(deploying.record()).await {
            Ok(()) => {}
            Err(DeployError::InvalidStateTransition { from, .. }) => {
                info!(
                    deployment_id = %deploying.id(),
                    status = from,
                    "deployment finished by another run, skipping"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if restarted {
            let closed = self
                .store
                .fail_running_steps(deploying.id(), Utc::now())
                .await?;
            if closed > 0 {
                warn!(
                    deployment_id = %deploying.id(),
                    steps = closed,
                    "closed steps left running by an earlier attempt"
                );
            }
        }

        let steps = StepManager::new(Arc::clone(&self.store), deploying.id().clone());
        steps
            .create_step_with_status(
                StepType::Started,
                StepStatus::Completed,
                vec![LogBatch::info([format!(
                    "Starting deployment for {} server {}.",
                    ctx.flavor(),
                    ctx.server.name
                )])],
            )
            .await?;

        let adapter = self.providers.adapter(ProviderRun {
            deployment_id: deploying.id().clone(),
            server: ctx.server.clone(),
            instance: ctx.instance.clone(),
        });

        info!(
            deployment_id = %deploying.id(),
            server = %ctx.server.id,
            provider = adapter.name(),
            "deployment started"
        );

        match self
            .execute(&ctx, job, &steps, adapter.as_ref(), &deploying)
            .await
        {
            Ok(()) => {
                info!(
                    deployment_id = %deploying.id(),
                    version_id = %ctx.version.id,
                    "deployment completed"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    deployment_id = %deploying.id(),
                    kind = %e.kind(),
                    error = %e,
                    "deployment failed"
                );
                self.fail_deployment(deploying, &ctx.version).await
            }
        }
    }

    async fn load(&self, job: &DeployJob) -> DeployResult<RunContext> {
        let instance = self
            .store
            .get_instance(&job.instance_id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("instance {}", job.instance_id)))?;
        let version = self
            .store
            .version_for_instance(&instance.id)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("version for instance {}", instance.id))
            })?;
        let deployment = self
            .store
            .deployment_for_version(&version.id)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("deployment for version {}", version.id))
            })?;
        let server = self
            .store
            .get_server(&deployment.custom_server_id)
            .await?
            .ok_or_else(|| {
                DeployError::NotFound(format!("server {}", deployment.custom_server_id))
            })?;

        Ok(RunContext {
            deployment,
            version,
            server,
            instance,
        })
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        job: &DeployJob,
        steps: &StepManager,
        adapter: &dyn ProviderAdapter,
        deploying: &Deployment<Deploying>,
    ) -> DeployResult<()> {
        self.provider_setup(ctx, steps, adapter).await?;
        if ctx.instance.kind.is_lambda() {
            self.build(steps, adapter).await?;
        }
        let discovery = self.discover(ctx, steps, adapter).await?;
        let snapshot = discovery
            .capabilities
            .unwrap_or_else(|| job.target_version.clone());
        self.publish(ctx, steps, deploying, snapshot).await
    }

    async fn provider_setup(
        &self,
        ctx: &RunContext,
        steps: &StepManager,
        adapter: &dyn ProviderAdapter,
    ) -> DeployResult<()> {
        let intro = if ctx.instance.kind.is_lambda() {
            "Preparing deployment...".to_owned()
        } else {
            format!("Verifying remote server {}...", ctx.server.name)
        };
        let step = steps
            .create_step(StepType::ProviderCreate, vec![LogBatch::info([intro])])
            .await?;

        match adapter.create().await {
            Ok(instance) => {
                let done = match instance.endpoint() {
                    Some(endpoint) => format!("Instance created at {endpoint}."),
                    None => "Instance created.".to_owned(),
                };
                step.complete(vec![LogBatch::info([done])]).await
            }
            Err(e) => Err(fail_step(&step, e, "Failed to create the server instance.").await),
        }
    }

    async fn build(&self, steps: &StepManager, adapter: &dyn ProviderAdapter) -> DeployResult<()> {
        let step = steps
            .create_step(
                StepType::ProviderBuild,
                vec![LogBatch::info(["Building and deploying managed server..."])],
            )
            .await?;

        loop {
            tokio::time::sleep(self.poll_interval).await;

            let outcome = match adapter.poll_status().await {
                Ok(outcome) => outcome,
                Err(e) => return Err(fail_step(&step, e, "Deployment failed.").await),
            };
            for batch in outcome.logs {
                step.add_log(batch).await;
            }

            match outcome.status {
                BuildStatus::Pending => {}
                BuildStatus::Success => {
                    return step
                        .complete(vec![LogBatch::info(["Managed server deployed successfully."])])
                        .await;
                }
                BuildStatus::Failed => {
                    step.fail(vec![LogBatch::error(["Deployment failed."])])
                        .await?;
                    return Err(DeployError::provider(format!(
                        "{} build failed",
                        adapter.name()
                    )));
                }
            }
        }
    }

    async fn discover(
        &self,
        ctx: &RunContext,
        steps: &StepManager,
        adapter: &dyn ProviderAdapter,
    ) -> DeployResult<Discovery> {
        let step = steps
            .create_step(
                StepType::Discovering,
                vec![LogBatch::info(["Discovering server capabilities..."])],
            )
            .await?;

        let discovery = match adapter.discover().await {
            Ok(discovery) => discovery,
            Err(e) => {
                let summary = if ctx.instance.kind.is_lambda() {
                    "Managed server discovery failed."
                } else {
                    "Remote server connection test failed."
                };
                return Err(fail_step(&step, e, summary).await);
            }
        };

        let mut lines = Vec::new();
        match &discovery.capabilities {
            Some(capabilities) => {
                lines.push("Server capabilities discovered successfully.".to_owned());
                let pretty = serde_json::to_string_pretty(capabilities)
                    .map_err(|e| DeployError::Serialisation(e.to_string()))?;
                lines.extend(pretty.lines().map(str::to_owned));
            }
            None => {
                lines.push("Remote server connection test successful.".to_owned());
                if let Some(endpoint) = adapter.endpoint() {
                    lines.push(format!(
                        "Able to connect to the remote server at {endpoint}."
                    ));
                }
            }
        }
        step.add_log(LogBatch::info(lines)).await;

        if let Err(e) = self.bootstrap_oauth(ctx, &step, adapter, &discovery).await {
            return Err(fail_step(&step, e, "OAuth configuration failed.").await);
        }

        step.complete(Vec::new()).await?;
        Ok(discovery)
    }

    async fn bootstrap_oauth(
        &self,
        ctx: &RunContext,
        step: &StepHandle,
        adapter: &dyn ProviderAdapter,
        discovery: &Discovery,
    ) -> DeployResult<()> {
        if ctx.instance.oauth_config_id.is_some() {
            return Ok(());
        }
        if !discovery.oauth.enabled {
            if !ctx.instance.kind.is_lambda() {
                let url = adapter.endpoint().unwrap_or_default();
                step.add_log(LogBatch::info([format!(
                    "No OAuth configuration found for remote server at {url}."
                )]))
                .await;
            }
            return Ok(());
        }

        step.add_log(LogBatch::info(["OAuth is enabled, creating configuration..."]))
            .await;
        let config_id = self
            .oauth_configs
            .create_config(&OAuthConfigRequest {
                instance_id: ctx.instance.id.clone(),
                custom_server_id: ctx.server.id.clone(),
                discovered: discovery.oauth.document.clone(),
                has_form: discovery.oauth.has_form,
            })
            .await?;
        self.store
            .link_oauth_config(&ctx.instance.id, &config_id)
            .await?;

        info!(instance_id = %ctx.instance.id, config_id = %config_id, "OAuth configuration linked");
        step.add_log(LogBatch::info([format!(
            "OAuth configuration {config_id} linked."
        )]))
        .await;
        Ok(())
    }

    async fn publish(
        &self,
        ctx: &RunContext,
        steps: &StepManager,
        deploying: &Deployment<Deploying>,
        snapshot: CapabilitySnapshot,
    ) -> DeployResult<()> {
        let step = steps
            .create_step(
                StepType::Publishing,
                vec![LogBatch::info(["Publishing server version..."])],
            )
            .await?;
        step.add_log(LogBatch::info(["Creating server version..."]))
            .await;
        step.add_log(LogBatch::info(["Updating current version..."]))
            .await;

        let request = PublishRequest {
            deployment_id: deploying.id().clone(),
            version_id: ctx.version.id.clone(),
            custom_server_id: ctx.server.id.clone(),
            snapshot,
            ended_at: Utc::now(),
        };
        match self.store.publish(&request).await {
            Ok(()) => Ok(()),
            Err(DeployError::InvalidStateTransition { from, .. }) => {
                info!(
                    deployment_id = %deploying.id(),
                    status = from,
                    "deployment finished by another run, not publishing"
                );
                step.complete(vec![LogBatch::info([
                    "Deployment already finished by another run.",
                ])])
                .await
            }
            Err(e) => {
                let e = DeployError::publish(e.to_string());
                Err(fail_step(&step, e, "Failed to publish the server version.").await)
            }
        }
    }

    async fn fail_deployment(
        &self,
        deploying: Deployment<Deploying>,
        version: &VersionRecord,
    ) -> DeployResult<()> {
        let failed = deploying.fail();
        match self.store.update_deployment(failed.record()).await {
            Ok(()) => {}
            Err(DeployError::InvalidStateTransition { from, .. }) => {
                warn!(
                    deployment_id = %failed.id(),
                    status = from,
                    "deployment finished by another run, keeping its outcome"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.store.mark_version_failed(&version.id).await?;
        let closed = self
            .store
            .fail_running_steps(failed.id(), Utc::now())
            .await?;
        if closed > 0 {
            warn!(deployment_id = %failed.id(), steps = closed, "closed running steps as failed");
        }
        Ok(())
    }
}

/// Record `error` on `step` and hand it back.
async fn fail_step(step: &StepHandle, error: DeployError, summary: &str) -> DeployError {
    warn!(
        step_id = %step.id(),
        step = %step.step_type(),
        error = %error,
        "step failed"
    );

    let mut lines = error.log_lines();
    lines.push(summary.to_owned());
    if let Err(e) = step.fail(vec![LogBatch::error(lines)]).await {
        warn!(step_id = %step.id(), error = %e, "failed to record step failure");
    }
    error
}
