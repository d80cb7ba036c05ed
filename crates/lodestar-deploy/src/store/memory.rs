//! In-memory deployment store for testing.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DeployError, DeployResult};
use crate::types::{
    CustomServerId, CustomServerRecord, DeploymentId, DeploymentRecord, DeploymentStatus,
    InstanceId, InstanceRecord, LogEntry, ManagedProject, OAuthConfigId, ProviderInstance,
    StepId, StepRecord, StepStatus, VersionId, VersionRecord, VersionStatus,
};

use super::{DeploymentStore, PublishRequest};

#[derive(Debug, Default)]
struct Tables {
    deployments: HashMap<String, DeploymentRecord>,
    steps: Vec<StepRecord>,
    versions: HashMap<String, VersionRecord>,
    servers: HashMap<String, CustomServerRecord>,
    instances: HashMap<String, InstanceRecord>,
    projects: HashMap<String, ManagedProject>,
}

impl Tables {
    fn step_mut(&mut self, id: &StepId) -> DeployResult<&mut StepRecord> {
        self.steps
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| DeployError::NotFound(format!("step {id}")))
    }

    fn instance_mut(&mut self, id: &InstanceId) -> DeployResult<&mut InstanceRecord> {
        self.instances
            .get_mut(id.as_str())
            .ok_or_else(|| DeployError::NotFound(format!("instance {id}")))
    }
}

/// In-memory deployment store for testing.
///
/// All tables sit behind one lock, which makes [`DeploymentStore::publish`]
/// atomic. Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> DeployResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| DeployError::internal("lock poisoned"))
    }

    fn write(&self) -> DeployResult<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| DeployError::internal("lock poisoned"))
    }
}

fn insert_unique<T: Clone>(map: &mut HashMap<String, T>, key: &str, value: &T) -> DeployResult<()> {
    if map.contains_key(key) {
        return Err(DeployError::internal(format!("record {key} already exists")));
    }
    map.insert(key.to_owned(), value.clone());
    Ok(())
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        insert_unique(&mut tables.deployments, record.id.as_str(), record)
    }

    async fn get_deployment(&self, id: &DeploymentId) -> DeployResult<Option<DeploymentRecord>> {
        Ok(self.read()?.deployments.get(id.as_str()).cloned())
    }

    async fn deployment_for_version(
        &self,
        version_id: &VersionId,
    ) -> DeployResult<Option<DeploymentRecord>> {
        Ok(self
            .read()?
            .deployments
            .values()
            .find(|d| &d.version_id == version_id)
            .cloned())
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        let existing = tables
            .deployments
            .get_mut(record.id.as_str())
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", record.id)))?;
        if existing.status.is_terminal() {
            return Err(DeployError::InvalidStateTransition {
                from: existing.status.as_str(),
                to: record.status.as_str(),
            });
        }

        existing.status = record.status;
        existing.started_at = record.started_at;
        existing.ended_at = record.ended_at;
        Ok(())
    }

    async fn insert_step(&self, step: &StepRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        if tables.steps.iter().any(|s| s.id == step.id) {
            return Err(DeployError::internal(format!("step {} already exists", step.id)));
        }
        tables.steps.push(step.clone());
        Ok(())
    }

    async fn finish_step(
        &self,
        id: &StepId,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        logs: &[LogEntry],
    ) -> DeployResult<bool> {
        let mut tables = self.write()?;
        let step = tables.step_mut(id)?;
        if step.status != StepStatus::Running {
            return Ok(false);
        }

        step.status = status;
        step.ended_at = Some(ended_at);
        step.logs.extend_from_slice(logs);
        Ok(true)
    }

    async fn append_step_log(&self, id: &StepId, entry: &LogEntry) -> DeployResult<()> {
        let mut tables = self.write()?;
        tables.step_mut(id)?.logs.push(entry.clone());
        Ok(())
    }

    async fn fail_running_steps(
        &self,
        deployment_id: &DeploymentId,
        ended_at: DateTime<Utc>,
    ) -> DeployResult<u64> {
        let mut tables = self.write()?;
        let mut changed = 0;
        for step in tables
            .steps
            .iter_mut()
            .filter(|s| &s.deployment_id == deployment_id && s.status == StepStatus::Running)
        {
            step.status = StepStatus::Failed;
            step.ended_at = Some(ended_at);
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> DeployResult<Vec<StepRecord>> {
        Ok(self
            .read()?
            .steps
            .iter()
            .filter(|s| &s.deployment_id == deployment_id)
            .cloned()
            .collect())
    }

    async fn insert_version(&self, version: &VersionRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        insert_unique(&mut tables.versions, version.id.as_str(), version)
    }

    async fn get_version(&self, id: &VersionId) -> DeployResult<Option<VersionRecord>> {
        Ok(self.read()?.versions.get(id.as_str()).cloned())
    }

    async fn version_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> DeployResult<Option<VersionRecord>> {
        Ok(self
            .read()?
            .versions
            .values()
            .find(|v| &v.instance_id == instance_id)
            .cloned())
    }

    async fn mark_version_failed(&self, id: &VersionId) -> DeployResult<()> {
        let mut tables = self.write()?;
        let version = tables
            .versions
            .get_mut(id.as_str())
            .ok_or_else(|| DeployError::NotFound(format!("version {id}")))?;
        if version.status != VersionStatus::Available {
            version.status = VersionStatus::DeploymentFailed;
        }
        Ok(())
    }

    async fn insert_server(&self, server: &CustomServerRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        insert_unique(&mut tables.servers, server.id.as_str(), server)
    }

    async fn get_server(&self, id: &CustomServerId) -> DeployResult<Option<CustomServerRecord>> {
        Ok(self.read()?.servers.get(id.as_str()).cloned())
    }

    async fn insert_instance(&self, instance: &InstanceRecord) -> DeployResult<()> {
        let mut tables = self.write()?;
        insert_unique(&mut tables.instances, instance.id.as_str(), instance)
    }

    async fn get_instance(&self, id: &InstanceId) -> DeployResult<Option<InstanceRecord>> {
        Ok(self.read()?.instances.get(id.as_str()).cloned())
    }

    async fn set_instance_provider(
        &self,
        id: &InstanceId,
        provider: &ProviderInstance,
    ) -> DeployResult<()> {
        let mut tables = self.write()?;
        tables.instance_mut(id)?.provider = Some(provider.clone());
        Ok(())
    }

    async fn link_oauth_config(
        &self,
        id: &InstanceId,
        config_id: &OAuthConfigId,
    ) -> DeployResult<()> {
        let mut tables = self.write()?;
        tables.instance_mut(id)?.oauth_config_id = Some(config_id.clone());
        Ok(())
    }

    async fn find_managed_project(
        &self,
        custom_server_id: &CustomServerId,
    ) -> DeployResult<Option<ManagedProject>> {
        Ok(self
            .read()?
            .projects
            .get(custom_server_id.as_str())
            .cloned())
    }

    async fn insert_managed_project(&self, project: &ManagedProject) -> DeployResult<()> {
        let mut tables = self.write()?;
        insert_unique(
            &mut tables.projects,
            project.custom_server_id.as_str(),
            project,
        )
    }

    async fn publish(&self, request: &PublishRequest) -> DeployResult<()> {
        let mut tables = self.write()?;

        // Validate everything before the first write so a failure leaves no trace.
        if !tables.versions.contains_key(request.version_id.as_str()) {
            return Err(DeployError::NotFound(format!("version {}", request.version_id)));
        }
        if !tables.servers.contains_key(request.custom_server_id.as_str()) {
            return Err(DeployError::NotFound(format!(
                "server {}",
                request.custom_server_id
            )));
        }
        match tables.deployments.get(request.deployment_id.as_str()) {
            None => {
                return Err(DeployError::NotFound(format!(
                    "deployment {}",
                    request.deployment_id
                )))
            }
            Some(d) if d.status.is_terminal() => {
                return Err(DeployError::InvalidStateTransition {
                    from: d.status.as_str(),
                    to: DeploymentStatus::Completed.as_str(),
                })
            }
            Some(_) => {}
        }

        if let Some(version) = tables.versions.get_mut(request.version_id.as_str()) {
            version.status = VersionStatus::Available;
            version.snapshot = Some(request.snapshot.clone());
        }
        if let Some(server) = tables.servers.get_mut(request.custom_server_id.as_str()) {
            server.current_version_id = Some(request.version_id.clone());
        }
        if let Some(deployment) = tables.deployments.get_mut(request.deployment_id.as_str()) {
            deployment.status = DeploymentStatus::Completed;
            deployment.ended_at = Some(request.ended_at);
        }
        for step in tables.steps.iter_mut().filter(|s| {
            s.deployment_id == request.deployment_id && s.status == StepStatus::Running
        }) {
            step.status = StepStatus::Completed;
            step.ended_at = Some(request.ended_at);
        }

        Ok(())
    }
}
