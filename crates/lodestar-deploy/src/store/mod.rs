//! Deployment storage backends.
//!
//! This module provides the trait and implementations for persisting every
//! record the pipeline touches. The primary implementation uses PostgreSQL,
//! but an in-memory implementation is provided for testing and local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DeployResult;
use crate::types::{
    CapabilitySnapshot, CustomServerId, CustomServerRecord, DeploymentId, DeploymentRecord,
    InstanceId, InstanceRecord, LogEntry, ManagedProject, OAuthConfigId, ProviderInstance,
    StepId, StepRecord, StepStatus, VersionId, VersionRecord,
};

/// Everything written when a version goes live.
///
/// Applied as one atomic unit: the version becomes available with its final
/// snapshot, is marked current for its server, the deployment completes and
/// every running step of the deployment completes.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Deployment being completed.
    pub deployment_id: DeploymentId,
    /// Version being activated.
    pub version_id: VersionId,
    /// Server whose current version changes.
    pub custom_server_id: CustomServerId,
    /// Final capabilities.
    pub snapshot: CapabilitySnapshot,
    /// Completion time for the deployment and its running steps.
    pub ended_at: DateTime<Utc>,
}

/// Backend for storing deployment state.
///
/// Implementations must make [`DeploymentStore::publish`] atomic. Step
/// transitions out of `running` are conditional so that a finished step is
/// never rewritten.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    // Deployments

    /// Insert a new deployment record.
    async fn insert_deployment(&self, record: &DeploymentRecord) -> DeployResult<()>;

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> DeployResult<Option<DeploymentRecord>>;

    /// Find the deployment that produces a version.
    async fn deployment_for_version(
        &self,
        version_id: &VersionId,
    ) -> DeployResult<Option<DeploymentRecord>>;

    /// Persist status and timestamps of a deployment.
    ///
    /// A deployment already `completed` or `failed` is left as is and
    /// [`InvalidStateTransition`](crate::error::DeployError::InvalidStateTransition)
    /// is returned.
    async fn update_deployment(&self, record: &DeploymentRecord) -> DeployResult<()>;

    // Steps

    /// Insert a new step.
    async fn insert_step(&self, step: &StepRecord) -> DeployResult<()>;

    /// Move a running step to `status`, appending `logs`.
    ///
    /// Returns `false` without writing anything if the step is not running.
    async fn finish_step(
        &self,
        id: &StepId,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        logs: &[LogEntry],
    ) -> DeployResult<bool>;

    /// Append one entry to a step log regardless of its status.
    async fn append_step_log(&self, id: &StepId, entry: &LogEntry) -> DeployResult<()>;

    /// Fail every running step of a deployment.
    ///
    /// Returns the number of steps changed.
    async fn fail_running_steps(
        &self,
        deployment_id: &DeploymentId,
        ended_at: DateTime<Utc>,
    ) -> DeployResult<u64>;

    /// List the steps of a deployment in creation order.
    async fn list_steps(&self, deployment_id: &DeploymentId) -> DeployResult<Vec<StepRecord>>;

    // Versions and servers

    /// Insert a new version record.
    async fn insert_version(&self, version: &VersionRecord) -> DeployResult<()>;

    /// Get a version by ID.
    async fn get_version(&self, id: &VersionId) -> DeployResult<Option<VersionRecord>>;

    /// Find the version served by an instance.
    async fn version_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> DeployResult<Option<VersionRecord>>;

    /// Mark a version `deployment_failed`, unless it is already `available`.
    async fn mark_version_failed(&self, id: &VersionId) -> DeployResult<()>;

    /// Insert a new custom server.
    async fn insert_server(&self, server: &CustomServerRecord) -> DeployResult<()>;

    /// Get a custom server by ID.
    async fn get_server(&self, id: &CustomServerId) -> DeployResult<Option<CustomServerRecord>>;

    // Instances

    /// Insert a new instance.
    async fn insert_instance(&self, instance: &InstanceRecord) -> DeployResult<()>;

    /// Get an instance by ID.
    async fn get_instance(&self, id: &InstanceId) -> DeployResult<Option<InstanceRecord>>;

    /// Record the live provider identity of an instance.
    async fn set_instance_provider(
        &self,
        id: &InstanceId,
        provider: &ProviderInstance,
    ) -> DeployResult<()>;

    /// Link an OAuth configuration to an instance.
    async fn link_oauth_config(
        &self,
        id: &InstanceId,
        config_id: &OAuthConfigId,
    ) -> DeployResult<()>;

    // Managed projects

    /// Find the managed platform project of a server.
    async fn find_managed_project(
        &self,
        custom_server_id: &CustomServerId,
    ) -> DeployResult<Option<ManagedProject>>;

    /// Record a newly created managed platform project.
    async fn insert_managed_project(&self, project: &ManagedProject) -> DeployResult<()>;

    // Activation

    /// Atomically activate a version and complete its deployment.
    async fn publish(&self, request: &PublishRequest) -> DeployResult<()>;
}
