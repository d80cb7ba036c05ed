//! Ordered, named steps for one deployment run.
//!
//! A [`StepManager`] is built fresh for every run, so indices start at 0 each
//! time a job is delivered. Steps leave `running` at most once; later calls
//! to [`StepHandle::complete`] or [`StepHandle::fail`] are ignored along with
//! their logs. Log appends are best-effort and never abort the pipeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::DeployResult;
use crate::store::DeploymentStore;
use crate::types::{
    DeploymentId, LogBatch, LogEntry, StepId, StepRecord, StepStatus, StepType,
};

/// Creates steps with a per-run index counter.
pub struct StepManager {
    store: Arc<dyn DeploymentStore>,
    deployment_id: DeploymentId,
    next_index: AtomicU32,
}

impl StepManager {
    /// Start a new run for a deployment.
    #[must_use]
    pub fn new(store: Arc<dyn DeploymentStore>, deployment_id: DeploymentId) -> Self {
        Self {
            store,
            deployment_id,
            next_index: AtomicU32::new(0),
        }
    }

    /// Deployment the steps belong to.
    #[must_use]
    pub const fn deployment_id(&self) -> &DeploymentId {
        &self.deployment_id
    }

    /// Persist a running step with optional initial logs.
    pub async fn create_step(
        &self,
        step_type: StepType,
        initial_logs: Vec<LogBatch>,
    ) -> DeployResult<StepHandle> {
        self.create_step_with_status(step_type, StepStatus::Running, initial_logs)
            .await
    }

    /// Persist a step in an explicit status.
    ///
    /// Steps created outside `running` get their end time immediately.
    pub async fn create_step_with_status(
        &self,
        step_type: StepType,
        status: StepStatus,
        initial_logs: Vec<LogBatch>,
    ) -> DeployResult<StepHandle> {
        let now = Utc::now();
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let record = StepRecord {
            id: StepId::generate(),
            deployment_id: self.deployment_id.clone(),
            step_type,
            status,
            index,
            started_at: now,
            ended_at: (status != StepStatus::Running).then_some(now),
            logs: initial_logs.into_iter().map(LogEntry::now).collect(),
        };

        self.store.insert_step(&record).await?;
        debug!(
            deployment_id = %self.deployment_id,
            step = %step_type,
            index,
            status = %status,
            "created step"
        );

        Ok(StepHandle {
            store: Arc::clone(&self.store),
            id: record.id,
            step_type,
            status: Mutex::new(status),
        })
    }
}

/// Handle to one persisted step.
pub struct StepHandle {
    store: Arc<dyn DeploymentStore>,
    id: StepId,
    step_type: StepType,
    status: Mutex<StepStatus>,
}

impl StepHandle {
    /// Step identifier.
    #[must_use]
    pub const fn id(&self) -> &StepId {
        &self.id
    }

    /// Phase of the step.
    #[must_use]
    pub const fn step_type(&self) -> StepType {
        self.step_type
    }

    /// Last status this handle observed.
    pub async fn status(&self) -> StepStatus {
        *self.status.lock().await
    }

    /// Mark the step completed. No-op if it already left `running`.
    pub async fn complete(&self, logs: Vec<LogBatch>) -> DeployResult<()> {
        self.finish(StepStatus::Completed, logs).await
    }

    /// Mark the step failed. No-op if it already left `running`.
    pub async fn fail(&self, logs: Vec<LogBatch>) -> DeployResult<()> {
        self.finish(StepStatus::Failed, logs).await
    }

    async fn finish(&self, target: StepStatus, logs: Vec<LogBatch>) -> DeployResult<()> {
        let mut status = self.status.lock().await;
        if *status != StepStatus::Running {
            return Ok(());
        }

        let entries: Vec<LogEntry> = logs.into_iter().map(LogEntry::now).collect();
        let applied = self
            .store
            .finish_step(&self.id, target, Utc::now(), &entries)
            .await?;
        if !applied {
            debug!(step_id = %self.id, "step already closed by another writer");
        }
        *status = target;

        Ok(())
    }

    /// Append one log entry regardless of the step's status.
    ///
    /// Write failures are logged and swallowed.
    pub async fn add_log(&self, batch: LogBatch) {
        let entry = LogEntry::now(batch);
        if let Err(e) = self.store.append_step_log(&self.id, &entry).await {
            warn!(step_id = %self.id, error = %e, "failed to append step log");
        }
    }
}
