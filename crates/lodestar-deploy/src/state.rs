//! Typestate pattern for the deployment status machine.
//!
//! Deployment statuses only move forward. Encoding them in the type system
//! makes a backwards transition a compile-time error in the orchestrator.
//!
//! ```text
//! Pending ──▶ Deploying ──▶ Completed
//!    │            │
//!    └────────────┴──────▶ Failed
//! ```

use std::marker::PhantomData;

use chrono::Utc;

use crate::error::{DeployError, DeployResult};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Deployment created, waiting for a worker.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// A worker is running the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Deploying;

/// The new version is live.
#[derive(Debug, Clone, Copy)]
pub struct Completed;

/// The pipeline failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Pending {}
impl private::Sealed for Deploying {}
impl private::Sealed for Completed {}
impl private::Sealed for Failed {}

impl DeploymentState for Pending {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Pending
    }
}

impl DeploymentState for Deploying {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Deploying
    }
}

impl DeploymentState for Completed {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Completed
    }
}

impl DeploymentState for Failed {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Failed
    }
}

/// A deployment in a specific state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    record: DeploymentRecord,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the underlying record.
    #[must_use]
    pub const fn record(&self) -> &DeploymentRecord {
        &self.record
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.record.id
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Convert into the underlying record.
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        self.record
    }

    fn transition<T: DeploymentState>(mut self) -> Deployment<T> {
        self.record.status = T::status();
        Deployment {
            record: self.record,
            _state: PhantomData,
        }
    }

    fn finish<T: DeploymentState>(mut self) -> Deployment<T> {
        self.record.ended_at = Some(Utc::now());
        self.transition()
    }
}

impl Deployment<Pending> {
    /// Wrap a freshly created record.
    #[must_use]
    pub fn create(record: DeploymentRecord) -> Self {
        Self {
            record,
            _state: PhantomData,
        }
    }

    /// A worker picked the deployment up.
    #[must_use]
    pub fn start(mut self) -> Deployment<Deploying> {
        self.record.started_at = Some(Utc::now());
        self.transition()
    }

    /// Fail before the pipeline started.
    #[must_use]
    pub fn fail(self) -> Deployment<Failed> {
        self.finish()
    }
}

impl Deployment<Deploying> {
    /// A redelivered job restarts a run that never finished.
    #[must_use]
    pub fn restart(mut self) -> Self {
        self.record.started_at = Some(Utc::now());
        self
    }

    /// The version was published.
    #[must_use]
    pub fn complete(self) -> Deployment<Completed> {
        self.finish()
    }

    /// The pipeline failed.
    #[must_use]
    pub fn fail(self) -> Deployment<Failed> {
        self.finish()
    }
}

/// A deployment whose status is only known at runtime.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in pending state.
    Pending(Deployment<Pending>),
    /// Deployment in deploying state.
    Deploying(Deployment<Deploying>),
    /// Deployment in completed state.
    Completed(Deployment<Completed>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
}

impl AnyDeployment {
    /// Wrap a record loaded from the store.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        match record.status {
            DeploymentStatus::Pending => Self::Pending(Deployment {
                record,
                _state: PhantomData,
            }),
            DeploymentStatus::Deploying => Self::Deploying(Deployment {
                record,
                _state: PhantomData,
            }),
            DeploymentStatus::Completed => Self::Completed(Deployment {
                record,
                _state: PhantomData,
            }),
            DeploymentStatus::Failed => Self::Failed(Deployment {
                record,
                _state: PhantomData,
            }),
        }
    }

    /// Get a reference to the underlying record.
    #[must_use]
    pub const fn record(&self) -> &DeploymentRecord {
        match self {
            Self::Pending(d) => d.record(),
            Self::Deploying(d) => d.record(),
            Self::Completed(d) => d.record(),
            Self::Failed(d) => d.record(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Pending(_) => DeploymentStatus::Pending,
            Self::Deploying(_) => DeploymentStatus::Deploying,
            Self::Completed(_) => DeploymentStatus::Completed,
            Self::Failed(_) => DeploymentStatus::Failed,
        }
    }

    /// Check if the deployment can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }

    /// Move a pending or interrupted deployment into `deploying`.
    ///
    /// Returns an error for terminal deployments.
    pub fn begin(self) -> DeployResult<Deployment<Deploying>> {
        match self {
            Self::Pending(d) => Ok(d.start()),
            Self::Deploying(d) => Ok(d.restart()),
            other => Err(DeployError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "deploying",
            }),
        }
    }
}
