//! Lodestar deployment pipeline
//!
//! This crate publishes new versions of hosted MCP servers. A queued job
//! names an instance; the orchestrator provisions or verifies the compute
//! behind it, waits for the build, runs the capability discovery handshake,
//! optionally bootstraps OAuth, and activates the result as the server's
//! current version.
//!
//! # Architecture
//!
//! - **Steps**: every run writes an ordered log of named steps through a
//!   [`StepManager`], so users can replay what happened
//! - **Providers**: a [`ProviderAdapter`] per backend (managed deploy
//!   platform, self-hosted runner, user-hosted remote server)
//! - **Locking**: a [`ConcurrencyGuard`] keeps concurrent deployments of one
//!   server from creating two managed projects
//! - **Persistence**: a [`DeploymentStore`] with in-memory and PostgreSQL
//!   backends; activation is a single atomic [`DeploymentStore::publish`]
//! - **API surface**: HTTP endpoints to enqueue jobs and read deployments
//!
//! # State Machine
//!
//! Deployment statuses only move forward and are enforced with the typestate
//! pattern:
//!
//! ```text
//! Pending ──▶ Deploying ──▶ Completed
//!    │            │
//!    └────────────┴──────▶ Failed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lodestar_deploy::{
//!     DeployConfig, DeployJob, DeploymentOrchestrator, InstanceId, MemoryStore,
//! };
//!
//! let config = DeployConfig::load()?;
//! let store = Arc::new(MemoryStore::new());
//! let orchestrator =
//!     DeploymentOrchestrator::from_config(&config, reqwest::Client::new(), store)?;
//!
//! orchestrator
//!     .run(&DeployJob {
//!         instance_id: InstanceId::new("01j9zk4c8w1m"),
//!         target_version: Default::default(),
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod bundle;
pub mod config;
pub mod egress;
pub mod error;
pub mod lock;
pub mod oauth;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod service;
pub mod state;
pub mod steps;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::DeployConfig;
pub use error::{DeployError, DeployResult, ErrorKind};
pub use lock::ConcurrencyGuard;
pub use orchestrator::DeploymentOrchestrator;
pub use provider::{ProviderAdapter, ProviderFactory};
pub use queue::{DeployJob, JobQueue};
pub use service::DeployService;
pub use state::{
    AnyDeployment, Completed, Deploying, Deployment, DeploymentState, Failed, Pending,
};
pub use steps::{StepHandle, StepManager};
pub use store::{DeploymentStore, MemoryStore, PostgresStore};
pub use types::{
    CapabilitySnapshot, DeploymentId, DeploymentRecord, DeploymentStatus, InstanceId, LogEntry,
    StepRecord, StepStatus, StepType,
};
