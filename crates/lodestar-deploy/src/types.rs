//! Core types for lodestar-deploy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);
string_id!(
    /// Unique identifier for a deployment step.
    StepId
);
string_id!(
    /// Unique identifier for a server version.
    VersionId
);
string_id!(
    /// Unique identifier for a custom server.
    CustomServerId
);
string_id!(
    /// Unique identifier for a provider instance.
    InstanceId
);
string_id!(
    /// Unique identifier for a linked OAuth configuration.
    OAuthConfigId
);

// =============================================================================
// Deployment
// =============================================================================

/// Lifecycle status of a deployment.
///
/// Statuses only move forward: `pending → deploying → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, waiting for a worker.
    Pending,
    /// A worker is running the pipeline.
    Deploying,
    /// The new version is live.
    Completed,
    /// The pipeline failed.
    Failed,
}

impl DeploymentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Deploying => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// `deploying → deploying` is allowed so that a redelivered job can
    /// restart a run that crashed mid-way.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank() && !matches!((self, next), (Self::Pending, Self::Pending))
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "deploying" => Ok(Self::Deploying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// A deployment record as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Server being deployed.
    pub custom_server_id: CustomServerId,
    /// Version record this deployment will produce.
    pub version_id: VersionId,
    /// Current status.
    pub status: DeploymentStatus,
    /// When a worker first picked the deployment up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the deployment reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Create a new pending deployment.
    #[must_use]
    pub fn new(custom_server_id: CustomServerId, version_id: VersionId) -> Self {
        Self {
            id: DeploymentId::generate(),
            custom_server_id,
            version_id,
            status: DeploymentStatus::Pending,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// Steps and logs
// =============================================================================

/// Named phase of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Run started.
    Started,
    /// Instance provisioning or verification.
    ProviderCreate,
    /// Waiting for the instance build to finish.
    ProviderBuild,
    /// Capability discovery and OAuth bootstrap.
    Discovering,
    /// Atomic activation of the new version.
    Publishing,
    /// Terminal success marker; accepted in stored rows, not emitted by the pipeline.
    Deployed,
}

impl StepType {
    /// Get the type name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::ProviderCreate => "provider_create",
            Self::ProviderBuild => "provider_build",
            Self::Discovering => "discovering",
            Self::Publishing => "publishing",
            Self::Deployed => "deployed",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "provider_create" => Ok(Self::ProviderCreate),
            "provider_build" => Ok(Self::ProviderBuild),
            "discovering" => Ok(Self::Discovering),
            "publishing" => Ok(Self::Publishing),
            "deployed" => Ok(Self::Deployed),
            _ => Err(format!("unknown step type: {s}")),
        }
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl StepStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown step status: {s}")),
        }
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Informational output.
    #[default]
    Info,
    /// Error output.
    Error,
}

/// Lines to append to a step, before they are timestamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    /// Severity of every line in the batch.
    pub kind: LogKind,
    /// Ordered lines.
    pub lines: Vec<String>,
}

impl LogBatch {
    /// Informational batch.
    #[must_use]
    pub fn info<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: LogKind::Info,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Error batch.
    #[must_use]
    pub fn error<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: LogKind::Error,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

/// One timestamped entry in a step log.
///
/// Persisted as the tuple `[timestamp_ms, lines]`, or
/// `[timestamp_ms, lines, 1]` for error entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Ordered lines.
    pub lines: Vec<String>,
    /// Whether the entry reports an error.
    pub is_error: bool,
}

impl LogEntry {
    /// Timestamp a batch with the current time.
    #[must_use]
    pub fn now(batch: LogBatch) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            lines: batch.lines,
            is_error: batch.kind == LogKind::Error,
        }
    }
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.is_error { 3 } else { 2 };
        let mut tuple = serializer.serialize_tuple(len)?;
        tuple.serialize_element(&self.timestamp_ms)?;
        tuple.serialize_element(&self.lines)?;
        if self.is_error {
            tuple.serialize_element(&1u8)?;
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = LogEntry;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [timestamp, lines, error?] tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LogEntry, A::Error> {
                let timestamp_ms = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let lines = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let flag: Option<u8> = seq.next_element()?;
                Ok(LogEntry {
                    timestamp_ms,
                    lines,
                    is_error: flag.is_some_and(|f| f != 0),
                })
            }
        }

        deserializer.deserialize_seq(EntryVisitor)
    }
}

/// A deployment step as stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Unique step identifier.
    pub id: StepId,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// Phase this step represents.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Current status.
    pub status: StepStatus,
    /// Position within the run, starting at 0.
    pub index: u32,
    /// When the step was created.
    pub started_at: DateTime<Utc>,
    /// When the step left `running`.
    pub ended_at: Option<DateTime<Utc>>,
    /// Append-only log.
    pub logs: Vec<LogEntry>,
}

// =============================================================================
// Versions
// =============================================================================

/// Availability of a server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    /// Waiting for its deployment to finish.
    Pending,
    /// Published and usable.
    Available,
    /// Its deployment failed.
    DeploymentFailed,
}

impl VersionStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Available => "available",
            Self::DeploymentFailed => "deployment_failed",
        }
    }
}

impl std::str::FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "available" => Ok(Self::Available),
            "deployment_failed" => Ok(Self::DeploymentFailed),
            _ => Err(format!("unknown version status: {s}")),
        }
    }
}

/// Protocol capabilities reported by a live instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySnapshot {
    /// Tool descriptors.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    /// Prompt descriptors.
    #[serde(default)]
    pub prompts: Vec<serde_json::Value>,
    /// Resource template descriptors.
    #[serde(default)]
    pub resource_templates: Vec<serde_json::Value>,
    /// Raw server capabilities object.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Server implementation info.
    #[serde(default, alias = "implementation")]
    pub server_info: serde_json::Value,
    /// Free-form usage instructions.
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A server version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Unique version identifier.
    pub id: VersionId,
    /// Server the version belongs to.
    pub custom_server_id: CustomServerId,
    /// Instance that serves this version.
    pub instance_id: InstanceId,
    /// Availability.
    pub status: VersionStatus,
    /// Final capabilities, written once on publish.
    pub snapshot: Option<CapabilitySnapshot>,
    /// When the version record was created.
    pub created_at: DateTime<Utc>,
}

/// A custom server and its current version pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomServerRecord {
    /// Unique server identifier.
    pub id: CustomServerId,
    /// Display name.
    pub name: String,
    /// Version currently serving traffic.
    pub current_version_id: Option<VersionId>,
}

// =============================================================================
// Provider instances
// =============================================================================

/// What kind of server an instance record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceKind {
    /// Short-lived instance built from user code.
    Lambda,
    /// Pre-existing user-hosted server.
    Remote {
        /// URL supplied by the user.
        url: String,
    },
}

impl InstanceKind {
    /// Whether this instance needs a build phase.
    #[must_use]
    pub const fn is_lambda(&self) -> bool {
        matches!(self, Self::Lambda)
    }
}

/// Provider-specific identity of a live compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderInstance {
    /// Deployment on the managed platform.
    ManagedDeploy {
        /// Project owning the deployment.
        external_project_id: String,
        /// Deployment id assigned by the platform.
        external_deployment_id: String,
        /// Routable address, filled in by status polling.
        access_endpoint: Option<String>,
    },
    /// Deployment on the self-hosted runner.
    SelfHosted {
        /// Deployment id assigned by the runner.
        deployment_id: String,
        /// Address known as soon as the deployment exists.
        endpoint: String,
    },
    /// User-hosted server.
    Remote {
        /// URL supplied by the user.
        url: String,
    },
}

impl ProviderInstance {
    /// Address the instance can be reached on, if known.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::ManagedDeploy {
                access_endpoint, ..
            } => access_endpoint.as_deref(),
            Self::SelfHosted { endpoint, .. } => Some(endpoint),
            Self::Remote { url } => Some(url),
        }
    }
}

/// A provider instance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique instance identifier.
    pub id: InstanceId,
    /// Server the instance belongs to.
    pub custom_server_id: CustomServerId,
    /// Lambda or remote.
    pub kind: InstanceKind,
    /// Live identity once provisioned.
    pub provider: Option<ProviderInstance>,
    /// Shared secret the live instance echoes on control-plane calls.
    #[serde(skip_serializing, default)]
    pub security_token: String,
    /// Files making up the deployable bundle.
    #[serde(default)]
    pub assets: std::collections::BTreeMap<String, String>,
    /// Linked OAuth configuration, if any.
    pub oauth_config_id: Option<OAuthConfigId>,
}

/// External project created on the managed platform for a custom server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProject {
    /// Server that owns the project.
    pub custom_server_id: CustomServerId,
    /// Project id assigned by the platform.
    pub external_project_id: String,
}
