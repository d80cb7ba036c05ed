//! Configuration for lodestar-deploy.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::{DeployError, DeployResult};

/// Top-level configuration for the deploy service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DeployConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Job queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Build phase configuration.
    #[serde(default)]
    pub build: BuildConfig,

    /// Capability discovery configuration.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Which provider builds lambda instances.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Managed deploy platform credentials.
    #[serde(default)]
    pub managed: ManagedConfig,

    /// Self-hosted runner configuration.
    #[serde(default)]
    pub self_hosted: SelfHostedConfig,

    /// OAuth collaborators.
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Outbound request filtering.
    #[serde(default)]
    pub egress: EgressConfig,
}

impl DeployConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `lodestar.toml` in the current directory (if present)
    /// 3. Environment variables with `LODESTAR_` prefix
    pub fn load() -> DeployResult<Self> {
        Self::from_file("lodestar.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> DeployResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LODESTAR_").split("__"))
            .extract()
            .map_err(|e| DeployError::configuration(e.to_string()))
    }
}

fn optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Timeout for outbound provider API requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8085)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. When unset the service keeps state in memory.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Job queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Deliveries per job before it is dropped.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Jobs processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay before a failed job is delivered again, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Jobs buffered before `enqueue` waits.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Longest a single delivery may run before it is abandoned and retried,
    /// in milliseconds.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

impl QueueConfig {
    /// Backoff as a [`Duration`].
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Job timeout as a [`Duration`].
    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

const fn default_attempts() -> u32 {
    10
}

const fn default_concurrency() -> usize {
    100
}

const fn default_backoff_ms() -> u64 {
    5_000
}

const fn default_channel_capacity() -> usize {
    1024
}

const fn default_job_timeout_ms() -> u64 {
    15 * 60 * 1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            concurrency: default_concurrency(),
            backoff_ms: default_backoff_ms(),
            channel_capacity: default_channel_capacity(),
            job_timeout_ms: default_job_timeout_ms(),
        }
    }
}

/// Build phase configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Delay before each status poll, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl BuildConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Capability discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Timeout for handshake and liveness calls, in seconds.
    #[serde(default = "default_discovery_timeout_secs")]
    pub timeout_secs: u64,

    /// Header carrying the instance's shared secret.
    #[serde(default = "default_token_header")]
    pub token_header: String,
}

impl DiscoveryConfig {
    /// Timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const fn default_discovery_timeout_secs() -> u64 {
    5
}

fn default_token_header() -> String {
    "lodestar-instance-token".to_owned()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_discovery_timeout_secs(),
            token_header: default_token_header(),
        }
    }
}

/// Provider used for lambda instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LambdaProvider {
    /// Managed deploy platform.
    #[default]
    ManagedDeploy,

    /// Self-hosted runner.
    SelfHosted,
}

/// Provider selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// Provider that builds lambda instances.
    #[serde(default)]
    pub lambda: LambdaProvider,
}

/// Managed deploy platform configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagedConfig {
    /// Base URL of the platform API.
    #[serde(default = "default_managed_api_url")]
    pub api_url: String,

    /// Organization that owns created projects.
    #[serde(default)]
    pub organization_id: Option<String>,

    /// Bearer token for the platform API.
    #[serde(default, deserialize_with = "optional_secret")]
    pub token: Option<SecretString>,

    /// Prefix of generated project names.
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,

    /// Build log substrings that are never shown to users.
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,

    /// Domain requested for each deployment. The platform expands
    /// `{project.name}` and `{deployment.id}`.
    #[serde(default = "default_domain_template")]
    pub domain_template: String,
}

fn default_managed_api_url() -> String {
    "https://api.deno.com/v1".to_owned()
}

fn default_project_prefix() -> String {
    "lodestar".to_owned()
}

fn default_noise_patterns() -> Vec<String> {
    vec![".deno.dev".to_owned()]
}

fn default_domain_template() -> String {
    "{project.name}-{deployment.id}.deno.dev".to_owned()
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            api_url: default_managed_api_url(),
            organization_id: None,
            token: None,
            project_prefix: default_project_prefix(),
            noise_patterns: default_noise_patterns(),
            domain_template: default_domain_template(),
        }
    }
}

/// Self-hosted runner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SelfHostedConfig {
    /// Base URL of the runner.
    #[serde(default = "default_runner_url")]
    pub runner_url: String,
}

fn default_runner_url() -> String {
    "http://localhost:8787".to_owned()
}

impl Default for SelfHostedConfig {
    fn default() -> Self {
        Self {
            runner_url: default_runner_url(),
        }
    }
}

/// OAuth collaborator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Base URL of the service that stores OAuth configurations.
    #[serde(default = "default_config_service_url")]
    pub config_service_url: String,

    /// Timeout for well-known document lookups, in milliseconds.
    #[serde(default = "default_oauth_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl OAuthConfig {
    /// Discovery timeout as a [`Duration`].
    #[must_use]
    pub const fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

fn default_config_service_url() -> String {
    "http://localhost:8086".to_owned()
}

const fn default_oauth_discovery_timeout_ms() -> u64 {
    2_000
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            config_service_url: default_config_service_url(),
            discovery_timeout_ms: default_oauth_discovery_timeout_ms(),
        }
    }
}

/// Outbound request filtering.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EgressConfig {
    /// Permit loopback, private and plain-HTTP targets. Development only.
    #[serde(default)]
    pub allow_private: bool,
}
