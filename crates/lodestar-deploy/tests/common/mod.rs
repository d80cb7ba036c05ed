//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde_json::{json, Value};

use lodestar_deploy::config::LambdaProvider;
use lodestar_deploy::oauth::{OAuthConfigRequest, OAuthConfigService, OAuthDiscovery, OAuthDocument};
use lodestar_deploy::provider::ProviderFactory;
use lodestar_deploy::store::PublishRequest;
use lodestar_deploy::types::{
    CustomServerId, CustomServerRecord, DeploymentId, InstanceKind, InstanceRecord, LogEntry,
    ManagedProject, OAuthConfigId, ProviderInstance, StepId, StepRecord, StepStatus, StepType,
    VersionId, VersionRecord, VersionStatus,
};
use lodestar_deploy::{
    CapabilitySnapshot, DeployConfig, DeployError, DeployJob, DeployResult,
    DeploymentOrchestrator, DeploymentRecord, DeploymentStore, InstanceId, MemoryStore,
};

pub const TOKEN: &str = "secret-token";
pub const TOKEN_HEADER: &str = "lodestar-instance-token";

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    format!("http://{addr}")
}

// =============================================================================
// Seed data
// =============================================================================

/// Records for one pending deployment.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub server: CustomServerRecord,
    pub instance: InstanceRecord,
    pub version: VersionRecord,
    pub deployment: DeploymentRecord,
}

impl Fixture {
    pub fn job(&self) -> DeployJob {
        DeployJob {
            instance_id: self.instance.id.clone(),
            target_version: CapabilitySnapshot {
                tools: vec![json!({"name": "remote-tool"})],
                ..CapabilitySnapshot::default()
            },
        }
    }

    pub async fn steps(&self) -> Vec<StepRecord> {
        self.store
            .list_steps(&self.deployment.id)
            .await
            .expect("list steps")
    }

    pub async fn step_summary(&self) -> Vec<(StepType, StepStatus)> {
        self.steps()
            .await
            .iter()
            .map(|s| (s.step_type, s.status))
            .collect()
    }

    pub async fn deployment(&self) -> DeploymentRecord {
        self.store
            .get_deployment(&self.deployment.id)
            .await
            .expect("get deployment")
            .expect("deployment exists")
    }

    pub async fn version(&self) -> VersionRecord {
        self.store
            .get_version(&self.version.id)
            .await
            .expect("get version")
            .expect("version exists")
    }

    pub async fn server(&self) -> CustomServerRecord {
        self.store
            .get_server(&self.server.id)
            .await
            .expect("get server")
            .expect("server exists")
    }

    pub async fn instance(&self) -> InstanceRecord {
        self.store
            .get_instance(&self.instance.id)
            .await
            .expect("get instance")
            .expect("instance exists")
    }
}

/// A bundle that passes validation.
pub fn valid_assets() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "package.json".to_owned(),
            r#"{"name":"weather","main":"server.ts"}"#.to_owned(),
        ),
        (
            "server.ts".to_owned(),
            "export default function start() {}".to_owned(),
        ),
    ])
}

pub async fn seed(store: Arc<MemoryStore>, suffix: &str, kind: InstanceKind) -> Fixture {
    seed_with_assets(store, suffix, kind, valid_assets()).await
}

pub async fn seed_with_assets(
    store: Arc<MemoryStore>,
    suffix: &str,
    kind: InstanceKind,
    assets: BTreeMap<String, String>,
) -> Fixture {
    let server_id = CustomServerId::new("csrv-1");
    let server = match store.get_server(&server_id).await.expect("get server") {
        Some(server) => server,
        None => {
            let server = CustomServerRecord {
                id: server_id.clone(),
                name: "weather".to_owned(),
                current_version_id: None,
            };
            store.insert_server(&server).await.expect("insert server");
            server
        }
    };

    let instance = InstanceRecord {
        id: InstanceId::new(format!("inst-{suffix}")),
        custom_server_id: server_id.clone(),
        kind,
        provider: None,
        security_token: TOKEN.to_owned(),
        assets,
        oauth_config_id: None,
    };
    let version = VersionRecord {
        id: VersionId::new(format!("ver-{suffix}")),
        custom_server_id: server_id.clone(),
        instance_id: instance.id.clone(),
        status: VersionStatus::Pending,
        snapshot: None,
        created_at: Utc::now(),
    };
    let deployment = DeploymentRecord::new(server_id, version.id.clone());

    store
        .insert_instance(&instance)
        .await
        .expect("insert instance");
    store.insert_version(&version).await.expect("insert version");
    store
        .insert_deployment(&deployment)
        .await
        .expect("insert deployment");

    Fixture {
        store,
        server,
        instance,
        version,
        deployment,
    }
}

// =============================================================================
// Orchestrator wiring
// =============================================================================

pub fn config(lambda: LambdaProvider, platform_url: &str, runner_url: &str) -> DeployConfig {
    let mut config = DeployConfig::default();
    config.provider.lambda = lambda;
    config.managed.api_url = platform_url.to_owned();
    config.managed.organization_id = Some("org-1".to_owned());
    config.managed.token = Some(SecretString::from("platform-token".to_owned()));
    config.self_hosted.runner_url = runner_url.to_owned();
    config.egress.allow_private = true;
    config.build.poll_interval_ms = 10;
    config
}

/// OAuth lookup with a fixed answer.
pub struct StaticDiscovery(pub Option<OAuthDocument>);

#[async_trait]
impl OAuthDiscovery for StaticDiscovery {
    async fn discover(&self, _server_url: &str) -> Option<OAuthDocument> {
        self.0.clone()
    }
}

/// Config service that records every request.
#[derive(Default)]
pub struct RecordingConfigs {
    pub requests: Mutex<Vec<OAuthConfigRequest>>,
}

impl RecordingConfigs {
    pub fn count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl OAuthConfigService for RecordingConfigs {
    async fn create_config(&self, request: &OAuthConfigRequest) -> DeployResult<OAuthConfigId> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        Ok(OAuthConfigId::new("oauth-1"))
    }
}

/// Config service whose backend is down.
pub struct FailingConfigs;

#[async_trait]
impl OAuthConfigService for FailingConfigs {
    async fn create_config(&self, _request: &OAuthConfigRequest) -> DeployResult<OAuthConfigId> {
        Err(DeployError::internal("oauth config service unavailable"))
    }
}

pub fn factory(
    config: &DeployConfig,
    store: Arc<MemoryStore>,
    discovery: Arc<dyn OAuthDiscovery>,
) -> ProviderFactory {
    ProviderFactory::from_config(config, reqwest::Client::new(), store, discovery)
        .expect("provider factory")
}

pub fn orchestrator(
    config: &DeployConfig,
    store: Arc<MemoryStore>,
    discovery: Arc<dyn OAuthDiscovery>,
    configs: Arc<dyn OAuthConfigService>,
) -> DeploymentOrchestrator {
    let providers = factory(config, Arc::clone(&store), discovery);
    DeploymentOrchestrator::new(store, providers, configs)
        .with_poll_interval(Duration::from_millis(10))
}

// =============================================================================
// Live instance handshake
// =============================================================================

pub fn capabilities() -> Value {
    json!({
        "tools": [{"name": "forecast"}],
        "prompts": [],
        "resourceTemplates": [],
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "weather", "version": "1.0.0"},
    })
}

fn authorised(headers: &HeaderMap) -> bool {
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == TOKEN)
}

fn handshake(headers: &HeaderMap, body: Value) -> (StatusCode, Json<Value>) {
    if authorised(headers) {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"message": "bad token"})))
    }
}

// =============================================================================
// Self-hosted runner
// =============================================================================

#[derive(Default)]
pub struct RunnerState {
    pub created: AtomicUsize,
    pub oauth_enabled: bool,
    pub oauth_has_form: bool,
    pub fail_discover: bool,
    pub discover_delay: Duration,
    pub payload: Mutex<Option<Value>>,
}

impl RunnerState {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub async fn spawn_runner(state: Arc<RunnerState>) -> String {
    async fn create(
        State(state): State<Arc<RunnerState>>,
        Json(payload): Json<Value>,
    ) -> Json<Value> {
        state.created.fetch_add(1, Ordering::SeqCst);
        *state.payload.lock().expect("payload lock") = Some(payload);
        Json(json!({"id": "run-1"}))
    }

    async fn discover(
        State(state): State<Arc<RunnerState>>,
        headers: HeaderMap,
        Path(_id): Path<String>,
    ) -> (StatusCode, Json<Value>) {
        tokio::time::sleep(state.discover_delay).await;
        if state.fail_discover {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "boom"})),
            );
        }
        handshake(&headers, capabilities())
    }

    async fn oauth(
        State(state): State<Arc<RunnerState>>,
        headers: HeaderMap,
        Path(_id): Path<String>,
    ) -> (StatusCode, Json<Value>) {
        handshake(
            &headers,
            json!({"enabled": state.oauth_enabled, "hasForm": state.oauth_has_form}),
        )
    }

    spawn(
        Router::new()
            .route("/deployments", post(create))
            .route("/{id}/discover", get(discover))
            .route("/{id}/oauth", get(oauth))
            .with_state(state),
    )
    .await
}

// =============================================================================
// Managed platform
// =============================================================================

/// One scripted answer of the status endpoint, plus the build log lines
/// that appear with it.
#[derive(Clone)]
pub struct ScriptedPoll {
    pub status: &'static str,
    pub lines: Vec<(&'static str, &'static str)>,
    pub live: bool,
}

impl ScriptedPoll {
    pub fn pending(lines: &[&'static str]) -> Self {
        Self {
            status: "pending",
            lines: lines.iter().map(|l| ("info", *l)).collect(),
            live: false,
        }
    }

    pub fn success(lines: &[&'static str]) -> Self {
        Self {
            status: "success",
            lines: lines.iter().map(|l| ("info", *l)).collect(),
            live: true,
        }
    }

    pub fn failed(lines: &[&'static str]) -> Self {
        Self {
            status: "failed",
            lines: lines.iter().map(|l| ("error", *l)).collect(),
            live: false,
        }
    }
}

pub struct PlatformState {
    pub project_creates: AtomicUsize,
    pub deployment_creates: AtomicUsize,
    pub polls: AtomicUsize,
    pub script: Vec<ScriptedPoll>,
    pub payload: Mutex<Option<Value>>,
    base_url: OnceLock<String>,
}

impl PlatformState {
    pub fn new(script: Vec<ScriptedPoll>) -> Self {
        Self {
            project_creates: AtomicUsize::new(0),
            deployment_creates: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            script,
            payload: Mutex::new(None),
            base_url: OnceLock::new(),
        }
    }

    pub fn instance_url(&self) -> String {
        format!("{}/instance", self.base_url.get().expect("platform started"))
    }

    fn current(&self, polls: usize) -> Option<&ScriptedPoll> {
        if polls == 0 || self.script.is_empty() {
            return None;
        }
        self.script.get(polls.min(self.script.len()) - 1)
    }
}

pub async fn spawn_platform(state: Arc<PlatformState>) -> String {
    async fn create_project(
        State(state): State<Arc<PlatformState>>,
        headers: HeaderMap,
        Path(_org): Path<String>,
    ) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok())
            != Some("Bearer platform-token")
        {
            return (StatusCode::UNAUTHORIZED, Json(json!({"message": "bad token"})));
        }
        state.project_creates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        (StatusCode::OK, Json(json!({"id": "proj-1"})))
    }

    async fn create_deployment(
        State(state): State<Arc<PlatformState>>,
        Path(_project): Path<String>,
        Json(payload): Json<Value>,
    ) -> Json<Value> {
        let n = state.deployment_creates.fetch_add(1, Ordering::SeqCst);
        *state.payload.lock().expect("payload lock") = Some(payload);
        Json(json!({"id": format!("ext-dep-{n}")}))
    }

    async fn status(
        State(state): State<Arc<PlatformState>>,
        Path(_id): Path<String>,
    ) -> Json<Value> {
        let polls = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let poll = state.current(polls).cloned().unwrap_or_else(|| ScriptedPoll::pending(&[]));
        let domains = if poll.live {
            vec![state.instance_url()]
        } else {
            Vec::new()
        };
        Json(json!({"status": poll.status, "domains": domains}))
    }

    async fn build_logs(
        State(state): State<Arc<PlatformState>>,
        Path(_id): Path<String>,
    ) -> Json<Value> {
        let polls = state.polls.load(Ordering::SeqCst).min(state.script.len());
        let lines: Vec<Value> = state.script[..polls]
            .iter()
            .flat_map(|p| p.lines.iter())
            .map(|(level, message)| json!({"level": level, "message": message}))
            .collect();
        Json(Value::Array(lines))
    }

    async fn discover(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        handshake(&headers, capabilities())
    }

    async fn oauth(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        handshake(&headers, json!({"enabled": false, "hasForm": false}))
    }

    let router = Router::new()
        .route("/organizations/{org}/projects", post(create_project))
        .route("/projects/{project}/deployments", post(create_deployment))
        .route("/deployments/{id}", get(status))
        .route("/deployments/{id}/build_logs", get(build_logs))
        .route("/instance/discover", get(discover))
        .route("/instance/oauth", get(oauth))
        .with_state(Arc::clone(&state));

    let url = spawn(router).await;
    state
        .base_url
        .set(url.clone())
        .expect("platform started once");
    url
}

// =============================================================================
// Remote MCP server
// =============================================================================

pub struct RemoteState {
    pub get_status: StatusCode,
    pub post_status: StatusCode,
    pub metadata: Option<Value>,
}

/// Serves `/mcp` with the configured statuses and, optionally, an
/// authorization server metadata document at the origin.
pub async fn spawn_remote(state: RemoteState) -> String {
    async fn mcp_get(State(state): State<Arc<RemoteState>>) -> StatusCode {
        state.get_status
    }

    async fn mcp_post(State(state): State<Arc<RemoteState>>) -> (StatusCode, Json<Value>) {
        (
            state.post_status,
            Json(json!({"jsonrpc": "2.0", "id": 0, "result": {}})),
        )
    }

    async fn metadata(State(state): State<Arc<RemoteState>>) -> (StatusCode, Json<Value>) {
        match &state.metadata {
            Some(document) => (StatusCode::OK, Json(document.clone())),
            None => (StatusCode::NOT_FOUND, Json(json!({}))),
        }
    }

    let base = spawn(
        Router::new()
            .route("/mcp", get(mcp_get).post(mcp_post))
            .route("/.well-known/oauth-authorization-server", get(metadata))
            .with_state(Arc::new(state)),
    )
    .await;
    format!("{base}/mcp")
}

// =============================================================================
// Store with a broken activation
// =============================================================================

/// Delegates to a [`MemoryStore`] but fails every publish.
pub struct FailingPublishStore(pub Arc<MemoryStore>);

#[async_trait]
impl DeploymentStore for FailingPublishStore {
    async fn insert_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        self.0.insert_deployment(record).await
    }

    async fn get_deployment(&self, id: &DeploymentId) -> DeployResult<Option<DeploymentRecord>> {
        self.0.get_deployment(id).await
    }

    async fn deployment_for_version(
        &self,
        version_id: &VersionId,
    ) -> DeployResult<Option<DeploymentRecord>> {
        self.0.deployment_for_version(version_id).await
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> DeployResult<()> {
        self.0.update_deployment(record).await
    }

    async fn insert_step(&self, step: &StepRecord) -> DeployResult<()> {
        self.0.insert_step(step).await
    }

    async fn finish_step(
        &self,
        id: &StepId,
        status: StepStatus,
        ended_at: DateTime<Utc>,
        logs: &[LogEntry],
    ) -> DeployResult<bool> {
        self.0.finish_step(id, status, ended_at, logs).await
    }

    async fn append_step_log(&self, id: &StepId, entry: &LogEntry) -> DeployResult<()> {
        self.0.append_step_log(id, entry).await
    }

    async fn fail_running_steps(
        &self,
        deployment_id: &DeploymentId,
        ended_at: DateTime<Utc>,
    ) -> DeployResult<u64> {
        self.0.fail_running_steps(deployment_id, ended_at).await
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> DeployResult<Vec<StepRecord>> {
        self.0.list_steps(deployment_id).await
    }

    async fn insert_version(&self, version: &VersionRecord) -> DeployResult<()> {
        self.0.insert_version(version).await
    }

    async fn get_version(&self, id: &VersionId) -> DeployResult<Option<VersionRecord>> {
        self.0.get_version(id).await
    }

    async fn version_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> DeployResult<Option<VersionRecord>> {
        self.0.version_for_instance(instance_id).await
    }

    async fn mark_version_failed(&self, id: &VersionId) -> DeployResult<()> {
        self.0.mark_version_failed(id).await
    }

    async fn insert_server(&self, server: &CustomServerRecord) -> DeployResult<()> {
        self.0.insert_server(server).await
    }

    async fn get_server(&self, id: &CustomServerId) -> DeployResult<Option<CustomServerRecord>> {
        self.0.get_server(id).await
    }

    async fn insert_instance(&self, instance: &InstanceRecord) -> DeployResult<()> {
        self.0.insert_instance(instance).await
    }

    async fn get_instance(&self, id: &InstanceId) -> DeployResult<Option<InstanceRecord>> {
        self.0.get_instance(id).await
    }

    async fn set_instance_provider(
        &self,
        id: &InstanceId,
        provider: &ProviderInstance,
    ) -> DeployResult<()> {
        self.0.set_instance_provider(id, provider).await
    }

    async fn link_oauth_config(
        &self,
        id: &InstanceId,
        config_id: &OAuthConfigId,
    ) -> DeployResult<()> {
        self.0.link_oauth_config(id, config_id).await
    }

    async fn find_managed_project(
        &self,
        custom_server_id: &CustomServerId,
    ) -> DeployResult<Option<ManagedProject>> {
        self.0.find_managed_project(custom_server_id).await
    }

    async fn insert_managed_project(&self, project: &ManagedProject) -> DeployResult<()> {
        self.0.insert_managed_project(project).await
    }

    async fn publish(&self, _request: &PublishRequest) -> DeployResult<()> {
        Err(DeployError::internal("disk full"))
    }
}
