//! Integration tests for user-hosted remote servers.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use common::{FailingConfigs, RecordingConfigs, RemoteState, StaticDiscovery};
use lodestar_deploy::config::LambdaProvider;
use lodestar_deploy::egress::EgressPolicy;
use lodestar_deploy::oauth::{OAuthDiscovery, OAuthDocument, WellKnownDiscovery};
use lodestar_deploy::provider::{ProbeFailure, RemoteAdapter};
use lodestar_deploy::types::{InstanceKind, VersionStatus};
use lodestar_deploy::{DeploymentStatus, MemoryStore, StepStatus, StepType};

const UNUSED: &str = "http://127.0.0.1:9";

fn metadata() -> serde_json::Value {
    json!({
        "issuer": "https://auth.example.com",
        "authorization_endpoint": "https://auth.example.com/authorize",
        "token_endpoint": "https://auth.example.com/token",
    })
}

fn adapter(url: &str) -> RemoteAdapter {
    RemoteAdapter::new(
        url.to_owned(),
        reqwest::Client::new(),
        EgressPolicy::permissive(),
        Duration::from_secs(5),
        Arc::new(StaticDiscovery(None)),
    )
}

#[tokio::test]
async fn probe_falls_back_to_post() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::METHOD_NOT_ALLOWED,
        post_status: StatusCode::OK,
        metadata: None,
    })
    .await;

    let outcome = adapter(&url).probe().await.expect("probe");

    assert_eq!(outcome, Ok(()));
}

#[tokio::test]
async fn probe_accepts_unauthorized() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::UNAUTHORIZED,
        post_status: StatusCode::INTERNAL_SERVER_ERROR,
        metadata: None,
    })
    .await;

    let outcome = adapter(&url).probe().await.expect("probe");

    assert_eq!(outcome, Ok(()));
}

#[tokio::test]
async fn probe_failure_reports_the_get_status() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::SERVICE_UNAVAILABLE,
        post_status: StatusCode::INTERNAL_SERVER_ERROR,
        metadata: None,
    })
    .await;

    let outcome = adapter(&url).probe().await.expect("probe");

    let failure = outcome.expect_err("unreachable");
    assert_eq!(
        failure,
        ProbeFailure {
            status: Some(503),
            status_text: "Service Unavailable".to_owned(),
        }
    );
    assert_eq!(failure.to_string(), "503 Service Unavailable");
}

#[tokio::test]
async fn redirect_to_an_internal_address_is_not_followed() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let internal_hits = Arc::new(AtomicUsize::new(0));

    let target = format!("http://{addr}/internal");
    let hits = Arc::clone(&internal_hits);
    let router = Router::new()
        .route(
            "/mcp",
            get({
                let target = target.clone();
                move || async move { Redirect::temporary(&target) }
            })
            .post(move || async move { Redirect::temporary(&target) }),
        )
        .route(
            "/internal",
            get(move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
            }),
        );
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });

    // A public-looking name that resolves to the mock server.
    let client = reqwest::Client::builder()
        .resolve("mcp.example.com", addr)
        .redirect(EgressPolicy::strict().redirect_policy())
        .build()
        .expect("client");
    let adapter = RemoteAdapter::new(
        format!("http://mcp.example.com:{}/mcp", addr.port()),
        client,
        EgressPolicy::strict(),
        Duration::from_secs(5),
        Arc::new(StaticDiscovery(None)),
    );

    let outcome = adapter.probe().await.expect("probe");

    let failure = outcome.expect_err("redirect blocked");
    assert_eq!(failure.status, None);
    assert_eq!(internal_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remote_deployment_keeps_enqueued_capabilities() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::METHOD_NOT_ALLOWED,
        post_status: StatusCode::OK,
        metadata: None,
    })
    .await;
    let config = common::config(LambdaProvider::SelfHosted, UNUSED, UNUSED);

    let fixture = common::seed(
        Arc::new(MemoryStore::new()),
        "1",
        InstanceKind::Remote { url: url.clone() },
    )
    .await;
    let configs = Arc::new(RecordingConfigs::default());
    let orchestrator = common::orchestrator(
        &config,
        Arc::clone(&fixture.store),
        Arc::new(StaticDiscovery(None)),
        Arc::<RecordingConfigs>::clone(&configs),
    );

    let job = fixture.job();
    orchestrator.run(&job).await.expect("run");

    assert_eq!(
        fixture.step_summary().await,
        vec![
            (StepType::Started, StepStatus::Completed),
            (StepType::ProviderCreate, StepStatus::Completed),
            (StepType::Discovering, StepStatus::Completed),
            (StepType::Publishing, StepStatus::Completed),
        ]
    );

    let version = fixture.version().await;
    assert_eq!(version.status, VersionStatus::Available);
    assert_eq!(version.snapshot, Some(job.target_version));

    let steps = fixture.steps().await;
    let lines: Vec<String> = steps[2].logs.iter().flat_map(|e| e.lines.clone()).collect();
    assert!(lines.contains(&"Remote server connection test successful.".to_owned()));
    assert!(lines.contains(&format!(
        "No OAuth configuration found for remote server at {url}."
    )));
    assert_eq!(configs.count(), 0);
}

#[tokio::test]
async fn unreachable_remote_fails_discovery() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::SERVICE_UNAVAILABLE,
        post_status: StatusCode::SERVICE_UNAVAILABLE,
        metadata: None,
    })
    .await;
    let config = common::config(LambdaProvider::SelfHosted, UNUSED, UNUSED);

    let fixture = common::seed(
        Arc::new(MemoryStore::new()),
        "1",
        InstanceKind::Remote { url: url.clone() },
    )
    .await;
    let orchestrator = common::orchestrator(
        &config,
        Arc::clone(&fixture.store),
        Arc::new(StaticDiscovery(None)),
        Arc::new(RecordingConfigs::default()),
    );

    orchestrator.run(&fixture.job()).await.expect("run");

    assert_eq!(
        fixture.step_summary().await,
        vec![
            (StepType::Started, StepStatus::Completed),
            (StepType::ProviderCreate, StepStatus::Completed),
            (StepType::Discovering, StepStatus::Failed),
        ]
    );
    let steps = fixture.steps().await;
    let failure = steps[2].logs.last().expect("failure entry");
    assert!(failure.is_error);
    assert!(failure.lines[0].contains("503 Service Unavailable"));
    assert_eq!(
        failure.lines.last().map(String::as_str),
        Some("Remote server connection test failed.")
    );

    assert_eq!(fixture.deployment().await.status, DeploymentStatus::Failed);
    assert_eq!(
        fixture.version().await.status,
        VersionStatus::DeploymentFailed
    );
}

#[tokio::test]
async fn private_remote_is_blocked_by_strict_egress() {
    let mut config = common::config(LambdaProvider::SelfHosted, UNUSED, UNUSED);
    config.egress.allow_private = false;

    let fixture = common::seed(
        Arc::new(MemoryStore::new()),
        "1",
        InstanceKind::Remote {
            url: "https://10.0.0.5/mcp".to_owned(),
        },
    )
    .await;
    let orchestrator = common::orchestrator(
        &config,
        Arc::clone(&fixture.store),
        Arc::new(StaticDiscovery(None)),
        Arc::new(RecordingConfigs::default()),
    );

    orchestrator.run(&fixture.job()).await.expect("run");

    assert_eq!(
        fixture.step_summary().await,
        vec![
            (StepType::Started, StepStatus::Completed),
            (StepType::ProviderCreate, StepStatus::Failed),
        ]
    );
    let steps = fixture.steps().await;
    let failure = steps[1].logs.last().expect("failure entry");
    assert!(failure.lines[0].starts_with("egress blocked"));
    assert_eq!(fixture.deployment().await.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn discovered_metadata_is_linked_to_the_instance() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::OK,
        post_status: StatusCode::OK,
        metadata: Some(metadata()),
    })
    .await;
    let config = common::config(LambdaProvider::SelfHosted, UNUSED, UNUSED);

    let fixture = common::seed(
        Arc::new(MemoryStore::new()),
        "1",
        InstanceKind::Remote { url: url.clone() },
    )
    .await;
    let discovery = Arc::new(WellKnownDiscovery::new(
        reqwest::Client::new(),
        EgressPolicy::permissive(),
        Duration::from_secs(5),
    ));
    let configs = Arc::new(RecordingConfigs::default());
    let orchestrator = common::orchestrator(
        &config,
        Arc::clone(&fixture.store),
        discovery,
        Arc::<RecordingConfigs>::clone(&configs),
    );

    orchestrator.run(&fixture.job()).await.expect("run");

    assert_eq!(fixture.deployment().await.status, DeploymentStatus::Completed);

    let requests = configs.requests.lock().expect("requests lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].discovered,
        OAuthDocument::from_value(metadata())
    );
    assert!(!requests[0].has_form);
    assert!(fixture.instance().await.oauth_config_id.is_some());
}

#[tokio::test]
async fn well_known_discovery_ignores_plain_http_when_strict() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::OK,
        post_status: StatusCode::OK,
        metadata: Some(metadata()),
    })
    .await;
    let discovery = WellKnownDiscovery::new(
        reqwest::Client::new(),
        EgressPolicy::strict(),
        Duration::from_secs(5),
    );

    assert_eq!(discovery.discover(&url).await, None);
}

#[tokio::test]
async fn oauth_config_failure_fails_the_remote_deployment() {
    let url = common::spawn_remote(RemoteState {
        get_status: StatusCode::OK,
        post_status: StatusCode::OK,
        metadata: None,
    })
    .await;
    let config = common::config(LambdaProvider::SelfHosted, UNUSED, UNUSED);

    let fixture = common::seed(
        Arc::new(MemoryStore::new()),
        "1",
        InstanceKind::Remote { url: url.clone() },
    )
    .await;
    let orchestrator = common::orchestrator(
        &config,
        Arc::clone(&fixture.store),
        Arc::new(StaticDiscovery(OAuthDocument::from_value(metadata()))),
        Arc::new(FailingConfigs),
    );

    orchestrator.run(&fixture.job()).await.expect("run");

    assert_eq!(
        fixture.step_summary().await,
        vec![
            (StepType::Started, StepStatus::Completed),
            (StepType::ProviderCreate, StepStatus::Completed),
            (StepType::Discovering, StepStatus::Failed),
        ]
    );
    let steps = fixture.steps().await;
    let failure = steps[2].logs.last().expect("failure entry");
    assert!(failure.is_error);
    assert_eq!(
        failure.lines.last().map(String::as_str),
        Some("OAuth configuration failed.")
    );

    assert_eq!(fixture.deployment().await.status, DeploymentStatus::Failed);
    assert_eq!(
        fixture.version().await.status,
        VersionStatus::DeploymentFailed
    );
    assert!(fixture.instance().await.oauth_config_id.is_none());
}
