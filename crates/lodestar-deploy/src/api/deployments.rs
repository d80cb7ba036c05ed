//! Job and deployment endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::error::DeployError;
use crate::queue::DeployJob;
use crate::types::{CustomServerId, DeploymentId, DeploymentRecord, StepRecord, VersionRecord};

use super::AppState;

/// A deployment with its ordered steps.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    /// The deployment record.
    #[serde(flatten)]
    pub deployment: DeploymentRecord,
    /// Steps in creation order, logs included.
    pub steps: Vec<StepRecord>,
}

/// Response for an accepted job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    /// Instance the job was queued for.
    pub instance_id: String,
    /// Always `queued`.
    pub status: &'static str,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(error: &DeployError) -> ApiError {
    (
        error_to_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn not_found(what: String) -> ApiError {
    api_error(&DeployError::NotFound(what))
}

/// Queue a deployment job.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(job): Json<DeployJob>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    if state
        .store
        .get_instance(&job.instance_id)
        .await
        .map_err(|e| api_error(&e))?
        .is_none()
    {
        return Err(not_found(format!("instance {}", job.instance_id)));
    }

    let instance_id = job.instance_id.to_string();
    state.queue.enqueue(job).await.map_err(|e| api_error(&e))?;
    info!(instance_id = %instance_id, "deployment job queued via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            instance_id,
            status: "queued",
        }),
    ))
}

/// Get a deployment and its steps.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let deployment_id = DeploymentId::new(&id);

    let deployment = state
        .store
        .get_deployment(&deployment_id)
        .await
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| not_found(format!("deployment {id}")))?;
    let steps = state
        .store
        .list_steps(&deployment_id)
        .await
        .map_err(|e| api_error(&e))?;

    Ok(Json(DeploymentResponse { deployment, steps }))
}

/// Get the version a server currently serves.
pub async fn current_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VersionRecord>, ApiError> {
    let server = state
        .store
        .get_server(&CustomServerId::new(&id))
        .await
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| not_found(format!("server {id}")))?;
    let version_id = server
        .current_version_id
        .ok_or_else(|| not_found(format!("current version of server {id}")))?;

    state
        .store
        .get_version(&version_id)
        .await
        .map_err(|e| api_error(&e))?
        .map(Json)
        .ok_or_else(|| not_found(format!("version {version_id}")))
}

const fn error_to_status(error: &DeployError) -> StatusCode {
    match error {
        DeployError::NotFound(_) => StatusCode::NOT_FOUND,
        DeployError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        DeployError::Validation { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::JobQueue;
    use crate::store::{DeploymentStore, MemoryStore, PublishRequest};
    use crate::types::{
        CapabilitySnapshot, CustomServerRecord, InstanceId, InstanceKind, InstanceRecord,
        VersionId, VersionStatus,
    };

    async fn seeded() -> (Arc<MemoryStore>, DeploymentRecord) {
        let store = Arc::new(MemoryStore::new());
        let server = CustomServerRecord {
            id: CustomServerId::new("csrv-1"),
            name: "weather".to_owned(),
            current_version_id: None,
        };
        let instance = InstanceRecord {
            id: InstanceId::new("inst-1"),
            custom_server_id: server.id.clone(),
            kind: InstanceKind::Lambda,
            provider: None,
            security_token: "secret".to_owned(),
            assets: Default::default(),
            oauth_config_id: None,
        };
        let version = VersionRecord {
            id: VersionId::new("ver-1"),
            custom_server_id: server.id.clone(),
            instance_id: instance.id.clone(),
            status: VersionStatus::Pending,
            snapshot: None,
            created_at: Utc::now(),
        };
        let deployment = DeploymentRecord::new(server.id.clone(), version.id.clone());

        store.insert_server(&server).await.expect("server");
        store.insert_instance(&instance).await.expect("instance");
        store.insert_version(&version).await.expect("version");
        store.insert_deployment(&deployment).await.expect("deployment");
        (store, deployment)
    }

    fn app(store: Arc<MemoryStore>) -> axum::Router {
        super::super::router(AppState {
            queue: Arc::new(JobQueue::new(&QueueConfig::default())),
            store,
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn enqueue_known_instance_is_accepted() {
        let (store, _) = seeded().await;

        let response = app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instanceId":"inst-1","targetVersion":{}}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["instanceId"], "inst-1");
        assert_eq!(body["status"], "queued");
    }

    #[tokio::test]
    async fn enqueue_unknown_instance_is_not_found() {
        let (store, _) = seeded().await;

        let response = app(store)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"instanceId":"missing"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_deployment_includes_steps() {
        let (store, deployment) = seeded().await;

        let response = app(store)
            .oneshot(
                Request::builder()
                    .uri(format!("/deployments/{}", deployment.id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], deployment.id.as_str());
        assert_eq!(body["status"], "pending");
        assert_eq!(body["steps"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn get_deployment_not_found() {
        let (store, _) = seeded().await;

        let response = app(store)
            .oneshot(
                Request::builder()
                    .uri("/deployments/nonexistent-id")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn current_version_follows_publish() {
        let (store, deployment) = seeded().await;
        let server_id = CustomServerId::new("csrv-1");

        let before = app(Arc::clone(&store))
            .oneshot(
                Request::builder()
                    .uri("/servers/csrv-1/current-version")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(before.status(), StatusCode::NOT_FOUND);

        store
            .publish(&PublishRequest {
                deployment_id: deployment.id.clone(),
                version_id: VersionId::new("ver-1"),
                custom_server_id: server_id,
                snapshot: CapabilitySnapshot::default(),
                ended_at: Utc::now(),
            })
            .await
            .expect("publish");

        let after = app(store)
            .oneshot(
                Request::builder()
                    .uri("/servers/csrv-1/current-version")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(after.status(), StatusCode::OK);
        let body = body_json(after).await;
        assert_eq!(body["id"], "ver-1");
        assert_eq!(body["status"], "available");
    }
}
