//! HTTP API for the deploy service.
//!
//! Provides endpoints for:
//! - Enqueueing deployment jobs
//! - Querying deployments with their step logs
//! - Looking up a server's current version
//! - Health checks

mod deployments;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::queue::JobQueue;
use crate::store::DeploymentStore;

pub use deployments::{DeploymentResponse, EnqueueResponse, ErrorResponse};

/// Shared application state for the deploy service.
#[derive(Clone)]
pub struct AppState {
    /// Queue new jobs are pushed onto.
    pub queue: Arc<JobQueue>,
    /// Deployment store for direct queries.
    pub store: Arc<dyn DeploymentStore>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/jobs", post(deployments::enqueue_job))
        .route("/deployments/{id}", get(deployments::get_deployment))
        .route(
            "/servers/{id}/current-version",
            get(deployments::current_version),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "healthy" })
}

/// Health response.
#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint() {
        let app = router(AppState {
            queue: Arc::new(JobQueue::new(&QueueConfig::default())),
            store: Arc::new(MemoryStore::new()),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
