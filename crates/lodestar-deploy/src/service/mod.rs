//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api;
use crate::config::DeployConfig;
use crate::egress::EgressPolicy;
use crate::error::{DeployError, DeployResult};
use crate::orchestrator::DeploymentOrchestrator;
use crate::queue::{JobHandler, JobQueue};
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};

/// The deploy service.
///
/// Manages the lifecycle of the deployment pipeline, including:
/// - Database connections
/// - The deployment orchestrator and its job queue
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct DeployService {
    config: DeployConfig,
    cancel: CancellationToken,
}

impl DeployService {
    /// Create a new deploy service with the given configuration.
    #[must_use]
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the deploy service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Build the orchestrator, failing early on missing provider credentials
    /// 3. Start the job queue workers
    /// 4. Start the HTTP API server
    /// 5. Wait for shutdown signal, then drain running jobs
    pub async fn run(&self) -> DeployResult<()> {
        let store = self.create_store().await;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.server.request_timeout_secs))
            .redirect(EgressPolicy::from(self.config.egress).redirect_policy())
            .build()?;
        let orchestrator = Arc::new(DeploymentOrchestrator::from_config(
            &self.config,
            http,
            Arc::clone(&store),
        )?);
        info!(
            lambda_provider = ?self.config.provider.lambda,
            poll_interval_ms = self.config.build.poll_interval_ms,
            "deployment orchestrator initialised"
        );

        let queue = Arc::new(JobQueue::new(&self.config.queue));
        let workers = tokio::spawn({
            let queue = Arc::clone(&queue);
            let handler: Arc<dyn JobHandler> = orchestrator;
            let cancel = self.cancel.clone();
            async move { queue.run(handler, cancel).await }
        });

        let app = api::router(api::AppState {
            queue,
            store: Arc::clone(&store),
        });

        info!(listen = %self.config.server.listen, "deploy service listening");
        let served = serve(self.config.server.listen, app, self.cancel.clone()).await;

        self.cancel.cancel();
        if let Err(e) = workers.await {
            error!(error = %e, "job queue task panicked");
        }
        served?;

        info!("deploy service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn DeploymentStore> {
        let Some(url) = self.config.database.url.as_deref() else {
            info!("no database configured, using in-memory store");
            return Arc::new(MemoryStore::new());
        };

        match PostgresStore::connect(url, &self.config.database).await {
            Ok(store) => {
                info!("connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }
}

/// Serve an axum router with graceful shutdown.
async fn serve(addr: SocketAddr, app: axum::Router, cancel: CancellationToken) -> DeployResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| DeployError::configuration(format!("failed to bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .map_err(|e| DeployError::internal(format!("server error: {e}")))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
