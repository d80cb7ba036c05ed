//! Lodestar deploy service binary.
//!
//! Runs the deployment pipeline workers and their HTTP API.

use tracing::info;
use tracing_subscriber::EnvFilter;

use lodestar_deploy::{DeployConfig, DeployService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lodestar_deploy=info".parse()?),
        )
        .init();

    info!("lodestar deploy service starting");

    let config = DeployConfig::load()?;
    info!(
        listen = %config.server.listen,
        database = config.database.url.is_some(),
        lambda_provider = ?config.provider.lambda,
        "configuration loaded"
    );

    DeployService::new(config).run().await?;
    Ok(())
}
