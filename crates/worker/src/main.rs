use anyhow::Context;

use memetok_infra::{InfraConfig, build_services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional .env file.
    let _ = dotenvy::dotenv();
    memetok_observability::init();

    let config = InfraConfig::from_env();
    tracing::info!(
        media_service = %config.media_base_url,
        staging_root = %config.staging_root.display(),
        "starting media workers"
    );

    let services = build_services(config)
        .await
        .context("failed to build services")?;
    services.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    services.stop().await;
    Ok(())
}
