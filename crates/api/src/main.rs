use anyhow::Context;

use outreach_api::app::{build_app, services};
use outreach_infra::config::{self, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    outreach_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = services::build_services(&config)
        .await
        .context("failed to build services")?;

    let poller = config
        .retry
        .poll_interval
        .map(|interval| services.retry_processor.clone().spawn(interval));

    let app = build_app(services, config.api_token.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(poller) = poller {
        poller.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
