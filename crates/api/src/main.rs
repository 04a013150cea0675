use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use roomstage_api::app;
use roomstage_api::config::AppConfig;
use roomstage_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    roomstage_observability::tracing::init(&LogConfig::default().with_format(config.log_format));

    let (services, pipeline) = app::build_services(&config).await?;
    let shutdown = CancellationToken::new();
    let pipeline = pipeline.start(shutdown.clone());

    let router = app::build_app(Arc::new(services));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await
        .context("http server failed")?;

    tracing::info!("draining staging pipeline");
    pipeline.shutdown().await;
    Ok(())
}
