use enrichd_infra::config::EnrichConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    enrichd_observability::init();

    let config = EnrichConfig::from_env();
    let runtime = enrichd_api::app::services::build_services(&config).await?;
    let app = enrichd_api::app::build_app(runtime.services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr.as_str()).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight jobs finish before exiting.
    runtime.workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
