use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use signed_download::{
    config::Config, routes::create_router, storage::AzureBlobClient, utils::init_logger,
    AppState, SignedUrlIssuer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logger();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);

    // Storage client and credential chain are built once and shared
    let store = AzureBlobClient::from_config(&config)?;
    let issuer = SignedUrlIssuer::new(Arc::new(store));
    let state = AppState::new(config.clone(), issuer);

    let app = create_router(state);

    let host = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .map_err(|e| anyhow::anyhow!("Invalid HOST {}: {}", config.server.host, e))?;
    let addr = SocketAddr::new(host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
