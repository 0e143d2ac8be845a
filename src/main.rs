use std::sync::Arc;

use human_mcp::{
    config::Config,
    domain::provider::UnconfiguredProvider,
    logging,
    mcp::server::McpServer,
    transport::manager::{block_on_then_release, TransportManager},
    AppState,
};
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    info!(
        transport = config.transport.as_str(),
        session_mode = config.session_mode.as_str(),
        "server starting"
    );
    if config.transport.serves_http() && config.security.secret.is_none() {
        warn!("MCP_HTTP_SECRET is not set, HTTP transport accepts unauthenticated requests");
    }

    // Built by hand so shutdown can abandon the blocking stdin reader.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let server = Arc::new(McpServer::new(Arc::new(UnconfiguredProvider::new())));
    let manager = TransportManager::new(AppState::new(config, server));
    block_on_then_release(runtime, manager.run(shutdown_signal()))?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
