use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orakle_gateway=info,tower_http=debug".into()),
        )
        .init();

    // Explicit path > ORAKLE_CONFIG env > ~/.orakle/orakle.toml.
    let config_path = std::env::var("ORAKLE_CONFIG").ok();
    let config = orakle_core::config::OrakleConfig::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let state = Arc::new(app::AppState::new(config).await?);
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("orakle gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
