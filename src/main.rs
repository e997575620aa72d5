use std::net::SocketAddr;

use clap::Parser;
use range_tracker::config::ServerConfig;
use range_tracker::{router, AppState, TransferTracker};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();

    let config = ServerConfig::parse();
    let app = router(AppState::new(config.root.clone(), TransferTracker::new()));

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!("Starting server on {} serving {}", config.bind, config.root.display());
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
}
