use std::net::SocketAddr;

use hookwatch::config::Config;
use hookwatch::services::spawn_retention_sweep;
use hookwatch::{build_state, create_router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize configuration
    let config = Config::from_env()?;

    let app_state = build_state(&config).await?;

    let _sweep = spawn_retention_sweep(app_state.webhook_service.clone(), &config.retention);

    // Build the application
    let app = create_router(app_state, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    // Log startup information
    config.log_startup_info();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
