pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notifier;
pub mod replay;
pub mod services;

use std::sync::Arc;

use config::Config;
use database::Database;
use notifier::CaptureNotifier;
use replay::ReplayEngine;
use services::WebhookService;

pub use handlers::{AppState, create_router};

/// Wires the store, services and outbound client from configuration.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let db = Arc::new(Database::connect(&config.database_path).await?);

    // Replays report what the target itself answered, so redirects are not followed.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let mut webhook_service = WebhookService::new(db, config.limits.clone(), &config.retention);
    if let Some(ref url) = config.notify_url {
        webhook_service = webhook_service.with_notifier(CaptureNotifier::new(client.clone(), url)?);
    }

    Ok(AppState {
        replay_engine: ReplayEngine::new(client, webhook_service.clone(), config.limits.clone()),
        webhook_service,
        trust_proxy_headers: config.trust_proxy_headers,
    })
}
