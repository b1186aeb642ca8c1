use axum::{
    Router,
    body::Bytes,
    extract::{
        ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, State,
        rejection::{BytesRejection, JsonRejection},
    },
    http::{HeaderMap, Method, StatusCode, Uri, header, request::Parts},
    response::Json,
    routing::{any, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::error::AppError;
use crate::models::{IngestReceipt, LogPage, header_mapping};
use crate::replay::ReplayEngine;
use crate::services::{InboundRequest, WebhookService};

#[derive(Clone)]
pub struct AppState {
    pub webhook_service: WebhookService,
    pub replay_engine: ReplayEngine,
    pub trust_proxy_headers: bool,
}

pub fn create_router(app_state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{endpoint_id}/receive", any(receive_webhook))
        .route(
            "/webhooks/{endpoint_id}/logs",
            get(get_webhook_logs).delete(clear_webhook_logs),
        )
        .route("/webhooks/replay/{webhook_log_id}", post(replay_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(config))
                .layer(DefaultBodyLimit::max(config.limits.max_body_bytes)),
        )
        .with_state(app_state)
}

fn create_cors_layer(config: &Config) -> CorsLayer {
    if config.cors_permissive {
        CorsLayer::permissive()
    } else {
        use axum::http::HeaderValue;
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Ignoring invalid origin '{}': {e}", s);
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::HEAD,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    }
}

/// Source address of the caller. Forwarding headers are honored only when
/// the service is configured to sit behind a trusted proxy.
pub struct ClientIp(pub String);

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    first("x-forwarded-for").or_else(|| first("x-real-ip"))
}

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.trust_proxy_headers {
            if let Some(ip) = forwarded_ip(&parts.headers) {
                return Ok(ClientIp(ip));
            }
        }

        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(ip))
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "hookwatch",
        "message": "Service is running",
    }))
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    ClientIp(source_ip): ClientIp,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, AppError> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge {
                limit: state.webhook_service.limits().max_body_bytes,
            }
        } else {
            AppError::invalid_input("body", rejection.body_text())
        }
    })?;

    let user_agent = headers
        .get(header::USER_AGENT)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());

    let request = InboundRequest {
        method: method.as_str().to_string(),
        headers: header_mapping(&headers),
        query: uri.query().map(str::to_string),
        body: body.to_vec(),
        source_ip,
        user_agent,
    };

    let IngestReceipt {
        endpoint_id,
        method,
        webhook_id,
        status,
        timestamp,
    } = state.webhook_service.ingest(&endpoint_id, request).await?;

    Ok(Json(json!({
        "message": "Webhook received and processed",
        "endpointId": endpoint_id,
        "method": method,
        "webhookId": webhook_id,
        "status": status,
        "timestamp": timestamp,
    })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<String>,
}

async fn get_webhook_logs(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogPage>, AppError> {
    // Unparseable limits fall back to the default rather than failing the request
    let limit = query.limit.and_then(|s| s.trim().parse::<i64>().ok());
    let page = state
        .webhook_service
        .list_logs(&endpoint_id, limit)
        .await?;
    Ok(Json(page))
}

async fn clear_webhook_logs(
    State(state): State<AppState>,
    Path(endpoint_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let deleted = state.webhook_service.clear_logs(&endpoint_id).await?;
    Ok(Json(json!({
        "message": "Webhook logs cleared successfully",
        "endpointId": endpoint_id,
        "deletedCount": deleted,
    })))
}

#[derive(Debug, Deserialize)]
struct ReplayBody {
    target_url: String,
    timeout: Option<i64>,
}

async fn replay_webhook(
    State(state): State<AppState>,
    Path(webhook_log_id): Path<String>,
    payload: Result<Json<ReplayBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(payload) =
        payload.map_err(|rejection| AppError::invalid_input("body", rejection.body_text()))?;

    let result = state
        .replay_engine
        .replay(&webhook_log_id, &payload.target_url, payload.timeout)
        .await?;

    let message = if result.is_success() {
        "Webhook replayed successfully"
    } else {
        "Webhook replay failed"
    };

    Ok(Json(json!({
        "message": message,
        "webhook_log_id": webhook_log_id,
        "target_url": payload.target_url,
        "result": result,
    })))
}
