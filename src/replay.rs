use std::error::Error as StdError;
use std::time::{Duration, Instant};

use reqwest::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use tracing::{debug, info, warn};

use crate::config::Limits;
use crate::error::AppError;
use crate::models::{ReplayFailure, ReplayOutcome, ReplayResponse, ReplayResult, WebhookLog, header_mapping};
use crate::services::WebhookService;

/// Captured headers that describe the original hop, not the request. The
/// client recomputes these for the new target.
const NON_REPLAYABLE_HEADERS: [&str; 10] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

pub fn parse_target_url(raw: &str) -> Result<url::Url, AppError> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| AppError::invalid_input("target_url", format!("not an absolute URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::invalid_input(
            "target_url",
            format!("unsupported scheme '{}'", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::invalid_input("target_url", "missing host"));
    }
    Ok(url)
}

/// `None` takes the default; non-positive values are rejected; large values are clamped.
pub fn effective_timeout(requested: Option<i64>, limits: &Limits) -> Result<u64, AppError> {
    match requested {
        None => Ok(limits.default_replay_timeout_secs),
        Some(secs) if secs <= 0 => Err(AppError::invalid_input(
            "timeout",
            "must be a positive number of seconds",
        )),
        Some(secs) => Ok((secs as u64).min(limits.max_replay_timeout_secs)),
    }
}

fn classify(err: &reqwest::Error) -> ReplayFailure {
    if err.is_timeout() {
        return ReplayFailure::Timeout;
    }

    let chain = || std::iter::successors(Some(err as &(dyn StdError + 'static)), |e: &&(dyn StdError + 'static)| (*e).source());

    let io_kind = chain().find_map(|e| e.downcast_ref::<std::io::Error>().map(|io| io.kind()));
    match io_kind {
        Some(std::io::ErrorKind::ConnectionRefused) => return ReplayFailure::ConnectionRefused,
        Some(std::io::ErrorKind::TimedOut) => return ReplayFailure::Timeout,
        _ => {}
    }

    // Resolver failures carry no typed kind, and some connectors hide the io
    // error behind their own type; fall back to the rendered messages.
    for e in chain() {
        let message = e.to_string().to_ascii_lowercase();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return ReplayFailure::Dns;
        }
        if message.contains("connection refused") {
            return ReplayFailure::ConnectionRefused;
        }
    }

    ReplayFailure::Transport
}

/// Appends the captured query string to whatever query the target already has.
fn merge_query(url: &mut url::Url, captured: Option<&str>) {
    let Some(captured) = captured.filter(|q| !q.is_empty()) else {
        return;
    };
    let merged = match url.query().filter(|q| !q.is_empty()) {
        Some(existing) => format!("{existing}&{captured}"),
        None => captured.to_string(),
    };
    url.set_query(Some(&merged));
}

#[derive(Clone)]
pub struct ReplayEngine {
    client: reqwest::Client,
    webhooks: WebhookService,
    limits: Limits,
}

impl ReplayEngine {
    pub fn new(client: reqwest::Client, webhooks: WebhookService, limits: Limits) -> Self {
        Self {
            client,
            webhooks,
            limits,
        }
    }

    /// Re-sends a captured request. Only bad input or an unknown log id is an
    /// error; anything that goes wrong on the wire is reported in the result.
    pub async fn replay(
        &self,
        log_id: &str,
        target_url: &str,
        timeout: Option<i64>,
    ) -> Result<ReplayResult, AppError> {
        // Read once; the store is not touched again while the request is in flight.
        let webhook_log = self.webhooks.get_log(log_id).await?;
        let mut url = parse_target_url(target_url)?;
        let timeout_secs = effective_timeout(timeout, &self.limits)?;
        merge_query(&mut url, webhook_log.raw_query.as_deref());

        let started = Instant::now();
        let outcome = self
            .dispatch(&webhook_log, url, Duration::from_secs(timeout_secs))
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            ReplayOutcome::Delivered(response) => info!(
                "Replayed webhook {} to {} - Status: {}, Duration: {}ms",
                webhook_log.id, target_url, response.status_code, duration_ms
            ),
            ReplayOutcome::Failed { reason, detail } => warn!(
                "Replay of webhook {} to {} failed ({}): {} after {}ms",
                webhook_log.id, target_url, reason, detail, duration_ms
            ),
        }

        Ok(ReplayResult {
            webhook_log_id: webhook_log.id,
            target_url: target_url.to_string(),
            timeout_secs,
            duration_ms,
            outcome,
        })
    }

    fn build_request(
        &self,
        webhook_log: &WebhookLog,
        url: url::Url,
        timeout: Duration,
    ) -> Result<reqwest::RequestBuilder, String> {
        let method = reqwest::Method::from_bytes(webhook_log.method.as_bytes())
            .map_err(|e| format!("stored method '{}' unusable: {e}", webhook_log.method))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &webhook_log.headers {
            if NON_REPLAYABLE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!("Skipping unreplayable header '{}'", name),
            }
        }

        if !webhook_log.raw_body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(self
            .client
            .request(method, url)
            .headers(headers)
            .body(webhook_log.raw_body.clone())
            .timeout(timeout))
    }

    async fn dispatch(&self, webhook_log: &WebhookLog, url: url::Url, timeout: Duration) -> ReplayOutcome {
        let request = match self.build_request(webhook_log, url, timeout) {
            Ok(request) => request,
            Err(detail) => {
                return ReplayOutcome::Failed {
                    reason: ReplayFailure::Transport,
                    detail,
                };
            }
        };

        // The client timeout covers connect and body; this bounds everything else.
        let exchange = async {
            let response = request.send().await?;
            Ok::<_, reqwest::Error>(self.read_response(response).await)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => ReplayOutcome::Delivered(response),
            Ok(Err(e)) => ReplayOutcome::Failed {
                reason: classify(&e),
                detail: e.to_string(),
            },
            Err(_) => ReplayOutcome::Failed {
                reason: ReplayFailure::Timeout,
                detail: format!("no response within {}s", timeout.as_secs()),
            },
        }
    }

    async fn read_response(&self, mut response: reqwest::Response) -> ReplayResponse {
        let status_code = response.status().as_u16();
        let headers = header_mapping(response.headers());
        let max = self.limits.max_replay_response_bytes;

        let mut buf = Vec::new();
        let mut truncated = false;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = max - buf.len();
                    if chunk.len() > room {
                        buf.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Replay response body unreadable: {}", e);
                    return ReplayResponse {
                        status_code,
                        headers,
                        body: None,
                        truncated: false,
                    };
                }
            }
        }

        ReplayResponse {
            status_code,
            headers,
            body: Some(String::from_utf8_lossy(&buf).into_owned()),
            truncated,
        }
    }
}
