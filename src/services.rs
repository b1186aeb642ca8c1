use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::config::{Limits, Retention};
use crate::database::Database;
use crate::error::AppError;
use crate::models::{Endpoint, HeaderMapping, IngestReceipt, LogPage, LogStatus, WebhookLog};
use crate::notifier::CaptureNotifier;

pub const MAX_ENDPOINT_ID_LEN: usize = 256;

pub const SUPPORTED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Timestamps are fixed-width so that text ordering matches time ordering.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn store_error(operation: &str, e: anyhow::Error) -> AppError {
    warn!("Failed to {}: {:#}", operation, e);
    AppError::StoreUnavailable
}

pub fn validate_endpoint_id(endpoint_id: &str) -> Result<(), AppError> {
    if endpoint_id.trim().is_empty() {
        return Err(AppError::invalid_identifier(
            "endpointId",
            "must not be empty or whitespace",
        ));
    }
    if endpoint_id.len() > MAX_ENDPOINT_ID_LEN {
        return Err(AppError::invalid_identifier(
            "endpointId",
            format!("must be at most {MAX_ENDPOINT_ID_LEN} bytes"),
        ));
    }
    if endpoint_id.chars().any(char::is_control) {
        return Err(AppError::invalid_identifier(
            "endpointId",
            "must not contain control characters",
        ));
    }
    Ok(())
}

pub fn validate_log_id(log_id: &str) -> Result<(), AppError> {
    Uuid::parse_str(log_id).map_err(|e| {
        warn!("Invalid webhook log id received: '{}' - {}", log_id, e);
        AppError::invalid_identifier("webhookLogId", "must be a UUID")
    })?;
    Ok(())
}

/// Resolves caller-chosen identifiers to endpoints, creating them on first use.
#[derive(Clone)]
pub struct EndpointRegistry {
    db: Arc<Database>,
}

impl EndpointRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn resolve(&self, endpoint_id: &str) -> Result<Endpoint, AppError> {
        validate_endpoint_id(endpoint_id)?;
        self.db
            .upsert_endpoint(endpoint_id, &timestamp_now())
            .await
            .map_err(|e| store_error("resolve endpoint", e))
    }
}

/// An inbound request as seen at the HTTP boundary, before normalization.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub headers: HeaderMapping,
    pub query: Option<String>,
    pub body: Vec<u8>,
    pub source_ip: String,
    pub user_agent: Option<String>,
}

/// Query string as a JSON object; repeated keys collect into an array.
pub fn query_to_value(query: &str) -> Value {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in form_urlencoded::parse(query.as_bytes()) {
        params.entry(k.into_owned()).or_default().push(v.into_owned());
    }

    let object = params
        .into_iter()
        .map(|(k, mut values)| {
            let value = if values.len() == 1 {
                Value::String(values.remove(0))
            } else {
                Value::Array(values.into_iter().map(Value::String).collect())
            };
            (k, value)
        })
        .collect();
    Value::Object(object)
}

/// Decides what the log shows as `body`. Never fails: malformed JSON is kept as text.
pub fn normalize_body(method: &str, query: Option<&str>, raw: &[u8]) -> Value {
    if raw.is_empty() {
        return if method.eq_ignore_ascii_case("GET") {
            query_to_value(query.unwrap_or(""))
        } else {
            Value::Null
        };
    }

    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(raw).into_owned()),
    }
}

#[derive(Clone)]
pub struct WebhookService {
    db: Arc<Database>,
    registry: EndpointRegistry,
    limits: Limits,
    max_entries: Option<u32>,
    notifier: Option<CaptureNotifier>,
}

impl WebhookService {
    pub fn new(db: Arc<Database>, limits: Limits, retention: &Retention) -> Self {
        Self {
            registry: EndpointRegistry::new(db.clone()),
            db,
            limits,
            max_entries: retention.max_entries,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: CaptureNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub async fn ingest(
        &self,
        endpoint_id: &str,
        request: InboundRequest,
    ) -> Result<IngestReceipt, AppError> {
        validate_endpoint_id(endpoint_id)?;

        // Stored exactly as received; the check alone ignores case.
        let method = request.method;
        if !SUPPORTED_METHODS
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(&method))
        {
            return Err(AppError::invalid_input(
                "method",
                format!("'{method}' is not a supported HTTP method"),
            ));
        }

        if request.body.len() > self.limits.max_body_bytes {
            return Err(AppError::PayloadTooLarge {
                limit: self.limits.max_body_bytes,
            });
        }

        let endpoint = self.registry.resolve(endpoint_id).await?;

        let webhook_log = WebhookLog {
            id: Uuid::new_v4().to_string(),
            endpoint_id: endpoint.id,
            body: normalize_body(&method, request.query.as_deref(), &request.body),
            method,
            headers: request.headers,
            raw_body: request.body,
            raw_query: request.query,
            ip_address: request.source_ip,
            user_agent: request.user_agent,
            status: LogStatus::Received,
            created_at: timestamp_now(),
        };

        let evicted = self
            .db
            .append_log(&webhook_log, self.max_entries)
            .await
            .map_err(|e| store_error("store webhook log", e))?;
        if evicted > 0 {
            debug!(
                "Evicted {} old entries from endpoint {}",
                evicted, webhook_log.endpoint_id
            );
        }

        info!(
            "Received {} request for endpoint {}: {}",
            webhook_log.method, webhook_log.endpoint_id, webhook_log.id
        );

        if let Some(ref notifier) = self.notifier {
            notifier.notify(&webhook_log);
        }

        Ok(IngestReceipt {
            endpoint_id: webhook_log.endpoint_id,
            method: webhook_log.method,
            webhook_id: webhook_log.id,
            status: webhook_log.status,
            timestamp: webhook_log.created_at,
        })
    }

    /// Out-of-range or missing limits fall back to the default or are clamped.
    pub fn effective_limit(&self, requested: Option<i64>) -> u32 {
        match requested {
            Some(n) if n >= 1 => {
                u32::try_from(n).map_or(self.limits.max_list_limit, |n| n.min(self.limits.max_list_limit))
            }
            _ => self.limits.default_list_limit,
        }
    }

    pub async fn list_logs(
        &self,
        endpoint_id: &str,
        limit: Option<i64>,
    ) -> Result<LogPage, AppError> {
        let endpoint = self.registry.resolve(endpoint_id).await?;
        let limit = self.effective_limit(limit);

        let logs = self
            .db
            .list_logs(&endpoint.id, limit)
            .await
            .map_err(|e| store_error("list webhook logs", e))?;

        Ok(LogPage {
            endpoint_id: endpoint.id,
            limit,
            count: logs.len(),
            logs,
        })
    }

    pub async fn clear_logs(&self, endpoint_id: &str) -> Result<u64, AppError> {
        let endpoint = self.registry.resolve(endpoint_id).await?;

        let deleted = self
            .db
            .delete_logs(&endpoint.id)
            .await
            .map_err(|e| store_error("clear webhook logs", e))?;

        info!("Cleared {} webhook logs for endpoint: {}", deleted, endpoint.id);
        Ok(deleted)
    }

    pub async fn get_log(&self, log_id: &str) -> Result<WebhookLog, AppError> {
        validate_log_id(log_id)?;

        self.db
            .get_log(log_id)
            .await
            .map_err(|e| store_error("load webhook log", e))?
            .ok_or_else(|| AppError::NotFound {
                resource: "webhook log",
                id: log_id.to_string(),
            })
    }

    pub async fn prune_older_than(&self, max_age: Duration) -> Result<u64, AppError> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|_| AppError::invalid_input("max_age", "out of range"))?;
        let cutoff = (chrono::Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true);

        self.db
            .delete_logs_before(&cutoff)
            .await
            .map_err(|e| store_error("prune expired webhook logs", e))
    }
}

/// Periodically removes entries older than `retention.max_age`. `None` when no age limit is set.
pub fn spawn_retention_sweep(
    service: WebhookService,
    retention: &Retention,
) -> Option<JoinHandle<()>> {
    let max_age = retention.max_age?;
    let period = retention.sweep_interval;

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match service.prune_older_than(max_age).await {
                Ok(0) => {}
                Ok(n) => info!("Retention sweep removed {} expired webhook logs", n),
                Err(e) => warn!("Retention sweep failed: {}", e),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn service() -> WebhookService {
        let db = Arc::new(Database::in_memory().await.unwrap());
        WebhookService::new(db, Limits::default(), &Retention::default())
    }

    fn post(body: &str) -> InboundRequest {
        InboundRequest {
            method: "POST".into(),
            body: body.as_bytes().to_vec(),
            source_ip: "10.0.0.1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn capture_list_clear_scenario() {
        let svc = service().await;

        let receipt = svc.ingest("hook-1", post(r#"{"a":1}"#)).await.unwrap();
        assert_eq!(receipt.status, LogStatus::Received);
        assert_eq!(receipt.method, "POST");

        let page = svc.list_logs("hook-1", Some(20)).await.unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.logs[0].id, receipt.webhook_id);
        assert_eq!(page.logs[0].body, json!({ "a": 1 }));
        assert_eq!(page.logs[0].raw_body, br#"{"a":1}"#);

        assert_eq!(svc.clear_logs("hook-1").await.unwrap(), 1);
        assert_eq!(svc.list_logs("hook-1", Some(20)).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_stored_verbatim() {
        let svc = service().await;
        let body = r#"{"a": 1,,"#;
        svc.ingest("hook", post(body)).await.unwrap();

        let page = svc.list_logs("hook", Some(1)).await.unwrap();
        assert_eq!(page.logs[0].body, Value::String(body.to_string()));
        assert_eq!(page.logs[0].raw_body, body.as_bytes());
    }

    #[tokio::test]
    async fn rejects_blank_endpoint_and_unknown_method() {
        let svc = service().await;

        let err = svc.ingest("   ", post("{}")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier { field: "endpointId", .. }));

        let mut request = post("{}");
        request.method = "BREW".into();
        let err = svc.ingest("hook", request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { field: "method", .. }));

        assert_eq!(svc.list_logs("hook", None).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_side_effects() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let limits = Limits {
            max_body_bytes: 8,
            ..Limits::default()
        };
        let svc = WebhookService::new(db, limits, &Retention::default());

        let err = svc.ingest("hook", post("0123456789")).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { limit: 8 }));
        assert_eq!(svc.list_logs("hook", None).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn get_with_body_is_accepted() {
        let svc = service().await;
        let request = InboundRequest {
            method: "GET".into(),
            query: Some("x=1".into()),
            body: b"payload".to_vec(),
            ..Default::default()
        };
        svc.ingest("hook", request).await.unwrap();

        let page = svc.list_logs("hook", None).await.unwrap();
        assert_eq!(page.logs[0].body, json!("payload"));
    }

    #[tokio::test]
    async fn list_returns_min_of_count_and_limit_newest_first() {
        let svc = service().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(svc.ingest("hook", post(&i.to_string())).await.unwrap().webhook_id);
        }

        let page = svc.list_logs("hook", Some(3)).await.unwrap();
        assert_eq!(page.count, 3);
        let listed: Vec<_> = page.logs.iter().map(|l| l.id.clone()).collect();
        assert_eq!(listed, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);

        let page = svc.list_logs("hook", Some(50)).await.unwrap();
        assert_eq!(page.count, 5);
    }

    #[tokio::test]
    async fn limit_defaults_and_clamps() {
        let svc = service().await;
        assert_eq!(svc.effective_limit(None), 20);
        assert_eq!(svc.effective_limit(Some(0)), 20);
        assert_eq!(svc.effective_limit(Some(-4)), 20);
        assert_eq!(svc.effective_limit(Some(7)), 7);
        assert_eq!(svc.effective_limit(Some(10_000)), 100);
        assert_eq!(svc.effective_limit(Some(i64::MAX)), 100);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_empty_not_an_error() {
        let svc = service().await;
        let page = svc.list_logs("never-seen", None).await.unwrap();
        assert_eq!(page.count, 0);
        assert_eq!(page.limit, 20);
        assert_eq!(svc.clear_logs("never-seen").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_log_validates_and_reports_missing() {
        let svc = service().await;
        let err = svc.get_log("not-a-uuid").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier { .. }));

        let err = svc.get_log(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_resolution_maps_to_one_endpoint() {
        let svc = service().await;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = svc.registry().clone();
                tokio::spawn(async move { registry.resolve("shared").await.unwrap() })
            })
            .collect();

        let mut created = Vec::new();
        for handle in handles {
            created.push(handle.await.unwrap().created_at);
        }
        created.dedup();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_recent_entries() {
        let svc = service().await;
        svc.ingest("hook", post("{}")).await.unwrap();
        let removed = svc.prune_older_than(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(svc.list_logs("hook", None).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn method_is_stored_as_received() {
        let svc = service().await;
        let mut request = post("{}");
        request.method = "post".into();

        let receipt = svc.ingest("hook", request).await.unwrap();
        assert_eq!(receipt.method, "post");
        let stored = svc.get_log(&receipt.webhook_id).await.unwrap();
        assert_eq!(stored.method, "post");
    }

    #[tokio::test]
    async fn get_capture_keeps_raw_query() {
        let svc = service().await;
        let request = InboundRequest {
            method: "GET".into(),
            query: Some("order=42&state=paid".into()),
            ..Default::default()
        };
        let receipt = svc.ingest("hook", request).await.unwrap();

        let stored = svc.get_log(&receipt.webhook_id).await.unwrap();
        assert_eq!(stored.raw_query.as_deref(), Some("order=42&state=paid"));
        assert_eq!(stored.body, json!({ "order": "42", "state": "paid" }));
    }

    #[tokio::test]
    async fn json_body_keeps_key_order_and_number_precision() {
        let svc = service().await;
        let body = r#"{"z":1,"a":2,"big":12345678901234567890123}"#;
        svc.ingest("hook", post(body)).await.unwrap();

        let page = svc.list_logs("hook", Some(1)).await.unwrap();
        assert_eq!(serde_json::to_string(&page.logs[0].body).unwrap(), body);
    }

    #[test]
    fn get_without_body_records_query() {
        let value = normalize_body("GET", Some("a=1&b=2&b=3"), b"");
        assert_eq!(value, json!({ "a": "1", "b": ["2", "3"] }));
        assert_eq!(normalize_body("GET", None, b""), json!({}));
        assert_eq!(normalize_body("POST", Some("a=1"), b""), Value::Null);
    }

    #[test]
    fn endpoint_id_rules() {
        assert!(validate_endpoint_id("hook-1").is_ok());
        assert!(validate_endpoint_id("with space inside").is_ok());
        assert!(validate_endpoint_id("").is_err());
        assert!(validate_endpoint_id("\t ").is_err());
        assert!(validate_endpoint_id("bad\nid").is_err());
        assert!(validate_endpoint_id(&"x".repeat(MAX_ENDPOINT_ID_LEN + 1)).is_err());
    }
}
