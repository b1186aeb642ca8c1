use axum::http::HeaderMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub type HeaderMapping = BTreeMap<String, String>;

/// Flattens a header map; repeated names are joined with `", "`.
pub fn header_mapping(headers: &HeaderMap) -> HeaderMapping {
    let mut mapping = HeaderMapping::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        mapping
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }
    mapping
}

/// A logical inbox, materialized the first time its identifier is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Received,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Received => "received",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "received" => Some(LogStatus::Received),
            _ => None,
        }
    }
}

/// One captured inbound request. Never updated once written.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookLog {
    pub id: String,
    pub endpoint_id: String,
    pub method: String,
    pub headers: HeaderMapping,
    /// Parsed JSON when the payload was JSON, otherwise the raw text.
    pub body: serde_json::Value,
    /// Bytes exactly as received; replay sends these.
    #[serde(skip)]
    pub raw_body: Vec<u8>,
    /// Query string as received, without the leading `?`.
    #[serde(skip)]
    pub raw_query: Option<String>,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub status: LogStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
    pub method: String,
    #[serde(rename = "webhookId")]
    pub webhook_id: String,
    pub status: LogStatus,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
    pub limit: u32,
    pub count: usize,
    pub logs: Vec<WebhookLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayFailure {
    Timeout,
    ConnectionRefused,
    Dns,
    Transport,
}

impl fmt::Display for ReplayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayFailure::Timeout => write!(f, "request timed out"),
            ReplayFailure::ConnectionRefused => write!(f, "connection refused"),
            ReplayFailure::Dns => write!(f, "DNS resolution failed"),
            ReplayFailure::Transport => write!(f, "transport error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResponse {
    pub status_code: u16,
    pub headers: HeaderMapping,
    /// `None` when the body could not be read.
    pub body: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Delivered(ReplayResponse),
    Failed {
        reason: ReplayFailure,
        detail: String,
    },
}

/// Result of one replay attempt. Transport failures land here, never in `AppError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub webhook_log_id: String,
    pub target_url: String,
    pub timeout_secs: u64,
    pub duration_ms: u64,
    pub outcome: ReplayOutcome,
}

impl ReplayResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ReplayOutcome::Delivered(_))
    }

    pub fn failure(&self) -> Option<ReplayFailure> {
        match &self.outcome {
            ReplayOutcome::Failed { reason, .. } => Some(*reason),
            ReplayOutcome::Delivered(_) => None,
        }
    }
}

#[derive(Serialize)]
struct ReplayResultWire<'a> {
    webhook_log_id: &'a str,
    target_url: &'a str,
    timeout: u64,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<&'a HeaderMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_body: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    response_truncated: bool,
    duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<ReplayFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for ReplayResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut wire = ReplayResultWire {
            webhook_log_id: &self.webhook_log_id,
            target_url: &self.target_url,
            timeout: self.timeout_secs,
            success: self.is_success(),
            status_code: None,
            headers: None,
            response_body: None,
            response_truncated: false,
            duration: self.duration_ms,
            failure_reason: None,
            error: None,
        };
        match &self.outcome {
            ReplayOutcome::Delivered(response) => {
                wire.status_code = Some(response.status_code);
                wire.headers = Some(&response.headers);
                wire.response_body = response.body.as_deref();
                wire.response_truncated = response.truncated;
            }
            ReplayOutcome::Failed { reason, detail } => {
                wire.failure_reason = Some(*reason);
                wire.error = Some(detail);
            }
        }
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_replay_omits_response_fields() {
        let result = ReplayResult {
            webhook_log_id: "abc".into(),
            target_url: "http://127.0.0.1:9/".into(),
            timeout_secs: 5,
            duration_ms: 12,
            outcome: ReplayOutcome::Failed {
                reason: ReplayFailure::ConnectionRefused,
                detail: "connection refused".into(),
            },
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["failure_reason"], json!("connection_refused"));
        assert!(value.get("status_code").is_none());
        assert!(value.get("headers").is_none());
        assert!(value.get("response_body").is_none());
    }

    #[test]
    fn delivered_replay_carries_response() {
        let mut headers = HeaderMapping::new();
        headers.insert("content-type".into(), "text/plain".into());
        let result = ReplayResult {
            webhook_log_id: "abc".into(),
            target_url: "http://localhost/".into(),
            timeout_secs: 30,
            duration_ms: 3,
            outcome: ReplayOutcome::Delivered(ReplayResponse {
                status_code: 500,
                headers,
                body: Some("boom".into()),
                truncated: false,
            }),
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["status_code"], json!(500));
        assert_eq!(value["response_body"], json!("boom"));
        assert_eq!(value["headers"]["content-type"], json!("text/plain"));
        assert!(value.get("failure_reason").is_none());
        assert!(value.get("response_truncated").is_none());
    }

    #[test]
    fn repeated_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("x-one", "1".parse().unwrap());

        let mapping = header_mapping(&headers);
        assert_eq!(mapping["set-cookie"], "a=1, b=2");
        assert_eq!(mapping["x-one"], "1");
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!(LogStatus::parse(LogStatus::Received.as_str()), Some(LogStatus::Received));
        assert_eq!(LogStatus::parse("processed"), None);
    }
}
