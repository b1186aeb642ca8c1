use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::models::WebhookLog;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget POST to a configured URL after each capture.
#[derive(Clone)]
pub struct CaptureNotifier {
    client: reqwest::Client,
    url: url::Url,
}

impl CaptureNotifier {
    pub fn new(client: reqwest::Client, url: &str) -> anyhow::Result<Self> {
        let url = url::Url::parse(url)?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "notification URL must be http or https"
        );
        Ok(Self { client, url })
    }

    /// Returns immediately; the delivery runs on its own task.
    pub fn notify(&self, log: &WebhookLog) {
        let payload = json!({
            "event": "webhook.captured",
            "endpoint_id": log.endpoint_id,
            "webhook_id": log.id,
            "method": log.method,
            "created_at": log.created_at,
        });
        let client = self.client.clone();
        let url = self.url.clone();
        let webhook_id = log.id.clone();

        tokio::spawn(async move {
            let result = client
                .post(url.clone())
                .header("content-type", "application/json")
                .body(payload.to_string())
                .timeout(NOTIFY_TIMEOUT)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!("Capture notification for {} delivered", webhook_id);
                }
                Ok(resp) => warn!(
                    "Capture notification for {} rejected by {}: {}",
                    webhook_id,
                    url,
                    resp.status()
                ),
                Err(e) => warn!(
                    "Capture notification for {} to {} failed: {}",
                    webhook_id, url, e
                ),
            }
        });
    }
}
