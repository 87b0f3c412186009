use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{NotificationKind, Notifier, NotifyTarget, Priority, SenderError};

/// Pushes notifications to a platform-side webhook as a JSON document.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Result<Self, SenderError> {
        if url.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "webhook URL is empty".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            url,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        target: NotifyTarget,
        kind: NotificationKind,
        payload: Value,
        priority: Priority,
    ) -> Result<(), SenderError> {
        let body = json!({
            "target": target,
            "notification": kind,
            "priority": priority,
            "payload": payload,
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "webhook returned non-success status: {}. Body: {}",
                status, error_body
            )));
        }
        Ok(())
    }
}
