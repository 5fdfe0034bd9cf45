//! Webhook notification sink

use super::{DeliveryError, NotificationEvent, NotificationSink};
use async_trait::async_trait;
use std::time::Duration;

/// POSTs each event as JSON to a fixed endpoint
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mailsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            mailbox_id = event.mailbox_id,
            uid = event.uid,
            "Notification delivered"
        );
        Ok(())
    }
}
