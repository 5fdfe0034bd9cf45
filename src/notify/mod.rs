//! Outbound new-message notifications
//!
//! Notifications are best-effort: one delivery attempt per stored message,
//! failures are logged and never retried.

mod webhook;

pub use webhook::WebhookNotifier;

use crate::model::{MailboxId, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery failures
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery transport failed: {0}")]
    Transport(String),

    #[error("endpoint rejected notification ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

/// Projection of a newly stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub mailbox_id: MailboxId,
    pub message_row_id: i64,
    pub uid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(message_row_id: i64, message: &NewMessage) -> Self {
        Self {
            mailbox_id: message.mailbox_id,
            message_row_id,
            uid: message.uid,
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            subject: message.subject.clone(),
            has_attachments: message.has_attachments,
            received_at: message.received_at,
        }
    }
}

/// Destination for new-message events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), DeliveryError>;
}
