//! Message records

use super::MailboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One header line as it appeared in the raw message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Output of the parser for one raw message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    /// `Message-ID` header, angle brackets stripped
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub headers: Vec<HeaderField>,
    pub has_attachments: bool,
    pub received_at: Option<DateTime<Utc>>,
}

/// Insert form of a message, keyed by (mailbox, uid)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub mailbox_id: MailboxId,
    pub uid: u32,
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: Option<String>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub headers: Vec<HeaderField>,
    pub has_attachments: bool,
    pub received_at: DateTime<Utc>,
}

impl NewMessage {
    /// Attach a parsed message to its mailbox and remote uid
    ///
    /// Messages without a usable `Date` header are stamped with `fallback`.
    pub fn from_parsed(
        mailbox_id: MailboxId,
        uid: u32,
        parsed: ParsedMessage,
        fallback: DateTime<Utc>,
    ) -> Self {
        Self {
            mailbox_id,
            uid,
            message_id: parsed.message_id,
            sender: parsed.sender,
            recipients: parsed.recipients,
            cc: parsed.cc,
            subject: parsed.subject,
            text_body: parsed.text_body,
            html_body: parsed.html_body,
            headers: parsed.headers,
            has_attachments: parsed.has_attachments,
            received_at: parsed.received_at.unwrap_or(fallback),
        }
    }
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(flatten)]
    pub message: NewMessage,
    pub stored_at: DateTime<Utc>,
}

/// Dead-letter record for a message the pipeline stepped past
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMessage {
    pub mailbox_id: MailboxId,
    pub uid: u32,
    pub attempts: u32,
    pub reason: String,
    pub skipped_at: DateTime<Utc>,
}
