//! Mailbox records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub use imap_session::Security;

/// Control-plane identifier of a mailbox
pub type MailboxId = i64;

/// A configured remote mailbox
///
/// Owned by the control plane. Everything except `active` and `shard` is
/// fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub id: MailboxId,

    /// Human-facing identity, usually the email address
    pub address: String,

    pub username: String,

    #[serde(skip_serializing)]
    pub password: String,

    pub host: String,
    pub port: u16,
    pub security: Security,

    /// Remote folder to ingest from
    pub folder: String,

    pub active: bool,

    /// Instance id of the worker that owns this mailbox
    pub shard: String,

    pub created_at: DateTime<Utc>,
}

impl Mailbox {
    /// Server endpoint for the protocol client
    pub fn endpoint(&self) -> imap_session::Endpoint {
        imap_session::Endpoint::new(&self.host, self.port, self.security)
    }

    /// Hash of everything that affects whether a connection can succeed
    ///
    /// A manager terminated on rejected credentials is only recreated once
    /// this value changes.
    pub fn connection_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.username.hash(&mut hasher);
        self.password.hash(&mut hasher);
        self.host.hash(&mut hasher);
        self.port.hash(&mut hasher);
        self.security.to_string().hash(&mut hasher);
        self.folder.hash(&mut hasher);
        hasher.finish()
    }
}

/// Fields needed to create a mailbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMailbox {
    pub address: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub security: Security,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub shard: String,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_active() -> bool {
    true
}

impl NewMailbox {
    /// Create a mailbox description with the username defaulting to the address
    pub fn new(
        address: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        shard: impl Into<String>,
    ) -> Self {
        let address = address.into();
        Self {
            username: address.clone(),
            address,
            password: password.into(),
            host: host.into(),
            port: 993,
            security: Security::Tls,
            folder: default_folder(),
            active: true,
            shard: shard.into(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Materialize into a stored mailbox
    pub fn into_mailbox(self, id: MailboxId, created_at: DateTime<Utc>) -> Mailbox {
        Mailbox {
            id,
            address: self.address,
            username: self.username,
            password: self.password,
            host: self.host,
            port: self.port,
            security: self.security,
            folder: self.folder,
            active: self.active,
            shard: self.shard,
            created_at,
        }
    }
}
