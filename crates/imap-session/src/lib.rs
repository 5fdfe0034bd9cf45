//! Blocking IMAP session wrapper for UID-based incremental fetching
//!
//! A narrow, typed interface over the `imap` crate covering exactly what an
//! incremental ingester needs: log in, select a folder and learn its UIDNEXT,
//! list UIDs above a high-water mark, fetch one raw message, log out.
//!
//! Errors separate rejected credentials from transport trouble so callers can
//! decide between giving up and reconnecting later.
//!
//! # Example
//!
//! ```no_run
//! use imap_session::{Endpoint, ImapSession, Security};
//!
//! let endpoint = Endpoint::new("imap.example.com", 993, Security::Tls);
//! let mut session = ImapSession::login(&endpoint, "alice@example.com", "secret")?;
//!
//! let folder = session.select("INBOX")?;
//! println!("next uid: {}", folder.uid_next);
//!
//! for uid in session.uids_after(folder.uid_next - 1)? {
//!     let raw = session.fetch_raw(uid)?;
//!     println!("{} bytes", raw.len());
//! }
//!
//! session.logout()?;
//! # Ok::<(), imap_session::Error>(())
//! ```

use native_tls::{TlsConnector, TlsStream};
use serde::{Deserialize, Serialize};
use std::net::TcpStream;
use thiserror::Error;

/// Errors that can occur while talking to an IMAP server
#[derive(Error, Debug)]
pub enum Error {
    #[error("credentials rejected: {0}")]
    AuthRejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server refused command: {0}")]
    Command(String),

    #[error("message {0} not found")]
    MessageNotFound(u32),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),
}

impl Error {
    /// Whether the underlying connection should be considered dead
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Tls(_))
    }
}

/// Result type for IMAP session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Connection security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// Implicit TLS (usually port 993)
    Tls,
    /// Plain connection upgraded with STARTTLS (usually port 143)
    StartTls,
}

impl std::fmt::Display for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Security::Tls => write!(f, "tls"),
            Security::StartTls => write!(f, "starttls"),
        }
    }
}

impl std::str::FromStr for Security {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls" | "ssl" => Ok(Security::Tls),
            "starttls" => Ok(Security::StartTls),
            other => Err(Error::Command(format!("unknown security mode: {}", other))),
        }
    }
}

/// Server address and security settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub security: Security,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }
}

/// State of a selected folder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    /// Number of messages in the folder
    pub exists: u32,
    /// Next UID the server will assign
    pub uid_next: u32,
    /// UIDVALIDITY of the folder, when reported
    pub uid_validity: Option<u32>,
}

type TlsSession = imap::Session<TlsStream<TcpStream>>;

/// An authenticated IMAP session
pub struct ImapSession {
    inner: TlsSession,
}

impl ImapSession {
    /// Connect to the endpoint and log in with a username and password
    pub fn login(endpoint: &Endpoint, username: &str, password: &str) -> Result<Self> {
        let tls = TlsConnector::builder().build()?;
        let addr = (endpoint.host.as_str(), endpoint.port);

        let client = match endpoint.security {
            Security::Tls => imap::connect(addr, endpoint.host.as_str(), &tls),
            Security::StartTls => imap::connect_starttls(addr, endpoint.host.as_str(), &tls),
        }
        .map_err(classify)?;

        let inner = client
            .login(username, password)
            .map_err(|(e, _client)| match e {
                imap::error::Error::No(msg) | imap::error::Error::Bad(msg) => {
                    Error::AuthRejected(msg)
                }
                other => classify(other),
            })?;

        Ok(Self { inner })
    }

    /// Select a folder and report its UIDNEXT
    ///
    /// Servers that omit UIDNEXT in the SELECT response get one past the
    /// highest UID in the folder, looked up with `UID SEARCH *`.
    pub fn select(&mut self, folder: &str) -> Result<FolderStatus> {
        let mailbox = self.inner.select(folder).map_err(classify)?;
        let uid_next = match mailbox.uid_next {
            Some(uid_next) => uid_next,
            None if mailbox.exists == 0 => 1,
            None => {
                let highest = self.inner.uid_search("*").map_err(classify)?;
                fallback_uid_next(mailbox.exists, highest.into_iter().max())
            }
        };

        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_next,
            uid_validity: mailbox.uid_validity,
        })
    }

    /// List UIDs strictly greater than `cursor`, ascending
    ///
    /// `UID n:*` always matches the highest UID in the folder even when it is
    /// below `n`, so results are filtered against the cursor.
    pub fn uids_after(&mut self, cursor: u32) -> Result<Vec<u32>> {
        let query = format!("UID {}:*", cursor.saturating_add(1));
        let found = self.inner.uid_search(query).map_err(classify)?;

        let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > cursor).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetch the complete raw RFC 822 message for one UID without setting \Seen
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>> {
        let fetches = self
            .inner
            .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
            .map_err(classify)?;

        fetches
            .iter()
            .find(|f| f.uid.map_or(true, |u| u == uid))
            .and_then(|f| f.body())
            .map(|body| body.to_vec())
            .ok_or(Error::MessageNotFound(uid))
    }

    /// Check that the connection is still alive
    pub fn noop(&mut self) -> Result<()> {
        self.inner.noop().map_err(classify)
    }

    /// Log out and close the connection
    pub fn logout(mut self) -> Result<()> {
        self.inner.logout().map_err(classify)
    }
}

/// UIDNEXT derived from the highest UID present in a non-empty folder
///
/// UIDs are not sequence numbers, so `exists` is only used when the server
/// returned nothing for `*`.
fn fallback_uid_next(exists: u32, highest_uid: Option<u32>) -> u32 {
    match highest_uid {
        Some(uid) => uid.saturating_add(1),
        None => exists.saturating_add(1),
    }
}

fn classify(error: imap::error::Error) -> Error {
    use imap::error::Error as ImapError;

    match error {
        ImapError::Io(e) => Error::Transport(e.to_string()),
        ImapError::Tls(e) => Error::Transport(e.to_string()),
        ImapError::TlsHandshake(e) => Error::Transport(e.to_string()),
        ImapError::ConnectionLost => Error::Transport("connection lost".to_string()),
        ImapError::No(msg) | ImapError::Bad(msg) => Error::Command(msg),
        other => Error::Command(other.to_string()),
    }
}
