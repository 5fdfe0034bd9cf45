//! IMAP implementation of the protocol capability
//!
//! `imap-session` is blocking, so every call runs on the blocking pool with a
//! timeout. A timed-out call leaves the session with the blocking thread; the
//! wrapper treats it as lost.

use super::{MailClient, MailSession, ProtocolError, ProtocolResult};
use crate::model::Mailbox;
use async_trait::async_trait;
use imap_session::ImapSession;
use std::time::Duration;
use tokio::task;

/// Connects to IMAP servers over TLS or STARTTLS
#[derive(Debug, Clone)]
pub struct ImapClient {
    timeout: Duration,
}

impl ImapClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ImapClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

async fn run_blocking<T, F>(timeout: Duration, op: F) -> ProtocolResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ProtocolResult<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ProtocolError::Connection(format!(
            "protocol worker failed: {}",
            join
        ))),
        Err(_) => Err(ProtocolError::Connection(format!(
            "no response within {}s",
            timeout.as_secs()
        ))),
    }
}

#[async_trait]
impl MailClient for ImapClient {
    async fn connect(&self, mailbox: &Mailbox) -> ProtocolResult<Box<dyn MailSession>> {
        let endpoint = mailbox.endpoint();
        let username = mailbox.username.clone();
        let password = mailbox.password.clone();

        tracing::debug!(
            mailbox_id = mailbox.id,
            host = %endpoint.host,
            port = endpoint.port,
            security = %endpoint.security,
            "Connecting"
        );

        let session = run_blocking(self.timeout, move || {
            ImapSession::login(&endpoint, &username, &password).map_err(ProtocolError::from)
        })
        .await?;

        Ok(Box::new(ImapMailSession {
            session: Some(session),
            timeout: self.timeout,
        }))
    }
}

struct ImapMailSession {
    session: Option<ImapSession>,
    timeout: Duration,
}

impl ImapMailSession {
    /// Run one command on the blocking pool, returning the session on completion
    async fn call<T, F>(&mut self, op: F) -> ProtocolResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> imap_session::Result<T> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ProtocolError::Connection("session closed".to_string()))?;

        let (session, result) = run_blocking(self.timeout, move || {
            let result = op(&mut session);
            Ok((session, result))
        })
        .await?;

        match result {
            Err(e) if e.is_transport() => Err(e.into()),
            other => {
                self.session = Some(session);
                other.map_err(ProtocolError::from)
            }
        }
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn open(&mut self, folder: &str) -> ProtocolResult<u32> {
        let folder = folder.to_string();
        let status = self.call(move |s| s.select(&folder)).await?;
        Ok(status.uid_next)
    }

    async fn search_after(&mut self, cursor: u32) -> ProtocolResult<Vec<u32>> {
        self.call(move |s| s.uids_after(cursor)).await
    }

    async fn fetch(&mut self, uid: u32) -> ProtocolResult<Vec<u8>> {
        self.call(move |s| s.fetch_raw(uid)).await
    }

    async fn logout(&mut self) -> ProtocolResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        run_blocking(self.timeout, move || {
            session.logout().map_err(ProtocolError::from)
        })
        .await
    }
}
