//! SQLite store implementation

use super::{
    MailboxAdmin, MailboxDirectory, MessageStore, StoreError, StoreResult, SyncStateStore,
};
use crate::model::{
    HeaderField, Mailbox, MailboxId, NewMailbox, NewMessage, SkippedMessage, StoredMessage,
    SyncState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const MAILBOX_COLUMNS: &str =
    "id, address, username, password, host, port, security, folder, active, shard, created_at";

const MESSAGE_COLUMNS: &str = "id, mailbox_id, uid, message_id, sender, recipients, cc, subject, \
     text_body, html_body, headers, has_attachments, received_at, stored_at";

/// SQLite-backed control-plane store
///
/// One connection behind a mutex. Every statement is short, so the lock is
/// never held across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: &Path) -> crate::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %path.display(), "Opening mailsync database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> crate::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                security TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT 'INBOX',
                active INTEGER NOT NULL DEFAULT 1,
                shard TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_states (
                mailbox_id INTEGER PRIMARY KEY,
                cursor INTEGER NOT NULL DEFAULT 0,
                initial_sync_completed_at TEXT,
                last_synced_at TEXT,
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mailbox_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT,
                sender TEXT,
                recipients TEXT NOT NULL,
                cc TEXT NOT NULL,
                subject TEXT,
                text_body TEXT,
                html_body TEXT,
                headers TEXT NOT NULL,
                has_attachments INTEGER NOT NULL,
                received_at TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                UNIQUE (mailbox_id, uid),
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS skipped_messages (
                mailbox_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                reason TEXT NOT NULL,
                skipped_at TEXT NOT NULL,
                PRIMARY KEY (mailbox_id, uid),
                FOREIGN KEY (mailbox_id) REFERENCES mailboxes(id) ON DELETE CASCADE
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_message_id
                ON messages(mailbox_id, message_id) WHERE message_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_mailboxes_shard ON mailboxes(shard, active);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    fn load_mailbox(conn: &Connection, id: MailboxId) -> StoreResult<Option<Mailbox>> {
        let sql = format!("SELECT {} FROM mailboxes WHERE id = ?1", MAILBOX_COLUMNS);
        Ok(conn
            .query_row(&sql, params![id], mailbox_from_row)
            .optional()?)
    }

    fn require_mailbox(conn: &Connection, id: MailboxId) -> StoreResult<Mailbox> {
        Self::load_mailbox(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("mailbox {}", id)))
    }

    fn load_sync_state(conn: &Connection, mailbox_id: MailboxId) -> StoreResult<Option<SyncState>> {
        Ok(conn
            .query_row(
                "SELECT mailbox_id, cursor, initial_sync_completed_at, last_synced_at
                 FROM sync_states WHERE mailbox_id = ?1",
                params![mailbox_id],
                sync_state_from_row,
            )
            .optional()?)
    }
}

#[async_trait]
impl MailboxDirectory for SqliteStore {
    async fn get_mailbox(&self, id: MailboxId) -> StoreResult<Option<Mailbox>> {
        let conn = self.conn()?;
        Self::load_mailbox(&conn, id)
    }

    async fn list_active_mailboxes(&self, shard: &str) -> StoreResult<Vec<Mailbox>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM mailboxes WHERE active = 1 AND shard = ?1 ORDER BY id",
            MAILBOX_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![shard], mailbox_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[async_trait]
impl SyncStateStore for SqliteStore {
    async fn get_or_create_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<SyncState> {
        let conn = self.conn()?;
        Self::require_mailbox(&conn, mailbox_id)?;

        conn.execute(
            "INSERT OR IGNORE INTO sync_states (mailbox_id, cursor) VALUES (?1, 0)",
            params![mailbox_id],
        )?;

        Self::load_sync_state(&conn, mailbox_id)?
            .ok_or_else(|| StoreError::NotFound(format!("sync state for mailbox {}", mailbox_id)))
    }

    async fn update_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_states (mailbox_id, cursor, initial_sync_completed_at, last_synced_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(mailbox_id) DO UPDATE SET
                cursor = MAX(cursor, excluded.cursor),
                initial_sync_completed_at =
                    COALESCE(initial_sync_completed_at, excluded.initial_sync_completed_at),
                last_synced_at = COALESCE(excluded.last_synced_at, last_synced_at)
            "#,
            params![
                state.mailbox_id,
                state.cursor,
                state.initial_sync_completed_at.map(|t| t.to_rfc3339()),
                state.last_synced_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| map_write_error(e, || format!("sync state {}", state.mailbox_id)))?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<i64> {
        let conn = self.conn()?;
        let headers = serde_json::to_string(&message.headers)
            .map_err(|e| StoreError::Unavailable(format!("cannot encode headers: {}", e)))?;
        let recipients = serde_json::to_string(&message.recipients)
            .map_err(|e| StoreError::Unavailable(format!("cannot encode recipients: {}", e)))?;
        let cc = serde_json::to_string(&message.cc)
            .map_err(|e| StoreError::Unavailable(format!("cannot encode cc: {}", e)))?;

        conn.execute(
            r#"
            INSERT INTO messages (
                mailbox_id, uid, message_id, sender, recipients, cc, subject,
                text_body, html_body, headers, has_attachments, received_at, stored_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                message.mailbox_id,
                message.uid,
                message.message_id,
                message.sender,
                recipients,
                cc,
                message.subject,
                message.text_body,
                message.html_body,
                headers,
                message.has_attachments,
                message.received_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| {
            map_write_error(e, || {
                format!("mailbox {} uid {}", message.mailbox_id, message.uid)
            })
        })?;

        Ok(conn.last_insert_rowid())
    }

    async fn record_skipped(&self, skipped: &SkippedMessage) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO skipped_messages (mailbox_id, uid, attempts, reason, skipped_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(mailbox_id, uid) DO UPDATE SET
                attempts = excluded.attempts,
                reason = excluded.reason,
                skipped_at = excluded.skipped_at
            "#,
            params![
                skipped.mailbox_id,
                skipped.uid,
                skipped.attempts,
                skipped.reason,
                skipped.skipped_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl MailboxAdmin for SqliteStore {
    async fn create_mailbox(&self, mailbox: NewMailbox) -> StoreResult<Mailbox> {
        let conn = self.conn()?;
        let created_at = Utc::now();
        conn.execute(
            r#"
            INSERT INTO mailboxes (
                address, username, password, host, port, security, folder,
                active, shard, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                mailbox.address,
                mailbox.username,
                mailbox.password,
                mailbox.host,
                mailbox.port,
                mailbox.security.to_string(),
                mailbox.folder,
                mailbox.active,
                mailbox.shard,
                created_at.to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        tracing::info!(mailbox_id = id, address = %mailbox.address, "Created mailbox");
        Self::require_mailbox(&conn, id)
    }

    async fn delete_mailbox(&self, id: MailboxId) -> StoreResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM mailboxes WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("mailbox {}", id)));
        }
        tracing::info!(mailbox_id = id, "Deleted mailbox");
        Ok(())
    }

    async fn set_active(&self, id: MailboxId, active: bool) -> StoreResult<Mailbox> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mailboxes SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Self::require_mailbox(&conn, id)
    }

    async fn assign_shard(&self, id: MailboxId, shard: &str) -> StoreResult<Mailbox> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mailboxes SET shard = ?1 WHERE id = ?2",
            params![shard, id],
        )?;
        Self::require_mailbox(&conn, id)
    }

    async fn list_mailboxes(&self) -> StoreResult<Vec<Mailbox>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM mailboxes ORDER BY id", MAILBOX_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], mailbox_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_sync_state(&self, mailbox_id: MailboxId) -> StoreResult<Option<SyncState>> {
        let conn = self.conn()?;
        Self::load_sync_state(&conn, mailbox_id)
    }

    async fn list_sync_states(&self) -> StoreResult<Vec<SyncState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT mailbox_id, cursor, initial_sync_completed_at, last_synced_at
             FROM sync_states ORDER BY mailbox_id",
        )?;
        let rows = stmt.query_map([], sync_state_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn list_messages(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE mailbox_id = ?1 ORDER BY uid DESC LIMIT ?2",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![mailbox_id, limit], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn count_messages(&self, mailbox_id: MailboxId) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE mailbox_id = ?1",
            params![mailbox_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    async fn list_skipped(&self, mailbox_id: MailboxId) -> StoreResult<Vec<SkippedMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT mailbox_id, uid, attempts, reason, skipped_at
             FROM skipped_messages WHERE mailbox_id = ?1 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![mailbox_id], |row| {
            Ok(SkippedMessage {
                mailbox_id: row.get(0)?,
                uid: row.get(1)?,
                attempts: row.get(2)?,
                reason: row.get(3)?,
                skipped_at: timestamp(row, 4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Unique-constraint violations become conflicts; everything else stays a database error
fn map_write_error(err: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    use rusqlite::ffi;

    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::Conflict(what())
        }
        _ => StoreError::Database(err),
    }
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    let security: String = row.get(6)?;
    Ok(Mailbox {
        id: row.get(0)?,
        address: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        host: row.get(4)?,
        port: row.get(5)?,
        security: security.parse().map_err(|e: imap_session::Error| {
            rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.to_string().into())
        })?,
        folder: row.get(7)?,
        active: row.get(8)?,
        shard: row.get(9)?,
        created_at: timestamp(row, 10)?,
    })
}

fn sync_state_from_row(row: &Row<'_>) -> rusqlite::Result<SyncState> {
    Ok(SyncState {
        mailbox_id: row.get(0)?,
        cursor: row.get(1)?,
        initial_sync_completed_at: optional_timestamp(row, 2)?,
        last_synced_at: optional_timestamp(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let headers: Vec<HeaderField> = json_column(row, 10)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        message: NewMessage {
            mailbox_id: row.get(1)?,
            uid: row.get(2)?,
            message_id: row.get(3)?,
            sender: row.get(4)?,
            recipients: json_column(row, 5)?,
            cc: json_column(row, 6)?,
            subject: row.get(7)?,
            text_body: row.get(8)?,
            html_body: row.get(9)?,
            headers,
            has_attachments: row.get(11)?,
            received_at: timestamp(row, 12)?,
        },
        stored_at: timestamp(row, 13)?,
    })
}
