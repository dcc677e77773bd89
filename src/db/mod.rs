//! Database module for the Owlivion sync engine
//!
//! SQLite storage for accounts, mailbox cursors, the local message mirror
//! and settings. `Database` implements the `MailStore` contract the sync
//! engine is written against.

pub mod store;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::mail::{FetchedBody, ImapConfig, SecurityType};
pub use store::{Account, BodylessMessage, MailStore, NewAccount, NewMessage, StoredMessage, UnreadRef};

/// SQLite caps bound parameters per statement; stay well below it
const MAX_IDS_PER_QUERY: usize = 500;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool
    /// holds exactly one connection that never expires.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // ACCOUNTS
    // =========================================================================

    /// Add a new email account
    pub fn add_account(&self, account: &NewAccount) -> DbResult<i64> {
        let conn = self.get_conn()?;

        conn.execute(
            r#"
            INSERT INTO accounts (
                email, display_name, imap_host, imap_port, imap_security,
                imap_username, password, accept_invalid_certs
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                account.email,
                account.display_name,
                account.imap_host,
                account.imap_port,
                account.imap_security,
                account.imap_username,
                account.password,
                account.accept_invalid_certs,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Replace an account's settings
    pub fn update_account(&self, account_id: i64, account: &NewAccount) -> DbResult<()> {
        let conn = self.get_conn()?;

        let updated = conn.execute(
            r#"
            UPDATE accounts SET
                email = ?1, display_name = ?2, imap_host = ?3, imap_port = ?4,
                imap_security = ?5, imap_username = ?6, password = ?7,
                accept_invalid_certs = ?8
            WHERE id = ?9
            "#,
            params![
                account.email,
                account.display_name,
                account.imap_host,
                account.imap_port,
                account.imap_security,
                account.imap_username,
                account.password,
                account.accept_invalid_certs,
                account_id,
            ],
        )?;

        if updated == 0 {
            return Err(DbError::NotFound(format!("account {}", account_id)));
        }
        Ok(())
    }

    fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
        let email: String = row.get(1)?;
        let username: Option<String> = row.get(6)?;
        let password: Option<String> = row.get(7)?;

        Ok(Account {
            id: row.get(0)?,
            display_name: row.get(2)?,
            imap: ImapConfig {
                host: row.get(3)?,
                port: row.get(4)?,
                security: SecurityType::parse(&row.get::<_, String>(5)?),
                username: username.unwrap_or_else(|| email.clone()),
                password: Zeroizing::new(password.unwrap_or_default()),
                accept_invalid_certs: row.get(8)?,
            },
            email,
        })
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            account_id: row.get(1)?,
            mailbox: row.get(2)?,
            message_id: row.get(3)?,
            uid: row.get(4)?,
            subject: row.get(5)?,
            from_address: row.get(6)?,
            from_name: row.get(7)?,
            date: row.get(8)?,
            is_read: row.get(9)?,
            is_starred: row.get(10)?,
            has_attachments: row.get(11)?,
            list_unsubscribe: row.get(12)?,
            body_fetched: row.get(13)?,
        })
    }

    /// Number of stored messages for an account
    pub fn count_messages(&self, account_id: i64) -> DbResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ?1",
            [account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All cursors of an account, ordered by mailbox
    pub fn get_cursors(&self, account_id: i64) -> DbResult<Vec<(String, u32)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT mailbox, last_uid FROM mailbox_cursors WHERE account_id = ?1 ORDER BY mailbox",
        )?;
        let rows = stmt.query_map([account_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }
}

const MESSAGE_COLUMNS: &str = "id, account_id, mailbox, message_id, uid, subject, from_address, \
     from_name, date, is_read, is_starred, has_attachments, list_unsubscribe, body_fetched";

impl MailStore for Database {
    fn list_accounts(&self) -> DbResult<Vec<Account>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, email, display_name, imap_host, imap_port, imap_security,
                   imap_username, password, accept_invalid_certs
            FROM accounts
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], Self::account_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }

    fn get_account(&self, account_id: i64) -> DbResult<Account> {
        let conn = self.get_conn()?;
        conn.query_row(
            r#"
            SELECT id, email, display_name, imap_host, imap_port, imap_security,
                   imap_username, password, accept_invalid_certs
            FROM accounts
            WHERE id = ?1
            "#,
            [account_id],
            Self::account_from_row,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("account {}", account_id)))
    }

    fn get_mailbox_cursor(&self, account_id: i64, mailbox: &str) -> DbResult<u32> {
        let conn = self.get_conn()?;
        let uid: Option<u32> = conn
            .query_row(
                "SELECT last_uid FROM mailbox_cursors WHERE account_id = ?1 AND mailbox = ?2",
                params![account_id, mailbox],
                |row| row.get(0),
            )
            .optional()?;
        Ok(uid.unwrap_or(0))
    }

    fn set_mailbox_cursor(&self, account_id: i64, mailbox: &str, uid: u32) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO mailbox_cursors (account_id, mailbox, last_uid, updated_at)
            VALUES (?1, ?2, ?3, datetime('now'))
            ON CONFLICT(account_id, mailbox) DO UPDATE SET
                last_uid = MAX(last_uid, excluded.last_uid),
                updated_at = datetime('now')
            "#,
            params![account_id, mailbox, uid],
        )?;
        Ok(())
    }

    fn reset_cursors(&self, account_id: i64) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE mailbox_cursors SET last_uid = 0, updated_at = datetime('now') WHERE account_id = ?1",
            [account_id],
        )?;
        Ok(affected)
    }

    fn get_unread_uids(&self, account_id: i64, mailbox: &str) -> DbResult<Vec<UnreadRef>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, uid FROM messages
            WHERE account_id = ?1 AND mailbox = ?2 AND is_read = 0
            ORDER BY uid
            "#,
        )?;
        let rows = stmt.query_map(params![account_id, mailbox], |row| {
            Ok(UnreadRef {
                id: row.get(0)?,
                uid: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }

    fn insert_messages(&self, batch: &[NewMessage]) -> DbResult<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::new();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO messages (
                    account_id, mailbox, message_id, uid, subject, from_address, from_name,
                    to_addresses, date, is_read, is_starred, has_attachments,
                    list_unsubscribe, in_reply_to
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(account_id, mailbox, message_id) DO NOTHING
                "#,
            )?;

            for message in batch {
                let to_addresses = serde_json::to_string(&message.to_addresses)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;

                let changed = stmt.execute(params![
                    message.account_id,
                    message.mailbox,
                    message.message_id,
                    message.uid,
                    message.subject,
                    message.from_address,
                    message.from_name,
                    to_addresses,
                    message.date,
                    message.is_read,
                    message.is_starred,
                    message.has_attachments,
                    message.list_unsubscribe,
                    message.in_reply_to,
                ])?;

                if changed > 0 {
                    inserted.push(tx.last_insert_rowid());
                }
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn mark_read_by_ids(&self, ids: &[i64]) -> DbResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut affected = 0;
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let sql = format!(
                "UPDATE messages SET is_read = 1 WHERE is_read = 0 AND id IN ({})",
                placeholders(chunk.len())
            );
            affected += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(affected)
    }

    fn get_message(&self, id: i64) -> DbResult<StoredMessage> {
        let conn = self.get_conn()?;
        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        conn.query_row(&sql, [id], Self::message_from_row)
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("message {}", id)))
    }

    fn get_messages(&self, ids: &[i64]) -> DbResult<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut messages = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let sql = format!(
                "SELECT {} FROM messages WHERE id IN ({}) ORDER BY id",
                MESSAGE_COLUMNS,
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), Self::message_from_row)?;
            for row in rows {
                messages.push(row?);
            }
        }
        Ok(messages)
    }

    fn messages_missing_body(&self, account_id: i64, limit: usize) -> DbResult<Vec<BodylessMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, mailbox, uid FROM messages
            WHERE account_id = ?1 AND body_fetched = 0
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![account_id, limit as i64], |row| {
            Ok(BodylessMessage {
                id: row.get(0)?,
                mailbox: row.get(1)?,
                uid: row.get(2)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(DbError::from)
    }

    fn update_message_body(&self, id: i64, body: &FetchedBody) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            r#"
            UPDATE messages SET
                body_text = ?2,
                body_html = ?3,
                list_unsubscribe = COALESCE(?4, list_unsubscribe),
                body_fetched = 1
            WHERE id = ?1
            "#,
            params![id, body.body_text, body.body_html, body.list_unsubscribe],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    fn set_message_read(&self, id: i64, read: bool) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute("UPDATE messages SET is_read = ?2 WHERE id = ?1", params![id, read])?;
        if affected == 0 {
            return Err(DbError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    fn delete_account(&self, account_id: i64) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM accounts WHERE id = ?1", [account_id])?;
        Ok(())
    }
}
