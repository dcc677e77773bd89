//! Store contract consumed by the sync engine
//!
//! The orchestrator and prefetcher only ever talk to the local mirror
//! through `MailStore`, so the SQLite `Database` can be swapped out.

use super::DbResult;
use crate::mail::{FetchedBody, ImapConfig, RemoteMessage};
use serde::{Deserialize, Serialize};

/// Account with its IMAP connection parameters
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub imap: ImapConfig,
}

/// New account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub display_name: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_security: String,
    pub imap_username: Option<String>,
    pub password: Option<String>,
    pub accept_invalid_certs: bool,
}

/// Message row to import; unique on (account_id, mailbox, message_id)
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub account_id: i64,
    pub mailbox: String,
    pub message_id: String,
    pub uid: u32,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub date: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachments: bool,
    pub list_unsubscribe: Option<String>,
    pub in_reply_to: Option<String>,
}

impl NewMessage {
    pub fn from_remote(account_id: i64, mailbox: &str, remote: &RemoteMessage) -> Self {
        Self {
            account_id,
            mailbox: mailbox.to_string(),
            message_id: remote.dedup_id(),
            uid: remote.uid,
            subject: remote.subject.clone(),
            from_address: remote.from_address.clone(),
            from_name: remote.from_name.clone(),
            to_addresses: remote.to_addresses.clone(),
            date: remote.date.clone(),
            is_read: remote.is_read,
            is_starred: remote.is_starred,
            has_attachments: remote.has_attachments,
            list_unsubscribe: remote.list_unsubscribe.clone(),
            in_reply_to: remote.in_reply_to.clone(),
        }
    }
}

/// Stored message summary (no body)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: i64,
    pub mailbox: String,
    pub message_id: String,
    pub uid: u32,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub date: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachments: bool,
    pub list_unsubscribe: Option<String>,
    pub body_fetched: bool,
}

/// Local id/UID pair of an unread message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadRef {
    pub id: i64,
    pub uid: u32,
}

/// Message still waiting for its body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodylessMessage {
    pub id: i64,
    pub mailbox: String,
    pub uid: u32,
}

/// Local mirror used by the sync engine.
///
/// Implementations must be safe to call from several accounts' sync passes
/// at once and must make `insert_messages` idempotent on the dedup key.
pub trait MailStore: Send + Sync {
    fn list_accounts(&self) -> DbResult<Vec<Account>>;

    fn get_account(&self, account_id: i64) -> DbResult<Account>;

    /// Highest imported UID, 0 when the mailbox was never synced
    fn get_mailbox_cursor(&self, account_id: i64, mailbox: &str) -> DbResult<u32>;

    /// Advance the cursor; a lower value than the stored one is ignored
    fn set_mailbox_cursor(&self, account_id: i64, mailbox: &str, uid: u32) -> DbResult<()>;

    /// Reset every cursor of the account to 0
    fn reset_cursors(&self, account_id: i64) -> DbResult<usize>;

    fn get_unread_uids(&self, account_id: i64, mailbox: &str) -> DbResult<Vec<UnreadRef>>;

    /// Insert a batch, skipping rows whose dedup key already exists.
    /// Returns the ids of the rows actually inserted.
    fn insert_messages(&self, batch: &[NewMessage]) -> DbResult<Vec<i64>>;

    fn mark_read_by_ids(&self, ids: &[i64]) -> DbResult<usize>;

    fn get_message(&self, id: i64) -> DbResult<StoredMessage>;

    fn get_messages(&self, ids: &[i64]) -> DbResult<Vec<StoredMessage>>;

    /// Most recently imported messages of the account without a body
    fn messages_missing_body(&self, account_id: i64, limit: usize) -> DbResult<Vec<BodylessMessage>>;

    fn update_message_body(&self, id: i64, body: &FetchedBody) -> DbResult<()>;

    fn set_message_read(&self, id: i64, read: bool) -> DbResult<()>;

    /// Delete the account with its cursors and messages
    fn delete_account(&self, account_id: i64) -> DbResult<()>;
}
