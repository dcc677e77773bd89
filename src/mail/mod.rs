//! # Owlivion Sync Engine - Mail Module
//!
//! The protocol-session boundary: the types the sync engine exchanges with a
//! remote mailbox, the `MailSession` / `SessionConnector` traits, and the
//! async-imap backed implementation.

pub mod async_imap;
pub mod config;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Re-export commonly used types
pub use async_imap::{AsyncImapSession, ImapConnector};
pub use config::{ImapConfig, SecurityType};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Whether reconnecting and retrying once is expected to help.
    ///
    /// Network and timing failures qualify. Authentication, configuration
    /// and protocol-level rejections do not: a fresh session would fail the
    /// same way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MailError::Connection(_)
                | MailError::ConnectionClosed(_)
                | MailError::Timeout(_)
                | MailError::Io(_)
        )
    }
}

/// Remote mailbox as reported by LIST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxInfo {
    pub path: String,
    pub special_use: Option<SpecialUse>,
    pub selectable: bool,
}

/// RFC 6154 special-use attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialUse {
    Inbox,
    All,
    Archive,
    Drafts,
    Flagged,
    Junk,
    Sent,
    Trash,
}

impl SpecialUse {
    /// Map a LIST attribute such as `\Sent` to its special use
    pub fn from_attribute(attr: &str) -> Option<Self> {
        match attr.trim_start_matches('\\').to_lowercase().as_str() {
            "all" => Some(SpecialUse::All),
            "archive" => Some(SpecialUse::Archive),
            "drafts" => Some(SpecialUse::Drafts),
            "flagged" => Some(SpecialUse::Flagged),
            "junk" => Some(SpecialUse::Junk),
            "sent" => Some(SpecialUse::Sent),
            "trash" => Some(SpecialUse::Trash),
            _ => None,
        }
    }
}

/// Envelope-level view of a message that is new on the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub uid: u32,
    /// Message-ID header; `None` when the server has none
    pub message_id: Option<String>,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_addresses: Vec<String>,
    pub date: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachments: bool,
    /// Raw List-Unsubscribe header, present for newsletters
    pub list_unsubscribe: Option<String>,
    pub in_reply_to: Option<String>,
}

impl RemoteMessage {
    /// Key used for duplicate detection within a mailbox
    pub fn dedup_id(&self) -> String {
        match &self.message_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("uid-{}", self.uid),
        }
    }
}

/// Per-mailbox input of one sync pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxSyncRequest {
    pub path: String,
    /// Highest UID already imported; fetch strictly above it
    pub since_uid: u32,
    /// UIDs that are unread locally; the server reports which are now seen
    pub local_unread_uids: Vec<u32>,
}

/// Per-mailbox result of one sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailboxSyncResult {
    pub path: String,
    pub new_messages: Vec<RemoteMessage>,
    pub uids_newly_seen: Vec<u32>,
    /// Highest UID observed on the server, never below `since_uid`
    pub max_uid: u32,
}

/// Body content fetched by the prefetcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBody {
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub list_unsubscribe: Option<String>,
}

/// One authenticated session with a remote mailbox server.
///
/// Implementations hold exactly one connection and are driven by one caller
/// at a time; the connection pool guarantees that.
#[async_trait]
pub trait MailSession: Send {
    /// LIST all mailboxes
    async fn list_mailboxes(&mut self) -> MailResult<Vec<MailboxInfo>>;

    /// Fetch new envelopes and newly-seen flags for every requested mailbox.
    /// Mailboxes the server refuses to open are left out of the result.
    async fn sync_mailboxes(
        &mut self,
        requests: &[MailboxSyncRequest],
    ) -> MailResult<Vec<MailboxSyncResult>>;

    /// Fetch full bodies for the given UIDs of one mailbox
    async fn fetch_bodies(
        &mut self,
        mailbox: &str,
        uids: &[u32],
    ) -> MailResult<HashMap<u32, FetchedBody>>;

    /// Add or remove `\Seen` on the given UIDs
    async fn set_seen(&mut self, mailbox: &str, uids: &[u32], seen: bool) -> MailResult<()>;

    /// False once the underlying connection is known to be broken
    fn is_usable(&self) -> bool {
        true
    }

    /// Log out and close the connection
    async fn logout(&mut self) -> MailResult<()>;
}

/// Opens new authenticated sessions
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, config: &ImapConfig) -> MailResult<Box<dyn MailSession>>;
}
