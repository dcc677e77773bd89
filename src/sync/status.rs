//! Sync status events for the presentation layer
//!
//! Events are fire-and-forget: publishing with no subscriber is fine and a
//! receiver that falls behind loses the oldest events.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Syncing,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub mailbox: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub account_id: i64,
    pub status: SyncPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<SyncProgress>,
}

impl SyncStatusEvent {
    pub fn syncing(account_id: i64, current: usize, total: usize, mailbox: &str) -> Self {
        Self {
            account_id,
            status: SyncPhase::Syncing,
            message: format!("Synchronisiere {} ({}/{})", mailbox, current, total),
            progress: Some(SyncProgress {
                current,
                total,
                mailbox: mailbox.to_string(),
            }),
        }
    }

    pub fn done(account_id: i64, new_messages: usize) -> Self {
        Self {
            account_id,
            status: SyncPhase::Done,
            message: format!("{} neue E-Mail(s)", new_messages),
            progress: None,
        }
    }

    pub fn error(account_id: i64, message: impl Into<String>) -> Self {
        Self {
            account_id,
            status: SyncPhase::Error,
            message: message.into(),
            progress: None,
        }
    }
}

/// Broadcast channel for `SyncStatusEvent`s
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<SyncStatusEvent>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncStatusEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}
