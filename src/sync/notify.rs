//! Important-mail notifications
//!
//! After a sync pass the orchestrator hands the newly imported messages to an
//! `ImportantMailClassifier` and turns the matches into at most one
//! `NotificationSummary` per account, delivered through a `Notifier`.

use serde::{Deserialize, Serialize};

use crate::db::StoredMessage;

/// Above this many important messages only the count is shown
pub const DEFAULT_GROUP_THRESHOLD: usize = 3;

/// Decides which freshly imported messages deserve a notification
pub trait ImportantMailClassifier: Send + Sync {
    fn is_important(&self, message: &StoredMessage) -> bool;
}

/// Unread INBOX mail that does not look like a newsletter
#[derive(Debug, Clone, Copy, Default)]
pub struct InboxUnreadClassifier;

impl ImportantMailClassifier for InboxUnreadClassifier {
    fn is_important(&self, message: &StoredMessage) -> bool {
        message.mailbox.eq_ignore_ascii_case("INBOX")
            && !message.is_read
            && message
                .list_unsubscribe
                .as_deref()
                .map_or(true, |header| header.trim().is_empty())
    }
}

/// One summarized notification for an account's sync pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    pub account_id: i64,
    pub count: usize,
    pub title: String,
    pub body: String,
}

impl NotificationSummary {
    /// Build the summary, or `None` when nothing is important
    pub fn build(
        account_id: i64,
        account_email: &str,
        important: &[StoredMessage],
        threshold: usize,
    ) -> Option<Self> {
        let count = important.len();
        let (title, body) = match important {
            [] => return None,
            [message] => (
                "Neue wichtige E-Mail".to_string(),
                format!("{}: {}", sender_label(message), message.subject),
            ),
            _ if count <= threshold => (
                format!("{} wichtige E-Mails", count),
                important
                    .iter()
                    .map(|m| format!("{}: {}", sender_label(m), m.subject))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => (
                format!("{} wichtige E-Mails", count),
                format!("{} neue wichtige E-Mails in {}", count, account_email),
            ),
        };

        Some(Self {
            account_id,
            count,
            title,
            body,
        })
    }
}

fn sender_label(message: &StoredMessage) -> &str {
    match message.from_name.as_deref() {
        Some(name) if !name.trim().is_empty() => name,
        _ => &message.from_address,
    }
}

/// Delivers notifications to the user
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &NotificationSummary);
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &NotificationSummary) {
        log::info!(
            "Notification for account {}: {} ({} message(s))",
            summary.account_id,
            summary.title,
            summary.count
        );
    }
}
