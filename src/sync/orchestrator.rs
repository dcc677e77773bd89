//! Mailbox synchronization
//!
//! One pass per account: list the remote mailboxes, fetch everything above
//! each mailbox cursor in a single pooled operation, import it with
//! duplicate tolerance, pull read flags set on other clients and report
//! progress on the status bus.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;

use super::notify::{
    ImportantMailClassifier, InboxUnreadClassifier, LogNotifier, NotificationSummary, Notifier,
    DEFAULT_GROUP_THRESHOLD,
};
use super::pool::PoolManager;
use super::prefetch::BodyPrefetcher;
use super::status::{StatusBus, SyncStatusEvent};
use crate::db::{Account, DbError, MailStore, NewMessage};
use crate::mail::{MailError, MailboxSyncRequest};

/// Sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Mail(#[from] MailError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Summary of a completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub account_id: i64,
    pub mailboxes: usize,
    pub new_messages: usize,
    pub marked_read: usize,
    pub important: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass for the same account was still running
    AlreadyRunning,
}

/// Marks an account as syncing until dropped
struct InFlightGuard {
    accounts: Arc<StdMutex<HashSet<i64>>>,
    account_id: i64,
}

impl InFlightGuard {
    fn try_acquire(accounts: &Arc<StdMutex<HashSet<i64>>>, account_id: i64) -> Option<Self> {
        let mut set = accounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(account_id) {
            return None;
        }
        Some(Self {
            accounts: accounts.clone(),
            account_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.accounts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.account_id);
    }
}

/// Drives sync passes for all accounts
#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<dyn MailStore>,
    pools: Arc<PoolManager>,
    status: StatusBus,
    classifier: Arc<dyn ImportantMailClassifier>,
    notifier: Arc<dyn Notifier>,
    group_threshold: usize,
    prefetcher: Arc<BodyPrefetcher>,
    prefetch_enabled: bool,
    in_flight: Arc<StdMutex<HashSet<i64>>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn MailStore>, pools: Arc<PoolManager>, status: StatusBus) -> Self {
        let prefetcher = Arc::new(BodyPrefetcher::new(store.clone(), pools.clone()));
        Self {
            store,
            pools,
            status,
            classifier: Arc::new(InboxUnreadClassifier),
            notifier: Arc::new(LogNotifier),
            group_threshold: DEFAULT_GROUP_THRESHOLD,
            prefetcher,
            prefetch_enabled: true,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ImportantMailClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_group_threshold(mut self, threshold: usize) -> Self {
        self.group_threshold = threshold;
        self
    }

    /// Enable or disable the detached body prefetch after each pass
    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch_enabled = enabled;
        self
    }

    pub fn status(&self) -> &StatusBus {
        &self.status
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn prefetcher(&self) -> &Arc<BodyPrefetcher> {
        &self.prefetcher
    }

    /// Whether a pass for the account is currently running
    pub fn is_syncing(&self, account_id: i64) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(&account_id))
            .unwrap_or(false)
    }

    /// Incremental sync of one account.
    ///
    /// Returns `SyncOutcome::AlreadyRunning` immediately when a pass for the
    /// account is in progress.
    pub async fn sync_account(&self, account_id: i64) -> SyncResult<SyncOutcome> {
        self.guarded_sync(account_id, false).await
    }

    /// Reset every cursor of the account to zero, then sync. Already stored
    /// messages are skipped by the import's duplicate check.
    pub async fn full_resync(&self, account_id: i64) -> SyncResult<SyncOutcome> {
        self.guarded_sync(account_id, true).await
    }

    /// Sync every account concurrently. Failures are logged, not returned
    /// as an error.
    pub async fn sync_all_accounts(&self) -> Vec<(i64, SyncResult<SyncOutcome>)> {
        let accounts = match self.store.list_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Failed to list accounts for sync: {}", e);
                return Vec::new();
            }
        };

        let passes = accounts.iter().map(|account| async move {
            let result = self.sync_account(account.id).await;
            if let Err(e) = &result {
                log::error!("Sync failed for {}: {}", account.email, e);
            }
            (account.id, result)
        });

        join_all(passes).await
    }

    /// Set the read flag locally and on the server
    pub async fn set_read_state(&self, message_id: i64, read: bool) -> SyncResult<()> {
        let message = self.store.get_message(message_id)?;
        let account = self.store.get_account(message.account_id)?;

        self.store.set_message_read(message_id, read)?;

        let mailbox = message.mailbox;
        let uid = message.uid;
        self.pools
            .get(&account)
            .run(move |session| {
                let mailbox = mailbox.clone();
                Box::pin(async move { session.set_seen(&mailbox, &[uid], read).await })
            })
            .await?;

        log::debug!("Message {} marked {}", message_id, if read { "read" } else { "unread" });
        Ok(())
    }

    /// Close the account's connection and delete it with all its data
    pub async fn remove_account(&self, account_id: i64) -> SyncResult<()> {
        self.pools.remove(account_id).await;
        self.store.delete_account(account_id)?;
        log::info!("Account {} removed", account_id);
        Ok(())
    }

    async fn guarded_sync(&self, account_id: i64, reset_cursors: bool) -> SyncResult<SyncOutcome> {
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight, account_id) else {
            log::info!("Sync already running for account {}, skipping", account_id);
            return Ok(SyncOutcome::AlreadyRunning);
        };

        match self.run_pass(account_id, reset_cursors).await {
            Ok(report) => {
                log::info!(
                    "Account {} synced: {} new, {} marked read across {} mailbox(es)",
                    account_id,
                    report.new_messages,
                    report.marked_read,
                    report.mailboxes
                );
                self.status.publish(SyncStatusEvent::done(account_id, report.new_messages));

                if self.prefetch_enabled {
                    self.spawn_prefetch(account_id);
                }

                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                log::error!("Sync of account {} failed: {}", account_id, e);
                self.status.publish(SyncStatusEvent::error(account_id, e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_pass(&self, account_id: i64, reset_cursors: bool) -> SyncResult<SyncReport> {
        let account = self.store.get_account(account_id)?;

        if reset_cursors {
            let reset = self.store.reset_cursors(account_id)?;
            log::info!("Full resync of {}: reset {} cursor(s)", account.email, reset);
        }

        let pool = self.pools.get(&account);

        let mailboxes = pool
            .run(|session| Box::pin(async move { session.list_mailboxes().await }))
            .await?;

        let mut requests = Vec::new();
        let mut unread_snapshot: HashMap<String, HashMap<u32, i64>> = HashMap::new();

        for mailbox in mailboxes.into_iter().filter(|m| m.selectable) {
            let since_uid = self.store.get_mailbox_cursor(account_id, &mailbox.path)?;
            let unread = self.store.get_unread_uids(account_id, &mailbox.path)?;

            requests.push(MailboxSyncRequest {
                path: mailbox.path.clone(),
                since_uid,
                local_unread_uids: unread.iter().map(|u| u.uid).collect(),
            });
            unread_snapshot.insert(mailbox.path, unread.into_iter().map(|u| (u.uid, u.id)).collect());
        }

        log::debug!("Account {}: syncing {} mailbox(es)", account_id, requests.len());

        let results = pool
            .run(move |session| {
                let requests = requests.clone();
                Box::pin(async move { session.sync_mailboxes(&requests).await })
            })
            .await?;

        let total = results.len();
        let mut report = SyncReport {
            account_id,
            mailboxes: total,
            ..Default::default()
        };
        let mut inserted_ids = Vec::new();

        for (index, result) in results.iter().enumerate() {
            let batch: Vec<NewMessage> = result
                .new_messages
                .iter()
                .map(|remote| NewMessage::from_remote(account_id, &result.path, remote))
                .collect();
            let inserted = self.store.insert_messages(&batch)?;

            if inserted.len() < batch.len() {
                log::debug!(
                    "{}: {} of {} message(s) already stored",
                    result.path,
                    batch.len() - inserted.len(),
                    batch.len()
                );
            }

            self.store
                .set_mailbox_cursor(account_id, &result.path, result.max_uid)?;

            if let Some(snapshot) = unread_snapshot.get(&result.path) {
                let seen_ids: Vec<i64> = result
                    .uids_newly_seen
                    .iter()
                    .filter_map(|uid| snapshot.get(uid).copied())
                    .collect();
                if !seen_ids.is_empty() {
                    report.marked_read += self.store.mark_read_by_ids(&seen_ids)?;
                }
            }

            report.new_messages += inserted.len();
            inserted_ids.extend(inserted);

            self.status
                .publish(SyncStatusEvent::syncing(account_id, index + 1, total, &result.path));
        }

        report.important = self.notify_important(&account, &inserted_ids);

        Ok(report)
    }

    /// Classify the pass's new messages and send at most one notification
    fn notify_important(&self, account: &Account, inserted_ids: &[i64]) -> usize {
        if inserted_ids.is_empty() {
            return 0;
        }

        let messages = match self.store.get_messages(inserted_ids) {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Cannot load new messages for notification: {}", e);
                return 0;
            }
        };

        let important: Vec<_> = messages
            .into_iter()
            .filter(|m| !m.is_read && self.classifier.is_important(m))
            .collect();

        if let Some(summary) =
            NotificationSummary::build(account.id, &account.email, &important, self.group_threshold)
        {
            self.notifier.notify(&summary);
        }

        important.len()
    }

    fn spawn_prefetch(&self, account_id: i64) {
        let prefetcher = self.prefetcher.clone();
        tokio::spawn(async move {
            let stored = prefetcher.prefetch_bodies_for_account(account_id).await;
            if stored > 0 {
                log::info!("Prefetched {} message bodies for account {}", stored, account_id);
            }
        });
    }
}
