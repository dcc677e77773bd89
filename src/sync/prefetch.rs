//! Background body prefetch
//!
//! Sync passes only import envelopes. After each pass the most recent
//! bodiless messages get their bodies fetched through the account's pool so
//! opening them later does not hit the network.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::pool::PoolManager;
use crate::db::{BodylessMessage, MailStore};

/// Maximum number of bodies fetched per pass
pub const PREFETCH_LIMIT: usize = 20;

pub struct BodyPrefetcher {
    store: Arc<dyn MailStore>,
    pools: Arc<PoolManager>,
    limit: usize,
}

impl BodyPrefetcher {
    pub fn new(store: Arc<dyn MailStore>, pools: Arc<PoolManager>) -> Self {
        Self {
            store,
            pools,
            limit: PREFETCH_LIMIT,
        }
    }

    /// Fetch and store bodies for the account's most recent bodiless
    /// messages. Failures are logged per mailbox; returns the number of
    /// bodies stored.
    pub async fn prefetch_bodies_for_account(&self, account_id: i64) -> usize {
        let account = match self.store.get_account(account_id) {
            Ok(account) => account,
            Err(e) => {
                log::warn!("Prefetch: cannot load account {}: {}", account_id, e);
                return 0;
            }
        };

        let pending = match self.store.messages_missing_body(account_id, self.limit) {
            Ok(pending) => pending,
            Err(e) => {
                log::warn!("Prefetch: cannot list messages for account {}: {}", account_id, e);
                return 0;
            }
        };

        if pending.is_empty() {
            return 0;
        }

        let mut by_mailbox: BTreeMap<String, Vec<BodylessMessage>> = BTreeMap::new();
        for message in pending {
            by_mailbox.entry(message.mailbox.clone()).or_default().push(message);
        }

        let pool = self.pools.get(&account);
        let mut stored = 0;

        for (mailbox, messages) in by_mailbox {
            let uids: Vec<u32> = messages.iter().map(|m| m.uid).collect();

            let fetched = {
                let mailbox = mailbox.clone();
                pool.run(move |session| {
                    let mailbox = mailbox.clone();
                    let uids = uids.clone();
                    Box::pin(async move { session.fetch_bodies(&mailbox, &uids).await })
                })
                .await
            };

            let bodies = match fetched {
                Ok(bodies) => bodies,
                Err(e) => {
                    log::warn!(
                        "Prefetch: fetching bodies from {} failed for account {}: {}",
                        mailbox,
                        account_id,
                        e
                    );
                    continue;
                }
            };

            for message in &messages {
                let Some(body) = bodies.get(&message.uid) else {
                    log::debug!("Prefetch: server returned no body for {} UID {}", mailbox, message.uid);
                    continue;
                };

                match self.store.update_message_body(message.id, body) {
                    Ok(()) => stored += 1,
                    Err(e) => log::warn!("Prefetch: storing body of message {} failed: {}", message.id, e),
                }
            }
        }

        log::debug!("Prefetched {} bodies for account {}", stored, account_id);
        stored
    }
}
