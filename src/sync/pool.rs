//! Per-account IMAP connection pool
//!
//! Each account owns at most one live session. All protocol work for the
//! account goes through `ConnectionPool::run`, which serializes callers in
//! arrival order, connects lazily, retries once on transient failures and
//! tears the session down after it has been idle for a while.

use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::lock::SerialLock;
use crate::db::Account;
use crate::mail::{ImapConfig, MailError, MailResult, MailSession, SessionConnector};

/// Session is logged out after this long without an operation
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub type BoxedSession = Box<dyn MailSession>;

/// Observable connection state of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolState {
    Disconnected,
    Connecting,
    Connected,
}

fn lock_ignoring_poison<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Zero-or-one session for a single account
pub struct ConnectionPool {
    account_id: i64,
    config: StdMutex<ImapConfig>,
    /// Set when `config` changed; the next operation reconnects
    stale: AtomicBool,
    connector: Arc<dyn SessionConnector>,
    session: SerialLock<Option<BoxedSession>>,
    state: StdMutex<PoolState>,
    idle_timeout: Duration,
    idle_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        account_id: i64,
        config: ImapConfig,
        connector: Arc<dyn SessionConnector>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            account_id,
            config: StdMutex::new(config),
            stale: AtomicBool::new(false),
            connector,
            session: SerialLock::new(None),
            state: StdMutex::new(PoolState::Disconnected),
            idle_timeout,
            idle_task: StdMutex::new(None),
        }
    }

    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    pub fn state(&self) -> PoolState {
        *lock_ignoring_poison(&self.state)
    }

    fn set_state(&self, state: PoolState) {
        *lock_ignoring_poison(&self.state) = state;
    }

    /// Swap in new account settings. The current session, if any, is logged
    /// out before the next operation and replaced by one using `config`.
    /// Returns whether anything changed.
    pub fn update_config(&self, config: &ImapConfig) -> bool {
        let mut current = lock_ignoring_poison(&self.config);
        if *current == *config {
            return false;
        }
        *current = config.clone();
        self.stale.store(true, Ordering::SeqCst);
        log::info!("Account {}: IMAP settings changed", self.account_id);
        true
    }

    /// Run `operation` against the account's session.
    ///
    /// Callers are served one at a time in arrival order. A transient
    /// failure drops the session and re-runs the whole operation once on a
    /// fresh connection; any other error, or a second failure, is returned
    /// unchanged.
    pub async fn run<T, F>(self: &Arc<Self>, mut operation: F) -> MailResult<T>
    where
        T: Send,
        F: for<'s> FnMut(&'s mut BoxedSession) -> BoxFuture<'s, MailResult<T>> + Send,
    {
        let mut slot = self.session.acquire().await;

        let result = match self.attempt(&mut slot, &mut operation).await {
            Err(e) if e.is_transient() => {
                log::warn!(
                    "Account {}: transient IMAP failure ({}), reconnecting and retrying once",
                    self.account_id,
                    e
                );
                self.discard(&mut slot);

                let retry = self.attempt(&mut slot, &mut operation).await;
                if let Err(e) = &retry {
                    log::warn!("Account {}: retry failed: {}", self.account_id, e);
                    if e.is_transient() {
                        self.discard(&mut slot);
                    }
                }
                retry
            }
            other => other,
        };

        // Re-arm while the ticket is still held so a pending idle close
        // can never run in between
        self.arm_idle_timer();
        drop(slot);

        result
    }

    async fn attempt<T, F>(&self, slot: &mut Option<BoxedSession>, operation: &mut F) -> MailResult<T>
    where
        F: for<'s> FnMut(&'s mut BoxedSession) -> BoxFuture<'s, MailResult<T>>,
    {
        if self.stale.swap(false, Ordering::SeqCst) {
            if let Some(mut session) = slot.take() {
                log::debug!("Account {}: reconnecting with updated settings", self.account_id);
                if let Err(e) = session.logout().await {
                    log::debug!("Account {}: logout failed: {}", self.account_id, e);
                }
                self.set_state(PoolState::Disconnected);
            }
        }

        if slot.as_ref().is_some_and(|session| !session.is_usable()) {
            log::debug!("Account {}: discarding unusable session", self.account_id);
            self.discard(slot);
        }

        if slot.is_none() {
            self.set_state(PoolState::Connecting);
            let config = lock_ignoring_poison(&self.config).clone();
            log::debug!(
                "Account {}: connecting to {}:{}",
                self.account_id,
                config.host,
                config.port
            );
            match self.connector.connect(&config).await {
                Ok(session) => {
                    *slot = Some(session);
                    self.set_state(PoolState::Connected);
                }
                Err(e) => {
                    self.set_state(PoolState::Disconnected);
                    return Err(e);
                }
            }
        }

        let session = slot.as_mut().ok_or(MailError::NotConnected)?;
        operation(session).await
    }

    /// Drop a broken session without talking to the server
    fn discard(&self, slot: &mut Option<BoxedSession>) {
        if slot.take().is_some() {
            self.set_state(PoolState::Disconnected);
        }
    }

    fn arm_idle_timer(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let timeout = self.idle_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.close_idle().await;
            }
        });

        if let Some(previous) = lock_ignoring_poison(&self.idle_task).replace(handle) {
            previous.abort();
        }
    }

    async fn close_idle(&self) {
        let mut slot = self.session.acquire().await;
        if let Some(mut session) = slot.take() {
            log::info!("Account {}: closing idle IMAP session", self.account_id);
            if let Err(e) = session.logout().await {
                log::debug!("Account {}: logout failed: {}", self.account_id, e);
            }
            self.set_state(PoolState::Disconnected);
        }
    }

    /// Log out and drop the session, waiting for any running operation first
    pub async fn close(&self) {
        let mut slot = self.session.acquire().await;

        if let Some(handle) = lock_ignoring_poison(&self.idle_task).take() {
            handle.abort();
        }

        if let Some(mut session) = slot.take() {
            if let Err(e) = session.logout().await {
                log::debug!("Account {}: logout failed: {}", self.account_id, e);
            }
        }
        self.set_state(PoolState::Disconnected);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(handle) = lock_ignoring_poison(&self.idle_task).take() {
            handle.abort();
        }
    }
}

/// Registry of per-account pools, owned by the application context
pub struct PoolManager {
    connector: Arc<dyn SessionConnector>,
    idle_timeout: Duration,
    pools: StdMutex<HashMap<i64, Arc<ConnectionPool>>>,
}

impl PoolManager {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self::with_idle_timeout(connector, IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(connector: Arc<dyn SessionConnector>, idle_timeout: Duration) -> Self {
        Self {
            connector,
            idle_timeout,
            pools: StdMutex::new(HashMap::new()),
        }
    }

    /// Pool for the account, created on first use. An existing pool picks up
    /// the account's current settings.
    pub fn get(&self, account: &Account) -> Arc<ConnectionPool> {
        let mut pools = lock_ignoring_poison(&self.pools);
        if let Some(pool) = pools.get(&account.id) {
            pool.update_config(&account.imap);
            return pool.clone();
        }

        log::debug!("Creating connection pool for account {}", account.id);
        let pool = Arc::new(ConnectionPool::new(
            account.id,
            account.imap.clone(),
            self.connector.clone(),
            self.idle_timeout,
        ));
        pools.insert(account.id, pool.clone());
        pool
    }

    /// Whether a pool exists for the account
    pub fn contains(&self, account_id: i64) -> bool {
        lock_ignoring_poison(&self.pools).contains_key(&account_id)
    }

    pub fn len(&self) -> usize {
        lock_ignoring_poison(&self.pools).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the account's pool and close its session
    pub async fn remove(&self, account_id: i64) {
        let pool = lock_ignoring_poison(&self.pools).remove(&account_id);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    /// Close every pool; used on shutdown
    pub async fn close_all(&self) {
        let pools: Vec<Arc<ConnectionPool>> = lock_ignoring_poison(&self.pools)
            .drain()
            .map(|(_, pool)| pool)
            .collect();

        log::info!("Closing {} IMAP connection pool(s)", pools.len());
        join_all(pools.iter().map(|pool| pool.close())).await;
    }
}
