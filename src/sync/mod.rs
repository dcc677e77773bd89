//! Sync Module - Background Mailbox Synchronization
//!
//! Keeps the local store consistent with every account's IMAP server:
//! - Per-account connection pool (FIFO serialized, idle teardown, retry once)
//! - Incremental sync keyed on per-mailbox UID cursors
//! - Read-flag reconciliation and important-mail notifications
//! - Periodic and startup-triggered scheduling
//! - Background body prefetch
//!
//! Architecture:
//! - Accounts sync in parallel; work within an account is serialized
//! - At most one sync pass per account is in flight
//! - Status is broadcast to any number of observers

pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod prefetch;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use lock::{SerialLock, Ticket};
pub use notify::{
    ImportantMailClassifier, InboxUnreadClassifier, LogNotifier, NotificationSummary, Notifier,
    DEFAULT_GROUP_THRESHOLD,
};
pub use orchestrator::{SyncError, SyncOrchestrator, SyncOutcome, SyncReport, SyncResult};
pub use pool::{BoxedSession, ConnectionPool, PoolManager, PoolState, IDLE_TIMEOUT};
pub use prefetch::{BodyPrefetcher, PREFETCH_LIMIT};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use status::{StatusBus, SyncPhase, SyncProgress, SyncStatusEvent};
