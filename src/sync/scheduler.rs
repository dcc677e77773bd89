//! Background Sync Scheduler
//!
//! Runs `sync_all_accounts` at a configurable interval and once when the
//! application signals it is ready. Uses Tokio tasks for non-blocking
//! background execution.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::db::Database;

const SETTINGS_KEY: &str = "scheduler_config";

/// Upper bound for the interval (one day)
pub const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// 0 disables periodic sync
    pub interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            last_run: None,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    orchestrator: Arc<SyncOrchestrator>,
    config: Arc<RwLock<SchedulerConfig>>,
    ready_fired: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            db,
            orchestrator,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            ready_fired: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    fn task_slot(&self) -> StdMutexGuard<'_, Option<JoinHandle<()>>> {
        self.task_handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self
            .db
            .get_setting(SETTINGS_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(SETTINGS_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Check if a periodic timer is armed
    pub fn is_running(&self) -> bool {
        self.task_slot().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Change the interval, persist it and re-arm the timer.
    /// An interval of 0 disables periodic sync.
    pub async fn set_interval(&self, interval_minutes: u64) -> Result<(), SchedulerError> {
        if interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(SchedulerError::InvalidInterval(format!(
                "Interval must be 0-{} minutes, got {}",
                MAX_INTERVAL_MINUTES, interval_minutes
            )));
        }

        self.config.write().await.interval_minutes = interval_minutes;
        self.save_config().await?;
        self.start().await;

        log::info!("Scheduler interval set to {} minutes", interval_minutes);
        Ok(())
    }

    /// Arm the periodic timer from the current configuration, replacing any
    /// previously armed timer
    pub async fn start(&self) {
        self.stop();

        let interval_minutes = self.config.read().await.interval_minutes;
        if interval_minutes == 0 {
            log::info!("Periodic sync disabled");
            return;
        }

        let period = Duration::from_secs(60 * interval_minutes);
        let handle = tokio::spawn(Self::scheduler_loop(
            period,
            self.db.clone(),
            self.config.clone(),
            self.orchestrator.clone(),
        ));

        // A concurrent start may have armed a timer meanwhile; never keep two
        if let Some(previous) = self.task_slot().replace(handle) {
            previous.abort();
        }

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
    }

    /// Disarm the periodic timer
    pub fn stop(&self) {
        if let Some(handle) = self.task_slot().take() {
            handle.abort();
            log::info!("Background scheduler stopped");
        }
    }

    /// Signal that the application is ready. The first call triggers one
    /// sync of all accounts; later calls do nothing. Returns whether this
    /// call triggered the sync.
    pub fn notify_ready(&self) -> bool {
        if self.ready_fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        log::info!("Application ready, starting initial sync");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            Self::log_results(orchestrator.sync_all_accounts().await);
        });
        true
    }

    fn log_results(results: Vec<(i64, super::orchestrator::SyncResult<SyncOutcome>)>) {
        let completed = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(SyncOutcome::Completed(_))))
            .count();
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();

        log::info!(
            "Background sync finished: accounts={}, completed={}, errors={}",
            results.len(),
            completed,
            failed
        );
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        period: Duration,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        orchestrator: Arc<SyncOrchestrator>,
    ) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            log::info!("Background sync triggered by scheduler");
            Self::log_results(orchestrator.sync_all_accounts().await);

            // Update last_run timestamp
            let snapshot = {
                let mut cfg = config.write().await;
                cfg.last_run = Some(Utc::now().to_rfc3339());
                cfg.clone()
            };

            if let Err(e) = db.set_setting(SETTINGS_KEY, &snapshot) {
                log::error!("Failed to save last_run timestamp: {}", e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
