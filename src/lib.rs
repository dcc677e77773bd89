//! # Owlivion Sync Engine
//!
//! Background IMAP synchronization for Owlivion Mail. Keeps a local SQLite
//! mirror of every account's mailboxes up to date, reconciles read flags,
//! prefetches bodies and reports progress to whoever is listening.

pub mod config;
pub mod db;
pub mod mail;
pub mod sync;

use std::sync::Arc;

use config::EngineConfig;
use db::Database;
use mail::{ImapConnector, SessionConnector};
use sync::{
    BackgroundScheduler, PoolManager, SchedulerError, StatusBus, SyncOrchestrator, SyncPhase,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Everything the running engine shares, wired once at startup
pub struct AppContext {
    pub db: Arc<Database>,
    pub pools: Arc<PoolManager>,
    pub status: StatusBus,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub scheduler: Arc<BackgroundScheduler>,
}

impl AppContext {
    pub fn new(db: Database) -> Self {
        Self::with_connector(db, Arc::new(ImapConnector))
    }

    pub fn with_connector(db: Database, connector: Arc<dyn SessionConnector>) -> Self {
        let db = Arc::new(db);
        let pools = Arc::new(PoolManager::new(connector));
        let status = StatusBus::new();
        let orchestrator = Arc::new(SyncOrchestrator::new(db.clone(), pools.clone(), status.clone()));
        let scheduler = Arc::new(BackgroundScheduler::new(db.clone(), orchestrator.clone()));

        Self {
            db,
            pools,
            status,
            orchestrator,
            scheduler,
        }
    }

    /// Arm the scheduler and trigger the initial sync
    pub async fn start(&self, interval_override: Option<u64>) -> Result<(), SchedulerError> {
        self.scheduler.load_config().await?;

        match interval_override {
            Some(minutes) => self.scheduler.set_interval(minutes).await?,
            None => self.scheduler.start().await,
        }

        self.scheduler.notify_ready();
        Ok(())
    }

    /// Stop scheduling and close every IMAP connection
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.pools.close_all().await;
    }
}

/// Log every status event until the bus goes away
pub fn spawn_status_logger(status: &StatusBus) -> JoinHandle<()> {
    let mut events = status.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.status {
                    SyncPhase::Syncing => log::debug!("[account {}] {}", event.account_id, event.message),
                    SyncPhase::Done => log::info!("[account {}] {}", event.account_id, event.message),
                    SyncPhase::Error => log::warn!("[account {}] {}", event.account_id, event.message),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Status logger fell behind, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ============================================================================
// Application Entry Point
// ============================================================================

pub fn run() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database path: {:?}", config.db_path);

    // Initialize database with proper error handling
    let db = match Database::new(config.db_path.clone()) {
        Ok(db) => db,
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database initialized successfully");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            eprintln!("FATAL: Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let context = AppContext::new(db);
        let _status_logger = spawn_status_logger(&context.status);

        if let Err(e) = context.start(config.sync_interval_minutes).await {
            log::error!("Failed to start scheduler: {}", e);
        }

        log::info!("Sync engine running, press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }

        log::info!("Shutting down");
        context.shutdown().await;
    });
}
