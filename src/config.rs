//! Engine configuration from the environment

use std::path::PathBuf;
use thiserror::Error;

const DATA_DIR_ENV: &str = "OWLIVION_DATA_DIR";
const SYNC_INTERVAL_ENV: &str = "OWLIVION_SYNC_INTERVAL";
const DATABASE_FILE: &str = "owlivion-sync.db";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to get app directories. Please ensure HOME environment variable is set.")]
    NoDataDir,

    #[error("Failed to create data directory at {path:?}: {source}")]
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{var} must be a number of minutes, got {value:?}")]
    InvalidInterval { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Overrides the persisted scheduler interval when set
    pub sync_interval_minutes: Option<u64>,
}

impl EngineConfig {
    /// Load `.env`, resolve the data directory and create it
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let data_dir = match std::env::var_os(DATA_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => directories::ProjectDirs::from("com", "owlivion", "owlivion-mail")
                .ok_or(ConfigError::NoDataDir)?
                .data_dir()
                .to_path_buf(),
        };

        let interval = std::env::var(SYNC_INTERVAL_ENV).ok();
        let config = Self::from_parts(data_dir, interval.as_deref())?;

        std::fs::create_dir_all(&config.data_dir).map_err(|source| ConfigError::CreateDataDir {
            path: config.data_dir.clone(),
            source,
        })?;

        Ok(config)
    }

    fn from_parts(data_dir: PathBuf, interval: Option<&str>) -> Result<Self, ConfigError> {
        let sync_interval_minutes = match interval.map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(value.parse::<u64>().map_err(|_| ConfigError::InvalidInterval {
                var: SYNC_INTERVAL_ENV,
                value: value.to_string(),
            })?),
        };

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            data_dir,
            sync_interval_minutes,
        })
    }
}
