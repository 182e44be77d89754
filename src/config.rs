//! Configuration management
//!
//! Loads the service configuration from `config.toml`: store location,
//! engine timeouts, scheduling, retention, input source and model.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::ModelSettings;
use crate::scheduler::{Maintenance, SchedulerConfig};
use crate::source::SourceSettings;
use crate::store::StoreOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database location and SQLite options
    #[serde(default)]
    pub store: StoreConfig,
    /// Executor and staleness settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Tick schedule, concurrency and retry policy
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Recovery and retention windows
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Where subject inputs are read from
    #[serde(default)]
    pub source: SourceSettings,
    /// Which model computes predictions
    #[serde(default)]
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file; defaults to `predictor.db` in the data directory
    pub path: Option<PathBuf>,
    /// How long SQLite waits on a locked database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout() -> u64 {
    StoreOptions::default().busy_timeout_ms
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on a single model computation
    #[serde(default = "default_compute_timeout")]
    pub compute_timeout_secs: u64,
    /// Treat committed predictions older than this as stale (off when unset)
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

fn default_compute_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compute_timeout_secs: default_compute_timeout(),
            max_age_secs: None,
        }
    }
}

impl EngineConfig {
    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs.max(1))
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Open attempts older than this are considered orphaned
    #[serde(default = "default_recovery_grace")]
    pub recovery_grace_secs: u64,
    /// Closed ledger entries are kept this long
    #[serde(default = "default_ledger_retention")]
    pub ledger_retention_days: u64,
    /// Superseded predictions are kept this long
    #[serde(default = "default_history_retention")]
    pub history_retention_days: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

fn default_recovery_grace() -> u64 {
    30
}

fn default_ledger_retention() -> u64 {
    7
}

fn default_history_retention() -> u64 {
    30
}

fn default_maintenance_interval() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            recovery_grace_secs: default_recovery_grace(),
            ledger_retention_days: default_ledger_retention(),
            history_retention_days: default_history_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl RetentionConfig {
    pub fn recovery_grace(&self) -> Duration {
        Duration::from_secs(self.recovery_grace_secs)
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance {
            every: Duration::from_secs(self.maintenance_interval_secs),
            recovery_grace: self.recovery_grace(),
            ledger_retention: Duration::from_secs(self.ledger_retention_days * DAY_SECS),
            history_retention: Duration::from_secs(self.history_retention_days * DAY_SECS),
        }
    }
}

impl Config {
    /// Load configuration from the default location, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Database file: explicit setting, else the platform data directory
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("predictor.db")),
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "predictor", "predictor")
        .context("Failed to determine config directory")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "predictor", "predictor")
        .context("Failed to determine data directory")?;
    Ok(base.data_dir().to_path_buf())
}

/// Print the effective configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("Predictor configuration");
    println!("=======================\n");

    println!("Database: {}", config.db_path()?.display());
    println!("  busy timeout: {}ms", config.store.busy_timeout_ms);

    println!("\nEngine:");
    println!("  compute timeout: {}s", config.engine.compute_timeout_secs);
    match config.engine.max_age_secs {
        Some(secs) => println!("  max age: {}s", secs),
        None => println!("  max age: off"),
    }

    println!("\nScheduler:");
    println!("  schedule: {}", config.scheduler.tick_schedule()?);
    println!("  max concurrency: {}", config.scheduler.max_concurrency);
    println!("  max attempts: {}", config.scheduler.max_attempts);
    println!(
        "  backoff: {}ms base, {}ms max, {}ms jitter",
        config.scheduler.base_backoff_ms, config.scheduler.max_backoff_ms, config.scheduler.jitter_ms
    );
    println!("  min confidence: {:.2}", config.scheduler.min_confidence);

    println!("\nRetention:");
    println!("  recovery grace: {}s", config.retention.recovery_grace_secs);
    println!("  ledger: {} days", config.retention.ledger_retention_days);
    println!("  history: {} days", config.retention.history_retention_days);

    println!("\nSource:");
    match &config.source.inputs_path {
        Some(path) => println!("  file: {}", path.display()),
        None => println!("  in-memory (no inputs file configured)"),
    }

    println!("\nModel: {}", config.model.kind);

    Ok(())
}
