use crate::executor::{RunnerOptions, DEFAULT_TIMEOUT_MS};
use crate::query::{
    DEFAULT_ALL_MAX_ENTRIES, DEFAULT_ALL_MAX_FILES, DEFAULT_LATEST_FILES_TO_SCAN,
    DEFAULT_LATEST_MAX_ENTRIES, MAX_LIST_LIMIT,
};
use crate::record_store::StoreOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Overrides `storage.log_dir` when set.
pub const LOG_DIR_ENV: &str = "EXECLOG_DIR";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub runner: RunnerConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    // Defaults to ~/.execlog/logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    pub fsync: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    pub python: String,
    pub shell: String,
    pub default_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let options = RunnerOptions::default();
        Self {
            python: options.python,
            shell: options.shell,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub list_limit: usize,
    pub latest_max_entries: usize,
    pub latest_files_to_scan: usize,
    pub all_max_files: usize,
    pub all_max_entries: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            list_limit: MAX_LIST_LIMIT,
            latest_max_entries: DEFAULT_LATEST_MAX_ENTRIES,
            latest_files_to_scan: DEFAULT_LATEST_FILES_TO_SCAN,
            all_max_files: DEFAULT_ALL_MAX_FILES,
            all_max_entries: DEFAULT_ALL_MAX_ENTRIES,
        }
    }
}

impl Config {
    /// Loads `~/.execlog/config.toml`, writing the defaults there on first use.
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent() {
            fs::create_dir_all(config_dir)
                .with_context(|| format!("failed to create {}", config_dir.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".execlog")
    }

    fn get_config_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }

    /// Environment first, then the config file, then the default location.
    pub fn effective_log_dir(&self) -> PathBuf {
        match std::env::var_os(LOG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self
                .storage
                .log_dir
                .clone()
                .unwrap_or_else(|| Self::base_dir().join("logs")),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            fsync: self.storage.fsync,
        }
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            python: self.runner.python.clone(),
            shell: self.runner.shell.clone(),
            default_timeout_ms: self.runner.default_timeout_ms,
        }
    }
}
