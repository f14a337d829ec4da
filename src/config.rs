//! Settings file loading and validation.
//!
//! Settings are read once at startup from a JSON document. Every section and
//! every field has a default, so a partial file is enough to override what an
//! operator cares about.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::file_ops::HashAlgorithm;
use crate::AppError;

pub const DEFAULT_CONFIG_PATH: &str = "config/settings.json";
pub const CONFIG_PATH_ENV: &str = "FILE_MIGRATOR_CONFIG";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("table name pattern to compile")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        let code = match &err {
            ConfigError::NotFound(_) => "CONFIG/NOT_FOUND",
            ConfigError::Read { .. } => "CONFIG/READ_FAILED",
            ConfigError::Parse { .. } => "CONFIG/PARSE_FAILED",
            ConfigError::Invalid { .. } => "CONFIG/INVALID",
        };
        let mut app = AppError::new(code, err.to_string());
        match err {
            ConfigError::NotFound(path) => {
                app = app.with_context("path", path.display().to_string());
            }
            ConfigError::Read { path, source } => {
                app = app
                    .with_context("path", path.display().to_string())
                    .with_cause(source);
            }
            ConfigError::Parse { path, source } => {
                app = app
                    .with_context("path", path.display().to_string())
                    .with_cause(source);
            }
            ConfigError::Invalid { field, .. } => {
                app = app.with_context("field", field);
            }
        }
        app
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub catalog: CatalogConfig,
    pub paths: PathsConfig,
    pub migrator: MigratorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub path: PathBuf,
    pub table: String,
    pub create_if_missing: bool,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/catalog.sqlite3"),
            table: "file_catalog".to_string(),
            create_if_missing: true,
            max_connections: 4,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Flat directory that currently holds every unmoved file by id.
    pub base: PathBuf,
    /// Root of the date partitioned layout.
    pub new_base: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base: PathBuf::from("data/files"),
            new_base: PathBuf::from("data/files_by_date"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigratorConfig {
    pub batch_size: u32,
    /// Pause between batches. Zero disables pacing.
    pub batch_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay_ms: 0,
            max_retries: 3,
            retry_delay_ms: 1_000,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl MigratorConfig {
    pub fn batch_delay(&self) -> Option<Duration> {
        (self.batch_delay_ms > 0).then(|| Duration::from_millis(self.batch_delay_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    /// Rotating JSON log file. Console only when absent.
    pub file: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("logs/file_migrator.log")),
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl Settings {
    /// Read and validate the settings file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = Self::read(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read without validating. Useful for commands that only need the catalog.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.paths.base.is_dir() {
            return Err(ConfigError::invalid(
                "paths.base",
                format!("directory does not exist: {}", self.paths.base.display()),
            ));
        }
        if self.paths.base == self.paths.new_base {
            return Err(ConfigError::invalid(
                "paths.new_base",
                "must differ from paths.base",
            ));
        }
        if self.migrator.batch_size == 0 {
            return Err(ConfigError::invalid(
                "migrator.batch_size",
                "must be greater than zero",
            ));
        }
        if self.catalog.max_connections == 0 {
            return Err(ConfigError::invalid(
                "catalog.max_connections",
                "must be greater than zero",
            ));
        }
        if !TABLE_NAME.is_match(&self.catalog.table) {
            return Err(ConfigError::invalid(
                "catalog.table",
                format!("'{}' is not a plain SQL identifier", self.catalog.table),
            ));
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("expected one of {}", LOG_LEVELS.join("|")),
            ));
        }
        Ok(())
    }
}

/// True when `name` can be spliced into SQL as a table name.
pub fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME.is_match(name)
}

/// CLI flag first, then `FILE_MIGRATOR_CONFIG`, then the default location.
pub fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .or_else(user_config_path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// `<config dir>/file-migrator/settings.json`, used only when the working
/// directory has no settings file of its own.
fn user_config_path() -> Option<PathBuf> {
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        return None;
    }
    dirs::config_dir()
        .map(|dir| dir.join("file-migrator").join("settings.json"))
        .filter(|path| path.exists())
}
