use std::path::Path;

use anyhow::Context;
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

pub const LOG_FILTER_ENV: &str = "FILE_MIGRATOR_LOG";
pub const LOG_MAX_SIZE_ENV: &str = "FILE_MIGRATOR_LOG_MAX_SIZE_BYTES";
pub const LOG_MAX_FILES_ENV: &str = "FILE_MIGRATOR_LOG_MAX_FILES";

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub max_size_bytes: u64,
    pub max_files: usize,
}

impl Rotation {
    /// Config values, overridden by the rotation env vars when they parse.
    pub fn resolve(config: &LoggingConfig) -> Self {
        let env_u64 = |key: &str| {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
        };
        Self {
            max_size_bytes: env_u64(LOG_MAX_SIZE_ENV).unwrap_or(config.max_size_bytes).max(1),
            max_files: env_u64(LOG_MAX_FILES_ENV)
                .map(|n| n as usize)
                .unwrap_or(config.max_files)
                .max(1),
        }
    }
}

fn default_filter(level: &str) -> String {
    let level = level.to_ascii_lowercase();
    format!("file_migrator={level},file_migrator_lib={level},sqlx=warn")
}

/// Installs the process-wide subscriber: human readable lines on stderr and,
/// when `config.file` is set, rotating JSON lines on disk.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> anyhow::Result<LoggingGuard> {
    let _ = tracing_log::LogTracer::init();

    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = std::env::var(LOG_FILTER_ENV).unwrap_or_else(|_| default_filter(level));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(UtcTime::rfc_3339())
        .boxed();

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let writer = rotating_writer(path, Rotation::resolve(config))?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(non_blocking)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default()
        .with(EnvFilter::new(filter))
        .with(console)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("install tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}

fn rotating_writer(path: &Path, rotation: Rotation) -> anyhow::Result<FileRotate<AppendCount>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    Ok(FileRotate::new(
        path,
        AppendCount::new(rotation.max_files),
        ContentLimit::Bytes(rotation.max_size_bytes as usize),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}
