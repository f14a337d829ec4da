//! Relocates catalogued files from a flat directory into a `YYYYMMDD`
//! partitioned layout, marking each catalog row moved exactly once.

pub mod catalog;
pub mod config;
pub mod control;
pub mod db;
mod error;
pub mod events;
pub mod file_ops;
pub mod logging;
pub mod migrator;
pub mod time;
pub mod verify;

pub use error::{AppError, AppResult};

use config::Settings;
use file_ops::{PlacementEngine, RetryPolicy};
use migrator::{MigrationOptions, Migrator};

/// Opens the catalog and placement roots described by `settings`.
pub async fn build_migrator(settings: &Settings) -> AppResult<Migrator> {
    let pool = db::open_pool(&settings.catalog).await?;
    let catalog = catalog::Catalog::open(pool, settings.catalog.table.clone()).await?;
    let placement = PlacementEngine::new(
        settings.paths.base.clone(),
        settings.paths.new_base.clone(),
        RetryPolicy {
            max_retries: settings.migrator.max_retries,
            delay: settings.migrator.retry_delay(),
        },
    )
    .await?;
    Ok(Migrator::new(
        catalog,
        placement,
        MigrationOptions::from(&settings.migrator),
    ))
}
