use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::time::Duration;

use crate::config::CatalogConfig;
use crate::{AppError, AppResult};

/// Open the catalog pool described by `config`.
///
/// Failures here are always connection failures: nothing has been queried yet.
pub async fn open_pool(config: &CatalogConfig) -> AppResult<Pool<Sqlite>> {
    if config.create_if_missing {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    target: "file_migrator",
                    error = %e,
                    event = "catalog_dir_create_failed",
                    path = %parent.display()
                );
                AppError::new(AppError::CATALOG_CONNECTION, "Unable to create catalog directory.")
                    .with_context("path", parent.display().to_string())
                    .with_cause(e)
            })?;
        }
    }
    tracing::info!(target: "file_migrator", event = "db_path", path = %config.path.display());

    let opts = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(config.create_if_missing)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.busy_timeout_ms.max(1_000)))
        .connect_with(opts)
        .await
        .map_err(|err| {
            AppError::new(AppError::CATALOG_CONNECTION, "Unable to open the catalog database.")
                .with_context("operation", "open_pool")
                .with_context("path", config.path.display().to_string())
                .with_cause(err)
        })?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "file_migrator",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "file_migrator",
            event = "db_open_warning",
            msg = "journal_mode != WAL; running with reduced crash safety"
        );
    }
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub async fn run_in_tx<R, E, F>(pool: &Pool<Sqlite>, f: F) -> Result<R, E>
where
    E: From<sqlx::Error>,
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<R, E>>,
{
    use tracing::{debug, error, warn};

    let mut tx = pool.begin().await.map_err(E::from)?;
    debug!(target: "file_migrator", event = "db_tx_begin");
    match f(&mut *tx).await {
        Ok(val) => {
            tx.commit().await.map_err(E::from)?;
            debug!(target: "file_migrator", event = "db_tx_commit");
            Ok(val)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                error!(target: "file_migrator", event = "db_tx_rollback_failed", error = %rb);
            } else {
                warn!(target: "file_migrator", event = "db_tx_rollback");
            }
            Err(e)
        }
    }
}
