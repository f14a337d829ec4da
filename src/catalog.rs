//! Catalog store: the ledger of tracked files and their moved state.
//!
//! All ordering is `(registered_date, id)` ascending where the date is the
//! first ten characters of the stored text, so rows that carry a time suffix
//! still group with their calendar day.

use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::is_valid_table_name;
use crate::db::run_in_tx;
use crate::time::{format_date, format_timestamp, parse_registered_date, parse_timestamp};
use crate::{AppError, AppResult};

const DATE_KEY: &str = "substr(registered_date, 1, 10)";
const COLUMNS: &str =
    "id, registered_date, substr(registered_date, 1, 10) AS date_key, filename, moved, moved_at";
/// Matches date keys shaped like `YYYY-MM-DD`; stats ignore everything else.
const DATE_KEY_SHAPE: &str = "'[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]'";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub registered_date: NaiveDate,
    pub filename: String,
    pub moved: bool,
    pub moved_at: Option<DateTime<Utc>>,
}

/// Fields an external registrar supplies. New rows always start unmoved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub id: String,
    pub registered_date: NaiveDate,
    pub filename: String,
}

impl NewRecord {
    pub fn new(id: impl Into<String>, registered_date: NaiveDate, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            registered_date,
            filename: filename.into(),
        }
    }
}

/// A stored row whose fields cannot be turned into a [`FileRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    pub id: String,
    /// The first ten characters of the stored `registered_date`, as SQL sees them.
    pub date_key: String,
    pub moved: bool,
    pub reason: String,
}

/// One fetched row. Rows are decoded independently so a single bad row
/// never hides the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CatalogEntry {
    Record(FileRecord),
    Invalid(InvalidRecord),
}

impl CatalogEntry {
    pub fn id(&self) -> &str {
        match self {
            CatalogEntry::Record(record) => &record.id,
            CatalogEntry::Invalid(invalid) => &invalid.id,
        }
    }

    pub fn is_moved(&self) -> bool {
        match self {
            CatalogEntry::Record(record) => record.moved,
            CatalogEntry::Invalid(invalid) => invalid.moved,
        }
    }

    pub fn record(&self) -> Option<&FileRecord> {
        match self {
            CatalogEntry::Record(record) => Some(record),
            CatalogEntry::Invalid(_) => None,
        }
    }

    /// Keyset position just past this row.
    pub fn cursor(&self) -> RecordCursor {
        match self {
            CatalogEntry::Record(record) => RecordCursor {
                date_key: format_date(record.registered_date),
                id: record.id.clone(),
            },
            CatalogEntry::Invalid(invalid) => RecordCursor {
                date_key: invalid.date_key.clone(),
                id: invalid.id.clone(),
            },
        }
    }
}

/// Keyset position: everything strictly after `(date_key, id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCursor {
    pub date_key: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total: u64,
    pub moved: u64,
    pub unmoved: u64,
    pub earliest_date: Option<NaiveDate>,
    pub latest_date: Option<NaiveDate>,
    pub first_moved_at: Option<DateTime<Utc>>,
    pub last_moved_at: Option<DateTime<Utc>>,
}

struct TxError(AppError);

impl From<sqlx::Error> for TxError {
    fn from(err: sqlx::Error) -> Self {
        TxError(AppError::catalog(err, "transaction"))
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
    table: String,
}

impl Catalog {
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> AppResult<Self> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(
                AppError::new("CATALOG/INVALID_TABLE", "Catalog table name is not a plain identifier.")
                    .with_context("table", table),
            );
        }
        Ok(Self { pool, table })
    }

    /// Opens the catalog and makes sure the table and its batch index exist.
    pub async fn open(pool: SqlitePool, table: impl Into<String>) -> AppResult<Self> {
        let catalog = Self::new(pool, table)?;
        catalog.ensure_schema().await?;
        Ok(catalog)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_schema(&self) -> AppResult<()> {
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                registered_date TEXT NOT NULL,
                filename TEXT NOT NULL,
                moved INTEGER NOT NULL DEFAULT 0,
                moved_at TEXT NULL,
                created_at TEXT,
                updated_at TEXT
            )",
            t = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {t}_moved_date_idx ON {t} (moved, {DATE_KEY}, id)",
            t = self.table
        );
        for sql in [create_table, create_index] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|err| AppError::catalog(err, "ensure_schema"))?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "ping"))?;
        Ok(())
    }

    /// The first `limit` unmoved rows in `(registered_date, id)` order.
    pub async fn fetch_unmoved(&self, limit: u32) -> AppResult<Vec<CatalogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {t}
             WHERE moved = 0
             ORDER BY {DATE_KEY} ASC, id ASC
             LIMIT ?1",
            t = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "fetch_unmoved"))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Like [`Catalog::fetch_unmoved`] but continues strictly after `cursor`.
    pub async fn fetch_unmoved_after(
        &self,
        cursor: Option<&RecordCursor>,
        limit: u32,
    ) -> AppResult<Vec<CatalogEntry>> {
        let Some(cursor) = cursor else {
            return self.fetch_unmoved(limit).await;
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM {t}
             WHERE moved = 0
               AND ({DATE_KEY} > ?1 OR ({DATE_KEY} = ?1 AND id > ?2))
             ORDER BY {DATE_KEY} ASC, id ASC
             LIMIT ?3",
            t = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(&cursor.date_key)
            .bind(&cursor.id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "fetch_unmoved_after"))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Moved records in `(registered_date, id)` order. Earliest dates come first.
    pub async fn fetch_moved(&self, limit: u32) -> AppResult<Vec<CatalogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {t}
             WHERE moved = 1
             ORDER BY {DATE_KEY} ASC, id ASC
             LIMIT ?1",
            t = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "fetch_moved"))?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<FileRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {t} WHERE id = ?1",
            t = self.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "get"))?;
        match row.as_ref().map(entry_from_row).transpose()? {
            None => Ok(None),
            Some(CatalogEntry::Record(record)) => Ok(Some(record)),
            Some(CatalogEntry::Invalid(invalid)) => Err(AppError::new(
                AppError::CATALOG_QUERY,
                "Record cannot be decoded.",
            )
            .with_context("operation", "get")
            .with_context("id", invalid.id)
            .with_context("reason", invalid.reason)),
        }
    }

    /// Registers a record, or refreshes date and filename of an existing one.
    pub async fn insert(&self, record: &NewRecord) -> AppResult<()> {
        let now = format_timestamp(crate::time::now_utc());
        let sql = format!(
            "INSERT INTO {t} (id, registered_date, filename, moved, moved_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
               registered_date = excluded.registered_date,
               filename = excluded.filename,
               updated_at = excluded.updated_at",
            t = self.table
        );
        sqlx::query(&sql)
            .bind(&record.id)
            .bind(format_date(record.registered_date))
            .bind(&record.filename)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "insert"))?;
        Ok(())
    }

    /// Compare-and-set `moved = 1`. `Ok(false)` when the row was already moved or is unknown.
    pub async fn mark_moved(&self, id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let sql = format!(
            "UPDATE {t} SET moved = 1, moved_at = ?1, updated_at = ?1
             WHERE id = ?2 AND moved = 0",
            t = self.table
        );
        let stamp = format_timestamp(at);
        let id = id.to_string();
        let affected = run_in_tx(&self.pool, move |conn| {
            Box::pin(async move {
                let result = sqlx::query(&sql)
                    .bind(&stamp)
                    .bind(&id)
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, TxError>(result.rows_affected())
            })
        })
        .await
        .map_err(|TxError(err)| err.with_context("operation", "mark_moved"))?;
        Ok(affected == 1)
    }

    /// Inclusive date range scan in `(registered_date, id)` order, moved or not.
    pub async fn range(&self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<CatalogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {t}
             WHERE {DATE_KEY} BETWEEN ?1 AND ?2
             ORDER BY {DATE_KEY} ASC, id ASC",
            t = self.table
        );
        let mut rows = sqlx::query(&sql)
            .bind(format_date(start))
            .bind(format_date(end))
            .fetch(&self.pool);

        let mut entries = Vec::new();
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|err| AppError::catalog(err, "range"))?
        {
            entries.push(entry_from_row(&row)?);
        }
        Ok(entries)
    }

    pub async fn count_unmoved(&self) -> AppResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {t} WHERE moved = 0", t = self.table);
        let (count,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "count_unmoved"))?;
        Ok(count.max(0) as u64)
    }

    /// Reporting aggregate. Never drives control flow.
    pub async fn aggregate_stats(&self) -> AppResult<CatalogStats> {
        let sql = format!(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN moved = 1 THEN 1 ELSE 0 END), 0) AS moved,
                    MIN(CASE WHEN {DATE_KEY} GLOB {DATE_KEY_SHAPE} THEN {DATE_KEY} END) AS earliest,
                    MAX(CASE WHEN {DATE_KEY} GLOB {DATE_KEY_SHAPE} THEN {DATE_KEY} END) AS latest,
                    MIN(moved_at) AS first_moved,
                    MAX(moved_at) AS last_moved
             FROM {t}",
            t = self.table
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| AppError::catalog(err, "aggregate_stats"))?;

        let decode = |err: sqlx::Error| AppError::catalog(err, "aggregate_stats");
        let total: i64 = row.try_get("total").map_err(decode)?;
        let moved: i64 = row.try_get("moved").map_err(decode)?;
        let earliest: Option<String> = row.try_get("earliest").map_err(decode)?;
        let latest: Option<String> = row.try_get("latest").map_err(decode)?;
        let first_moved: Option<String> = row.try_get("first_moved").map_err(decode)?;
        let last_moved: Option<String> = row.try_get("last_moved").map_err(decode)?;

        let total = total.max(0) as u64;
        let moved = moved.max(0) as u64;
        Ok(CatalogStats {
            total,
            moved,
            unmoved: total.saturating_sub(moved),
            earliest_date: earliest.as_deref().and_then(parse_registered_date),
            latest_date: latest.as_deref().and_then(parse_registered_date),
            first_moved_at: first_moved.as_deref().and_then(parse_timestamp),
            last_moved_at: last_moved.as_deref().and_then(parse_timestamp),
        })
    }
}

fn entry_from_row(row: &SqliteRow) -> AppResult<CatalogEntry> {
    let decode = |err: sqlx::Error| AppError::catalog(err, "decode_record");
    let id: String = row.try_get("id").map_err(decode)?;
    let moved = row.try_get::<i64, _>("moved").map_err(decode)? != 0;
    let date_key: Option<String> = row.try_get("date_key").map_err(decode)?;

    let invalid = |reason: String| {
        CatalogEntry::Invalid(InvalidRecord {
            id: id.clone(),
            date_key: date_key.clone().unwrap_or_default(),
            moved,
            reason,
        })
    };

    let raw_date: String = match row.try_get("registered_date") {
        Ok(raw) => raw,
        Err(err) => return Ok(invalid(format!("registered_date is not text: {err}"))),
    };
    let Some(registered_date) = parse_registered_date(&raw_date) else {
        return Ok(invalid(format!("unreadable registered date '{raw_date}'")));
    };
    let filename: String = match row.try_get("filename") {
        Ok(filename) => filename,
        Err(err) => return Ok(invalid(format!("filename is not text: {err}"))),
    };
    let moved_at: Option<String> = row.try_get("moved_at").ok().flatten();

    Ok(CatalogEntry::Record(FileRecord {
        id,
        registered_date,
        filename,
        moved,
        moved_at: moved_at.as_deref().and_then(parse_timestamp),
    }))
}
