//! Read-only checks over already migrated records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogEntry, CatalogStats, FileRecord};
use crate::file_ops::{PlacementEngine, StorageStats};
use crate::time::now_utc;
use crate::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub record_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total_checked: u64,
    pub verified: u64,
    pub errors: u64,
    pub details: Vec<VerificationIssue>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// Checks up to `sample_size` moved records for a non-empty file at their
/// partitioned path.
///
/// The sample is the first moved records in `(registered_date, id)` order, so
/// it leans toward the oldest partitions rather than covering the moved set
/// uniformly.
pub async fn verify_sample(
    catalog: &Catalog,
    placement: &PlacementEngine,
    sample_size: u32,
) -> AppResult<VerificationReport> {
    let entries = catalog.fetch_moved(sample_size).await?;
    let mut report = VerificationReport::default();

    for entry in &entries {
        report.total_checked += 1;
        let issue = match entry {
            CatalogEntry::Record(record) => check_moved(placement, record).await,
            CatalogEntry::Invalid(invalid) => {
                Some(format!("catalog row cannot be decoded: {}", invalid.reason))
            }
        };

        match issue {
            None => report.verified += 1,
            Some(reason) => {
                report.errors += 1;
                report.details.push(VerificationIssue {
                    record_id: entry.id().to_string(),
                    reason,
                });
            }
        }
    }

    tracing::info!(
        target: "file_migrator",
        event = "verification_finished",
        checked = report.total_checked,
        verified = report.verified,
        errors = report.errors
    );
    Ok(report)
}

async fn check_moved(placement: &PlacementEngine, record: &FileRecord) -> Option<String> {
    let date = record.registered_date;
    if !placement.exists(&record.id, true, date).await {
        return Some(format!(
            "file not found at {}",
            placement.current_path(&record.id, true, date).display()
        ));
    }
    match placement.size(&record.id, true, date).await {
        Some(0) => Some("file is empty".to_string()),
        Some(_) => None,
        None => Some("file size unavailable".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub catalog: CatalogStats,
    pub storage: StorageStats,
    pub progress_percent: f64,
    pub generated_at: DateTime<Utc>,
}

pub async fn status(catalog: &Catalog, placement: &PlacementEngine) -> AppResult<StatusReport> {
    let stats = catalog.aggregate_stats().await?;
    let storage = placement.storage_stats().await?;
    let progress_percent = if stats.total == 0 {
        0.0
    } else {
        stats.moved as f64 / stats.total as f64 * 100.0
    };
    Ok(StatusReport {
        catalog: stats,
        storage,
        progress_percent,
        generated_at: now_utc(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::NewRecord;
    use crate::file_ops::RetryPolicy;
    use chrono::NaiveDate;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::tempdir;

    #[tokio::test]
    async fn flags_missing_and_empty_files() {
        let dir = tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let catalog = Catalog::open(pool, "file_catalog").await.unwrap();
        let placement = PlacementEngine::new(
            dir.path().join("flat"),
            dir.path().join("dated"),
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let partition = placement.ensure_destination_dir(day).await.unwrap();

        for id in ["ok", "empty", "gone"] {
            catalog.insert(&NewRecord::new(id, day, id)).await.unwrap();
            catalog.mark_moved(id, Utc::now()).await.unwrap();
        }
        std::fs::write(partition.join("ok"), b"data").unwrap();
        std::fs::write(partition.join("empty"), b"").unwrap();

        let report = verify_sample(&catalog, &placement, 10).await.unwrap();
        assert_eq!(report.total_checked, 3);
        assert_eq!(report.verified, 1);
        assert_eq!(report.errors, 2);
        assert!(!report.is_clean());
        let mut flagged: Vec<_> = report.details.iter().map(|d| d.record_id.as_str()).collect();
        flagged.sort();
        assert_eq!(flagged, vec!["empty", "gone"]);

        let limited = verify_sample(&catalog, &placement, 1).await.unwrap();
        assert_eq!(limited.total_checked, 1);

        let summary = status(&catalog, &placement).await.unwrap();
        assert_eq!(summary.catalog.moved, 3);
        assert_eq!(summary.progress_percent, 100.0);
        assert_eq!(summary.storage.partitioned_files, 2);
    }

    #[tokio::test]
    async fn undecodable_moved_row_is_reported() {
        let dir = tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let catalog = Catalog::open(pool, "file_catalog").await.unwrap();
        let placement = PlacementEngine::new(
            dir.path().join("flat"),
            dir.path().join("dated"),
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO file_catalog (id, registered_date, filename, moved) VALUES ('odd', 'someday', 'odd', 1)",
        )
        .execute(catalog.pool())
        .await
        .unwrap();

        let report = verify_sample(&catalog, &placement, 10).await.unwrap();
        assert_eq!((report.total_checked, report.errors), (1, 1));
        assert_eq!(report.details[0].record_id, "odd");
        assert!(report.details[0].reason.contains("someday"));
    }
}
