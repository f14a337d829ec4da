//! Migration orchestrator.
//!
//! Drives batches of unmoved catalog records through the placement engine and
//! marks each one moved only after its content hash survived the move. Record
//! level failures are collected on the run; only catalog outages end a run early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogEntry, FileRecord, RecordCursor};
use crate::config::MigratorConfig;
use crate::control::MigrationControl;
use crate::events::{EventSink, MigrationEvent};
use crate::file_ops::{hash_file, HashAlgorithm, PlacementEngine};
use crate::time::{format_date, now_utc};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Full,
    Batch,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nothing at `{base}/{id}`; the catalog is left alone.
    SourceMissing,
    /// The file moved but its digest changed. The row stays unmoved.
    IntegrityMismatch,
    /// The file moved but the compare-and-set did not apply.
    CatalogUpdateFailed,
    /// The placement engine could not relocate the file.
    MoveFailed,
    /// The catalog row itself cannot be decoded; nothing was touched.
    InvalidRecord,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::SourceMissing => "source_missing",
            FailureKind::IntegrityMismatch => "integrity_mismatch",
            FailureKind::CatalogUpdateFailed => "catalog_update_failed",
            FailureKind::MoveFailed => "move_failed",
            FailureKind::InvalidRecord => "invalid_record",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RecordFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub record_id: String,
    pub kind: FailureKind,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

/// Counters and error log for one invocation. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub kind: RunKind,
    pub status: RunStatus,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub batch_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<RecordError>,
    /// Set when a catalog failure ended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<AppError>,
}

impl MigrationRun {
    pub fn new(kind: RunKind, total: u64) -> Self {
        Self {
            kind,
            status: RunStatus::Running,
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            batch_count: 0,
            start_time: now_utc(),
            end_time: None,
            errors: Vec::new(),
            fatal_error: None,
        }
    }

    fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    fn record_failure(&mut self, record_id: &str, failure: &RecordFailure) {
        self.processed += 1;
        self.failed += 1;
        self.errors.push(RecordError {
            record_id: record_id.to_string(),
            kind: failure.kind,
            error_message: failure.message.clone(),
            timestamp: now_utc(),
        });
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.end_time = Some(now_utc());
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(now_utc) - self.start_time
    }

    /// Share of processed records that succeeded, in percent.
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.processed as f64 * 100.0
    }

    /// `processed / total` with the denominator fixed at run start.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
    }

    /// Completed with no record failures.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub batch_size: u32,
    pub batch_delay: Option<Duration>,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_delay: None,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

impl From<&MigratorConfig> for MigrationOptions {
    fn from(config: &MigratorConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
            hash_algorithm: config.hash_algorithm,
        }
    }
}

pub struct Migrator {
    catalog: Catalog,
    placement: PlacementEngine,
    options: MigrationOptions,
}

impl Migrator {
    pub fn new(catalog: Catalog, placement: PlacementEngine, options: MigrationOptions) -> Self {
        Self {
            catalog,
            placement,
            options,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn placement(&self) -> &PlacementEngine {
        &self.placement
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Loops over unmoved records until none remain, `max_files` were
    /// processed, or `control` is cancelled.
    pub async fn run_full<S>(
        &self,
        max_files: Option<u64>,
        sink: &mut S,
        control: &MigrationControl,
    ) -> AppResult<MigrationRun>
    where
        S: EventSink + ?Sized,
    {
        let unmoved = self.catalog.count_unmoved().await?;
        let total = max_files.map_or(unmoved, |cap| cap.min(unmoved));
        let mut run = MigrationRun::new(RunKind::Full, total);
        sink.emit(&MigrationEvent::RunStarted {
            kind: run.kind,
            total,
        });

        let mut cursor: Option<RecordCursor> = None;
        let status = loop {
            if control.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let remaining = max_files.map(|cap| cap.saturating_sub(run.processed));
            if remaining == Some(0) {
                break RunStatus::Completed;
            }
            let size = match remaining {
                Some(left) => left.min(u64::from(self.options.batch_size)) as u32,
                None => self.options.batch_size,
            };

            let batch = match self
                .catalog
                .fetch_unmoved_after(cursor.as_ref(), size)
                .await
            {
                Ok(batch) => batch,
                Err(err) => return Ok(abort(run, err, sink)),
            };
            if batch.is_empty() {
                break RunStatus::Completed;
            }
            cursor = batch.last().map(CatalogEntry::cursor);
            let exhausted = batch.len() < size as usize;

            if self.process_batch(&batch, &mut run, sink, control).await {
                break RunStatus::Cancelled;
            }
            if exhausted {
                break RunStatus::Completed;
            }

            if let Some(delay) = self.options.batch_delay {
                if !control.sleep(delay).await {
                    break RunStatus::Cancelled;
                }
            }
        };

        Ok(finish(run, status, sink))
    }

    /// One fetch and one pass, sized by `batch_size` or the configured default.
    pub async fn run_single_batch<S>(
        &self,
        batch_size: Option<u32>,
        sink: &mut S,
        control: &MigrationControl,
    ) -> AppResult<MigrationRun>
    where
        S: EventSink + ?Sized,
    {
        let size = batch_size
            .filter(|size| *size > 0)
            .unwrap_or(self.options.batch_size);
        let unmoved = self.catalog.count_unmoved().await?;
        let mut run = MigrationRun::new(RunKind::Batch, unmoved.min(u64::from(size)));
        sink.emit(&MigrationEvent::RunStarted {
            kind: run.kind,
            total: run.total,
        });

        let batch = match self.catalog.fetch_unmoved(size).await {
            Ok(batch) => batch,
            Err(err) => return Ok(abort(run, err, sink)),
        };

        let status = if batch.is_empty() {
            RunStatus::Completed
        } else if self.process_batch(&batch, &mut run, sink, control).await {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        Ok(finish(run, status, sink))
    }

    /// Migrates unmoved records registered within `[start, end]`.
    /// Records in range that are already moved count as skipped.
    pub async fn run_range<S>(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        sink: &mut S,
        control: &MigrationControl,
    ) -> AppResult<MigrationRun>
    where
        S: EventSink + ?Sized,
    {
        if start > end {
            return Err(AppError::new(
                "RANGE/INVALID",
                "Start date must not be after end date.",
            )
            .with_context("start", format_date(start))
            .with_context("end", format_date(end)));
        }

        let entries = self.catalog.range(start, end).await?;
        let (pending, already_moved): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|entry| !entry.is_moved());

        let mut run = MigrationRun::new(RunKind::Range, pending.len() as u64);
        run.skipped = already_moved.len() as u64;
        sink.emit(&MigrationEvent::RunStarted {
            kind: run.kind,
            total: run.total,
        });

        let status = if pending.is_empty() {
            RunStatus::Completed
        } else if self.process_batch(&pending, &mut run, sink, control).await {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        Ok(finish(run, status, sink))
    }

    /// Runs every record of `batch` in order. Returns `true` when cancelled part way.
    async fn process_batch<S>(
        &self,
        batch: &[CatalogEntry],
        run: &mut MigrationRun,
        sink: &mut S,
        control: &MigrationControl,
    ) -> bool
    where
        S: EventSink + ?Sized,
    {
        run.batch_count += 1;
        let batch_no = run.batch_count;
        let (succeeded_before, failed_before) = (run.succeeded, run.failed);
        sink.emit(&MigrationEvent::BatchStarted {
            batch: batch_no,
            size: batch.len(),
        });

        let mut cancelled = false;
        for entry in batch {
            if control.is_cancelled() {
                cancelled = true;
                break;
            }
            let outcome = match entry {
                CatalogEntry::Record(record) => self.migrate_one(record).await,
                CatalogEntry::Invalid(invalid) => Err(RecordFailure::new(
                    FailureKind::InvalidRecord,
                    format!("catalog row cannot be migrated: {}", invalid.reason),
                )),
            };
            match outcome {
                Ok(destination) => {
                    run.record_success();
                    sink.emit(&MigrationEvent::RecordMoved {
                        id: entry.id().to_string(),
                        destination,
                    });
                }
                Err(failure) => {
                    run.record_failure(entry.id(), &failure);
                    sink.emit(&MigrationEvent::RecordFailed {
                        id: entry.id().to_string(),
                        kind: failure.kind,
                        reason: failure.message,
                    });
                }
            }
        }

        sink.emit(&MigrationEvent::BatchFinished {
            batch: batch_no,
            succeeded: run.succeeded - succeeded_before,
            failed: run.failed - failed_before,
        });
        sink.emit(&MigrationEvent::Progress {
            processed: run.processed,
            total: run.total,
            percent: run.progress_percent(),
        });
        cancelled
    }

    /// The per-record transition: check, hash, move, re-hash, mark moved.
    pub async fn migrate_one(&self, record: &FileRecord) -> Result<PathBuf, RecordFailure> {
        let date = record.registered_date;
        if !self.placement.exists(&record.id, false, date).await {
            return Err(RecordFailure::new(
                FailureKind::SourceMissing,
                format!(
                    "source file not found: {}",
                    self.placement.source_path(&record.id).display()
                ),
            ));
        }

        let source_hash = self
            .best_effort_hash(&self.placement.source_path(&record.id))
            .await;

        let destination = self
            .placement
            .move_file(&record.id, date)
            .await
            .map_err(|err| {
                let kind = if err.code() == "PLACEMENT/SOURCE_NOT_FOUND" {
                    FailureKind::SourceMissing
                } else {
                    FailureKind::MoveFailed
                };
                RecordFailure::new(kind, err.to_string())
            })?;

        let destination_hash = self.best_effort_hash(&destination).await;
        if let (Some(before), Some(after)) = (&source_hash, &destination_hash) {
            if before != after {
                return Err(RecordFailure::new(
                    FailureKind::IntegrityMismatch,
                    format!(
                        "{} digest changed during move to {} ({} -> {})",
                        self.options.hash_algorithm,
                        destination.display(),
                        before,
                        after
                    ),
                ));
            }
        }

        match self.catalog.mark_moved(&record.id, now_utc()).await {
            Ok(true) => Ok(destination),
            Ok(false) => Err(RecordFailure::new(
                FailureKind::CatalogUpdateFailed,
                format!(
                    "file moved to {} but the catalog row was already marked moved",
                    destination.display()
                ),
            )),
            Err(err) => Err(RecordFailure::new(
                FailureKind::CatalogUpdateFailed,
                format!(
                    "file moved to {} but the catalog update failed: {err}",
                    destination.display()
                ),
            )),
        }
    }

    async fn best_effort_hash(&self, path: &Path) -> Option<String> {
        match hash_file(path, self.options.hash_algorithm).await {
            Ok(digest) => digest,
            Err(err) => {
                tracing::warn!(
                    target: "file_migrator",
                    event = "migration_hash_skipped",
                    path = %path.display(),
                    error = %err
                );
                None
            }
        }
    }
}

fn finish<S>(mut run: MigrationRun, status: RunStatus, sink: &mut S) -> MigrationRun
where
    S: EventSink + ?Sized,
{
    run.finish(status);
    sink.emit(&MigrationEvent::RunFinished {
        kind: run.kind,
        status,
        processed: run.processed,
        succeeded: run.succeeded,
        failed: run.failed,
        skipped: run.skipped,
        duration_ms: run.duration().num_milliseconds(),
    });
    run
}

fn abort<S>(mut run: MigrationRun, err: AppError, sink: &mut S) -> MigrationRun
where
    S: EventSink + ?Sized,
{
    run.finish(RunStatus::Failed);
    sink.emit(&MigrationEvent::RunAborted {
        kind: run.kind,
        code: err.code().to_string(),
        reason: err.to_string(),
    });
    run.fatal_error = Some(err);
    run
}
