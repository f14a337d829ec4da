use std::path::PathBuf;

use serde::Serialize;

use crate::migrator::{FailureKind, RunKind, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    RunStarted {
        kind: RunKind,
        total: u64,
    },
    BatchStarted {
        batch: u32,
        size: usize,
    },
    RecordMoved {
        id: String,
        destination: PathBuf,
    },
    RecordFailed {
        id: String,
        kind: FailureKind,
        reason: String,
    },
    BatchFinished {
        batch: u32,
        succeeded: u64,
        failed: u64,
    },
    Progress {
        processed: u64,
        total: u64,
        percent: f64,
    },
    RunFinished {
        kind: RunKind,
        status: RunStatus,
        processed: u64,
        succeeded: u64,
        failed: u64,
        skipped: u64,
        duration_ms: i64,
    },
    RunAborted {
        kind: RunKind,
        code: String,
        reason: String,
    },
}

/// Append-only receiver for orchestrator events.
pub trait EventSink {
    fn emit(&mut self, event: &MigrationEvent);
}

pub struct SilentSink;

impl EventSink for SilentSink {
    fn emit(&mut self, _event: &MigrationEvent) {}
}

/// Forwards events as structured `tracing` records.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&mut self, event: &MigrationEvent) {
        match event {
            MigrationEvent::RunStarted { kind, total } => tracing::info!(
                target: "file_migrator",
                event = "migration_run_started",
                kind = ?kind,
                total
            ),
            MigrationEvent::BatchStarted { batch, size } => tracing::info!(
                target: "file_migrator",
                event = "migration_batch_started",
                batch,
                size
            ),
            MigrationEvent::RecordMoved { id, destination } => tracing::debug!(
                target: "file_migrator",
                event = "migration_record_moved",
                id = %id,
                destination = %destination.display()
            ),
            MigrationEvent::RecordFailed { id, kind, reason } => tracing::warn!(
                target: "file_migrator",
                event = "migration_record_failed",
                id = %id,
                kind = kind.as_str(),
                reason = %reason
            ),
            MigrationEvent::BatchFinished {
                batch,
                succeeded,
                failed,
            } => tracing::info!(
                target: "file_migrator",
                event = "migration_batch_finished",
                batch,
                succeeded,
                failed
            ),
            MigrationEvent::Progress {
                processed,
                total,
                percent,
            } => tracing::info!(
                target: "file_migrator",
                event = "migration_progress",
                processed,
                total,
                percent = %format!("{percent:.1}")
            ),
            MigrationEvent::RunFinished {
                kind,
                status,
                processed,
                succeeded,
                failed,
                skipped,
                duration_ms,
            } => tracing::info!(
                target: "file_migrator",
                event = "migration_run_finished",
                kind = ?kind,
                status = ?status,
                processed,
                succeeded,
                failed,
                skipped,
                duration_ms
            ),
            MigrationEvent::RunAborted { kind, code, reason } => tracing::error!(
                target: "file_migrator",
                event = "migration_run_aborted",
                kind = ?kind,
                code = %code,
                reason = %reason
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<MigrationEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, pred: impl Fn(&MigrationEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &MigrationEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_keeps_order() {
        let mut sink = RecordingSink::new();
        sink.emit(&MigrationEvent::BatchStarted { batch: 1, size: 2 });
        sink.emit(&MigrationEvent::BatchFinished {
            batch: 1,
            succeeded: 2,
            failed: 0,
        });
        assert_eq!(sink.events.len(), 2);
        assert!(matches!(sink.events[0], MigrationEvent::BatchStarted { .. }));
        assert_eq!(
            sink.count(|e| matches!(e, MigrationEvent::BatchFinished { .. })),
            1
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(MigrationEvent::RecordFailed {
            id: "F-1".into(),
            kind: FailureKind::SourceMissing,
            reason: "gone".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "record_failed");
        assert_eq!(json["kind"], "source_missing");
    }
}
