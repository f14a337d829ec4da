#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::Arc;

use file_migrator_lib::{
    control::MigrationControl,
    events::{EventSink, MigrationEvent, RecordingSink, SilentSink},
    migrator::{FailureKind, RunStatus},
    verify,
};
use tokio::sync::Notify;
use util::{day, Fixture};

#[tokio::test]
async fn two_batches_partition_by_registered_date() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "a", "2024-01-01", b"first").await;
    fx.seed(&migrator, "b", "2024-01-02", b"second").await;
    fx.seed(&migrator, "c", "2024-01-02", b"third").await;
    let control = MigrationControl::new();

    let first = migrator
        .run_single_batch(Some(2), &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!((first.processed, first.succeeded), (2, 2));
    assert_eq!(fx.files_in("2024-01-01"), 1);
    assert_eq!(fx.files_in("2024-01-02"), 1);
    assert_eq!(migrator.catalog().count_unmoved().await.unwrap(), 1);

    let second = migrator
        .run_single_batch(Some(2), &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!((second.processed, second.succeeded), (1, 1));
    assert_eq!(fx.files_in("2024-01-02"), 2);
    assert_eq!(migrator.catalog().count_unmoved().await.unwrap(), 0);
    assert_eq!(std::fs::read_dir(fx.base()).unwrap().count(), 0);
    assert_eq!(
        std::fs::read(fx.partition("2024-01-02").join("c")).unwrap(),
        b"third"
    );

    let report = verify::verify_sample(migrator.catalog(), migrator.placement(), 10)
        .await
        .unwrap();
    assert_eq!(report.total_checked, 3);
    assert_eq!(report.verified, 3);
    assert!(report.is_clean());
}

#[tokio::test]
async fn full_run_resumes_where_a_capped_run_stopped() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    for (i, date) in ["2024-02-01", "2024-02-01", "2024-02-03", "2024-02-05", "2024-02-07"]
        .iter()
        .enumerate()
    {
        fx.seed(&migrator, &format!("f{i}"), date, format!("body {i}").as_bytes())
            .await;
    }
    let control = MigrationControl::new();

    let capped = migrator
        .run_full(Some(2), &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!(capped.total, 2);
    assert_eq!(capped.processed, 2);
    assert!(capped.is_success());
    assert_eq!(fx.files_in("2024-02-01"), 2);

    let rest = migrator
        .run_full(None, &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!(rest.total, 3);
    assert_eq!(rest.succeeded, 3);
    assert_eq!(rest.progress_percent(), 100.0);

    let stats = migrator.catalog().aggregate_stats().await.unwrap();
    assert_eq!((stats.total, stats.moved, stats.unmoved), (5, 5, 0));

    let again = migrator
        .run_full(None, &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!(again.total, 0);
    assert_eq!(again.processed, 0);
    assert_eq!(again.status, RunStatus::Completed);
}

#[tokio::test]
async fn missing_source_is_recorded_and_left_unmoved() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "present", "2024-03-01", b"here").await;
    migrator
        .catalog()
        .insert(&file_migrator_lib::catalog::NewRecord::new(
            "ghost",
            day("2024-03-01"),
            "ghost.bin",
        ))
        .await
        .unwrap();

    let mut sink = RecordingSink::new();
    let run = migrator
        .run_full(None, &mut sink, &MigrationControl::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!((run.succeeded, run.failed), (1, 1));
    assert!(!run.is_success());
    assert_eq!(run.errors[0].record_id, "ghost");
    assert_eq!(run.errors[0].kind, FailureKind::SourceMissing);
    assert_eq!(
        sink.count(|e| matches!(e, MigrationEvent::RecordFailed { .. })),
        1
    );

    let ghost = migrator.catalog().get("ghost").await.unwrap().unwrap();
    assert!(!ghost.moved);
    assert!(ghost.moved_at.is_none());
}

#[tokio::test]
async fn range_run_skips_already_moved_records() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "early", "2024-04-01", b"1").await;
    fx.seed(&migrator, "mid", "2024-04-10", b"2").await;
    fx.seed(&migrator, "late", "2024-04-20", b"3").await;
    let control = MigrationControl::new();

    let run = migrator
        .run_range(day("2024-04-01"), day("2024-04-10"), &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!((run.total, run.succeeded, run.skipped), (2, 2, 0));
    assert!(fx.base().join("late").exists());

    let again = migrator
        .run_range(day("2024-04-01"), day("2024-04-20"), &mut SilentSink, &control)
        .await
        .unwrap();
    assert_eq!((again.total, again.succeeded, again.skipped), (1, 1, 2));

    let err = migrator
        .run_range(day("2024-04-20"), day("2024-04-01"), &mut SilentSink, &control)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RANGE/INVALID");
}

#[tokio::test]
async fn cleanup_removes_only_empty_partitions() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "kept", "2024-01-01", b"data").await;
    migrator
        .run_full(None, &mut SilentSink, &MigrationControl::new())
        .await
        .unwrap();
    std::fs::create_dir_all(fx.partition("2024-01-05")).unwrap();

    let removed = migrator.placement().prune_empty_date_dirs().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!fx.partition("2024-01-05").exists());
    assert!(fx.partition("2024-01-01").join("kept").exists());

    assert_eq!(migrator.placement().prune_empty_date_dirs().await.unwrap(), 0);
}

/// Cancels as soon as the first record lands.
struct CancelAfterFirst {
    control: MigrationControl,
}

impl EventSink for CancelAfterFirst {
    fn emit(&mut self, event: &MigrationEvent) {
        if matches!(event, MigrationEvent::RecordMoved { .. }) {
            self.control.cancel();
        }
    }
}

#[tokio::test]
async fn cancellation_stops_between_records() {
    let mut fx = Fixture::new();
    fx.settings.migrator.batch_size = 2;
    let migrator = fx.migrator().await;
    for i in 0..4 {
        fx.seed(&migrator, &format!("r{i}"), "2024-05-01", b"x").await;
    }
    let control = MigrationControl::new();
    let mut sink = CancelAfterFirst {
        control: control.clone(),
    };

    let run = migrator.run_full(None, &mut sink, &control).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.processed, 1);
    assert_eq!(run.batch_count, 1);
    assert!(run.end_time.is_some());
    assert_eq!(migrator.catalog().count_unmoved().await.unwrap(), 3);

    let resumed = migrator
        .run_full(None, &mut SilentSink, &MigrationControl::new())
        .await
        .unwrap();
    assert_eq!(resumed.succeeded, 3);
    assert_eq!(fx.files_in("2024-05-01"), 4);
}

#[tokio::test]
async fn catalog_outage_at_start_prevents_the_run() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "only", "2024-06-01", b"x").await;
    migrator.catalog().pool().close().await;

    let err = migrator
        .run_full(None, &mut SilentSink, &MigrationControl::new())
        .await
        .unwrap_err();
    assert!(err.is_connection_failure());
    assert!(fx.base().join("only").exists());
}

/// Records every event and signals once the first batch is done.
struct SignalFirstBatch {
    inner: RecordingSink,
    first_batch: Arc<Notify>,
}

impl EventSink for SignalFirstBatch {
    fn emit(&mut self, event: &MigrationEvent) {
        if matches!(event, MigrationEvent::BatchFinished { batch: 1, .. }) {
            self.first_batch.notify_one();
        }
        self.inner.emit(event);
    }
}

#[tokio::test]
async fn catalog_lost_between_batches_fails_the_run() {
    let mut fx = Fixture::new();
    fx.settings.migrator.batch_size = 1;
    fx.settings.migrator.batch_delay_ms = 200;
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "first", "2024-06-01", b"1").await;
    fx.seed(&migrator, "second", "2024-06-02", b"2").await;
    fx.seed(&migrator, "third", "2024-06-03", b"3").await;

    let first_batch = Arc::new(Notify::new());
    let mut sink = SignalFirstBatch {
        inner: RecordingSink::new(),
        first_batch: first_batch.clone(),
    };
    let pool = migrator.catalog().pool().clone();
    let control = MigrationControl::new();

    let (run, dropped) = tokio::join!(
        migrator.run_full(None, &mut sink, &control),
        async {
            first_batch.notified().await;
            sqlx::query("DROP TABLE file_catalog").execute(&pool).await
        }
    );
    dropped.unwrap();
    let run = run.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!((run.total, run.processed, run.succeeded), (3, 1, 1));
    assert!(run.fatal_error.as_ref().is_some_and(|err| err.is_query_failure()));
    assert!(run.end_time.is_some());
    assert!(matches!(
        sink.inner.events.last(),
        Some(MigrationEvent::RunAborted { .. })
    ));
    assert!(fx.partition("2024-06-01").join("first").exists());
    assert!(fx.base().join("second").exists());
    assert!(fx.base().join("third").exists());
}

#[tokio::test]
async fn undecodable_catalog_row_fails_alone() {
    let fx = Fixture::new();
    let migrator = fx.migrator().await;
    fx.seed(&migrator, "good1", "2024-01-02", b"one").await;
    fx.seed(&migrator, "good2", "2024-01-03", b"two").await;
    sqlx::query(
        "INSERT INTO file_catalog (id, registered_date, filename) VALUES ('bad', '01/01/2024', 'bad.bin')",
    )
    .execute(migrator.catalog().pool())
    .await
    .unwrap();
    std::fs::write(fx.base().join("bad"), b"stranded").unwrap();

    let run = migrator
        .run_full(None, &mut SilentSink, &MigrationControl::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!((run.total, run.succeeded, run.failed), (3, 2, 1));
    assert_eq!(run.errors[0].record_id, "bad");
    assert_eq!(run.errors[0].kind, FailureKind::InvalidRecord);
    assert!(run.errors[0].error_message.contains("01/01/2024"));
    assert_eq!(migrator.catalog().count_unmoved().await.unwrap(), 1);
    assert!(fx.partition("2024-01-02").join("good1").exists());
    assert!(fx.partition("2024-01-03").join("good2").exists());
    assert!(fx.base().join("bad").exists());

    let batch = migrator
        .run_single_batch(Some(10), &mut SilentSink, &MigrationControl::new())
        .await
        .unwrap();
    assert_eq!((batch.processed, batch.failed), (1, 1));
}
