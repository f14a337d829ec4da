#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use file_migrator_lib::{
    build_migrator,
    catalog::NewRecord,
    config::Settings,
    migrator::Migrator,
};
use tempfile::TempDir;

/// A catalog file plus flat and partitioned roots inside one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::default();
        settings.catalog.path = dir.path().join("catalog.sqlite3");
        settings.paths.base = dir.path().join("files");
        settings.paths.new_base = dir.path().join("files_by_date");
        settings.migrator.retry_delay_ms = 10;
        settings.logging.file = None;
        std::fs::create_dir_all(&settings.paths.base).unwrap();
        Self { dir, settings }
    }

    pub fn base(&self) -> &Path {
        &self.settings.paths.base
    }

    pub fn new_base(&self) -> &Path {
        &self.settings.paths.new_base
    }

    pub async fn migrator(&self) -> Migrator {
        build_migrator(&self.settings).await.expect("build migrator")
    }

    /// Catalogues `id` and drops a file with `body` into the flat directory.
    pub async fn seed(&self, migrator: &Migrator, id: &str, date: &str, body: &[u8]) {
        let date = day(date);
        migrator
            .catalog()
            .insert(&NewRecord::new(id, date, format!("{id}.bin")))
            .await
            .unwrap();
        std::fs::write(self.base().join(id), body).unwrap();
    }

    pub fn partition(&self, date: &str) -> PathBuf {
        self.new_base().join(date.replace('-', ""))
    }

    pub fn files_in(&self, date: &str) -> usize {
        match std::fs::read_dir(self.partition(date)) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Writes the settings as JSON for the CLI and returns the path.
    pub fn write_config(&self) -> PathBuf {
        let path = self.dir.path().join("settings.json");
        let body = serde_json::to_string_pretty(&self.settings).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }
}

pub fn day(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}
