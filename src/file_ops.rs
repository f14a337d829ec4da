//! Placement engine: maps catalog records onto the date partitioned layout.
//!
//! Flat source paths are `{base}/{id}`; partitioned paths are
//! `{new_base}/{YYYYMMDD}/{id}`, or `{stem}_{n}.{ext}` when a name is taken.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::{AppError, AppResult};

const HASH_CHUNK_SIZE: usize = 4096;
const MAX_NAME_SUFFIX: u32 = 99_999;
const STAGING_PREFIX: &str = ".fmmove-";

#[cfg(test)]
thread_local! {
    static FORCE_COPY_FALLBACK: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
    static LAST_MOVE_USED_COPY: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
    static CORRUPT_AFTER_MOVE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
pub fn __force_copy_fallback(value: bool) {
    FORCE_COPY_FALLBACK.with(|flag| flag.set(value));
}

#[cfg(test)]
pub fn __take_last_move_used_copy() -> bool {
    LAST_MOVE_USED_COPY.with(|flag| flag.replace(false))
}

/// Appends garbage to the next moved file so destination hashes diverge.
#[cfg(test)]
pub fn __corrupt_next_move(value: bool) {
    CORRUPT_AFTER_MOVE.with(|flag| flag.set(value));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha1,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported hash algorithm: {0}")]
pub struct UnknownHashAlgorithm(pub String);

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha1 => "sha1",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = UnknownHashAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            other => Err(UnknownHashAlgorithm(other.to_string())),
        }
    }
}

enum ContentHasher {
    Sha256(Sha256),
    Sha1(Sha1),
}

impl ContentHasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => ContentHasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha1 => ContentHasher::Sha1(Sha1::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            ContentHasher::Sha256(h) => h.update(chunk),
            ContentHasher::Sha1(h) => h.update(chunk),
        }
    }

    fn finish(self) -> String {
        match self {
            ContentHasher::Sha256(h) => format!("{:x}", h.finalize()),
            ContentHasher::Sha1(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Streams `path` through `algorithm`. `Ok(None)` when the file is absent.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> AppResult<Option<String>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AppError::from(err)
                .with_context("operation", "hash_open")
                .with_context("path", path.display().to_string()))
        }
    };

    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "hash_read")
                .with_context("path", path.display().to_string())
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(Some(hasher.finish()))
}

/// Returns `dir/name` when free, otherwise the first free `stem_N.ext` for N = 1, 2, ...
pub fn unique_name(dir: &Path, name: &str) -> AppResult<PathBuf> {
    let direct = dir.join(name);
    if !path_taken(&direct)? {
        return Ok(direct);
    }

    let (stem, extension) = split_name(name);
    for suffix in 1..=MAX_NAME_SUFFIX {
        let candidate = match extension {
            Some(ext) => dir.join(format!("{stem}_{suffix}.{ext}")),
            None => dir.join(format!("{stem}_{suffix}")),
        };
        if !path_taken(&candidate)? {
            return Ok(candidate);
        }
    }

    Err(AppError::new(
        "PLACEMENT/NAME_EXHAUSTED",
        "Unable to resolve a unique filename for the destination.",
    )
    .with_context("dir", dir.display().to_string())
    .with_context("name", name))
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

fn path_taken(path: &Path) -> AppResult<bool> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::from(err)
            .with_context("operation", "unique_name")
            .with_context("path", path.display().to_string())),
    }
}

/// The `YYYYMMDD` partition name for a registered date.
pub fn partition_name(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub flat_files: u64,
    pub flat_bytes: u64,
    pub date_dirs: u64,
    pub partitioned_files: u64,
    pub partitioned_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PlacementEngine {
    base: PathBuf,
    new_base: PathBuf,
    retry: RetryPolicy,
}

impl PlacementEngine {
    /// Builds the engine, creating both roots when missing.
    pub async fn new(
        base: impl Into<PathBuf>,
        new_base: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let engine = Self {
            base: base.into(),
            new_base: new_base.into(),
            retry,
        };
        for root in [&engine.base, &engine.new_base] {
            fs::create_dir_all(root).await.map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_root")
                    .with_context("path", root.display().to_string())
            })?;
        }
        Ok(engine)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn new_base(&self) -> &Path {
        &self.new_base
    }

    pub fn source_path(&self, id: &str) -> PathBuf {
        self.base.join(id)
    }

    pub fn destination_dir(&self, date: NaiveDate) -> PathBuf {
        self.new_base.join(partition_name(date))
    }

    pub async fn ensure_destination_dir(&self, date: NaiveDate) -> AppResult<PathBuf> {
        let dir = self.destination_dir(date);
        fs::create_dir_all(&dir).await.map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ensure_destination_dir")
                .with_context("path", dir.display().to_string())
        })?;
        Ok(dir)
    }

    /// Where a record is expected to live given its moved flag.
    pub fn current_path(&self, id: &str, moved: bool, date: NaiveDate) -> PathBuf {
        if moved {
            self.destination_dir(date).join(id)
        } else {
            self.source_path(id)
        }
    }

    /// Moves `{base}/{id}` into its date partition and returns the final path.
    pub async fn move_file(&self, id: &str, date: NaiveDate) -> AppResult<PathBuf> {
        let source = self.source_path(id);
        if !fs::try_exists(&source).await.unwrap_or(false) {
            return Err(AppError::new(
                "PLACEMENT/SOURCE_NOT_FOUND",
                "Source file does not exist.",
            )
            .with_context("id", id)
            .with_context("path", source.display().to_string()));
        }

        let dir = self.ensure_destination_dir(date).await?;
        let target = unique_name(&dir, id)?;
        if target != dir.join(id) {
            tracing::info!(
                target: "file_migrator",
                event = "placement_name_collision",
                id = %id,
                resolved = %target.display()
            );
        }

        self.relocate(&source, &target).await.map_err(|err| {
            err.with_context("id", id)
                .with_context("target", target.display().to_string())
        })?;

        #[cfg(test)]
        {
            if CORRUPT_AFTER_MOVE.with(|flag| flag.replace(false)) {
                use tokio::io::AsyncWriteExt;
                let mut handle = fs::OpenOptions::new().append(true).open(&target).await?;
                handle.write_all(b"corrupted").await?;
            }
        }

        Ok(target)
    }

    async fn relocate(&self, source: &Path, target: &Path) -> AppResult<()> {
        #[cfg(test)]
        {
            if FORCE_COPY_FALLBACK.with(|flag| flag.get()) {
                return copy_into_place(source, target, None).await;
            }
        }

        let mut attempt = 0u32;
        loop {
            ensure_vacant(target)?;
            match fs::rename(source, target).await {
                Ok(()) => return Ok(()),
                Err(err) if is_transient(&err) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        target: "file_migrator",
                        event = "placement_rename_retry",
                        attempt,
                        max_retries = self.retry.max_retries,
                        error = %err
                    );
                    sleep(self.retry.delay).await;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "file_migrator",
                        event = "placement_copy_fallback",
                        error = %err
                    );
                    return copy_into_place(source, target, Some(err)).await;
                }
            }
        }
    }

    /// Hashes the record at its expected location.
    pub async fn hash(
        &self,
        id: &str,
        moved: bool,
        date: NaiveDate,
        algorithm: HashAlgorithm,
    ) -> AppResult<Option<String>> {
        hash_file(&self.current_path(id, moved, date), algorithm).await
    }

    pub async fn exists(&self, id: &str, moved: bool, date: NaiveDate) -> bool {
        fs::try_exists(self.current_path(id, moved, date))
            .await
            .unwrap_or(false)
    }

    pub async fn size(&self, id: &str, moved: bool, date: NaiveDate) -> Option<u64> {
        fs::metadata(self.current_path(id, moved, date))
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Removes empty first-level partition directories. Returns how many went away.
    pub async fn prune_empty_date_dirs(&self) -> AppResult<usize> {
        let mut entries = match fs::read_dir(&self.new_base).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(AppError::from(err).with_context("operation", "prune_read_root"))
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "prune_next_entry"))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || !dir_is_empty(&path).await {
                continue;
            }
            match fs::remove_dir(&path).await {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(
                        target: "file_migrator",
                        event = "partition_dir_pruned",
                        path = %path.display()
                    );
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(
                        target: "file_migrator",
                        event = "partition_dir_prune_skipped",
                        path = %path.display(),
                        error = %err
                    );
                }
            }
        }
        Ok(removed)
    }

    pub async fn storage_stats(&self) -> AppResult<StorageStats> {
        let base = self.base.clone();
        let new_base = self.new_base.clone();
        tokio::task::spawn_blocking(move || collect_storage_stats(&base, &new_base))
            .await
            .map_err(|err| {
                AppError::new("PLACEMENT/STATS_FAILED", "Storage statistics task failed.")
                    .with_context("error", err.to_string())
            })
    }

    /// Flat-layout file names, sorted, at most `limit`.
    pub async fn list_unmoved_files(&self, limit: usize) -> AppResult<Vec<String>> {
        let mut entries = fs::read_dir(&self.base)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "list_unmoved_files"))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "list_unmoved_files"))?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names.truncate(limit);
        Ok(names)
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

fn ensure_vacant(target: &Path) -> AppResult<()> {
    if target.exists() {
        return Err(AppError::new(
            "PLACEMENT/DESTINATION_EXISTS",
            "Destination file already exists.",
        )
        .with_context("path", target.display().to_string()));
    }
    Ok(())
}

async fn dir_is_empty(path: &Path) -> bool {
    match fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn staging_path_for(target: &Path) -> PathBuf {
    let parent = target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    parent.join(format!("{STAGING_PREFIX}{}", Uuid::now_v7()))
}

/// Cross-volume fallback: copy to a staging file, verify, sync, rename into place.
async fn copy_into_place(
    source: &Path,
    target: &Path,
    rename_err: Option<std::io::Error>,
) -> AppResult<()> {
    #[cfg(test)]
    LAST_MOVE_USED_COPY.with(|flag| flag.set(true));

    let staging = staging_path_for(target);
    let result = stage_and_commit(source, &staging, target).await;
    if result.is_err() && staging.exists() {
        if let Err(cleanup) = fs::remove_file(&staging).await {
            tracing::warn!(
                target: "file_migrator",
                event = "placement_staging_cleanup_failed",
                path = %staging.display(),
                error = %cleanup
            );
        }
    }
    result.map_err(|err| match rename_err {
        Some(rename_err) => err.with_context("rename_error", rename_err.to_string()),
        None => err,
    })
}

async fn stage_and_commit(source: &Path, staging: &Path, target: &Path) -> AppResult<()> {
    fs::copy(source, staging)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "copy_to_staging"))?;

    let source_len = fs::metadata(source)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "metadata_source"))?
        .len();
    let staged_len = fs::metadata(staging)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "metadata_stage"))?
        .len();
    if source_len != staged_len {
        return Err(AppError::new(
            "PLACEMENT/COPY_VERIFICATION_FAILED",
            "Cross-volume copy verification failed due to size mismatch.",
        )
        .with_context("source_len", source_len.to_string())
        .with_context("staged_len", staged_len.to_string()));
    }

    let handle = File::open(staging)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "open_stage_file"))?;
    handle
        .sync_all()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "sync_stage_file"))?;
    drop(handle);

    ensure_vacant(target)?;
    fs::rename(staging, target)
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "commit_staged_file"))?;
    if let Err(err) = fs::remove_file(source).await {
        // The source is still authoritative; take the committed copy back out.
        if let Err(rollback) = fs::remove_file(target).await {
            tracing::warn!(
                target: "file_migrator",
                event = "placement_commit_rollback_failed",
                path = %target.display(),
                error = %rollback
            );
        }
        return Err(AppError::from(err).with_context("operation", "remove_source"));
    }
    Ok(())
}

fn collect_storage_stats(base: &Path, new_base: &Path) -> StorageStats {
    let mut stats = StorageStats::default();

    for entry in WalkDir::new(base)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        stats.flat_files += 1;
        stats.flat_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
    }

    for entry in WalkDir::new(new_base)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.depth() == 1 && entry.file_type().is_dir() {
            stats.date_dirs += 1;
        } else if entry.file_type().is_file() {
            stats.partitioned_files += 1;
            stats.partitioned_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    stats
}
