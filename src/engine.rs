//! Backup and restore jobs
//!
//! The [`Engine`] runs one job at a time. A second job started while one is
//! in flight fails immediately with [`MurphyError::JobInProgress`].
//!
//! ## Backup
//!
//! 1. read the archive's history, newest first
//! 2. create the new snapshot
//! 3. enumerate the source, dropping keys that match an exclusion pattern
//! 4. for every file, the newest snapshot mentioning it decides:
//!    - add/modify with the same checksum: unchanged, nothing is stored
//!    - add/modify with another checksum: stored as `modify`
//!    - delete, or never seen before: stored as `add`
//!
//!    every stored copy is read back and its checksum compared to the source
//! 5. keys whose newest status is add/modify but that are gone from the
//!    source are recorded as `delete`
//! 6. the snapshot index is persisted and the latest view rebuilt
//!
//! A failure aborts the job and leaves the partial snapshot on disk.
//!
//! ## Restore
//!
//! Every file takes its content from the newest snapshot at or before the
//! requested one. Files whose newest status there is `delete` are left out.
//! Every destination path is checked before anything is written, so a
//! collision leaves the destination untouched. A `Restore Summary.txt` lists
//! what came from where.
//!
//! ## Progress
//!
//! Both jobs report a weighted overall fraction through an optional
//! [`ProgressCallback`]. The callback runs on its own task and only ever sees
//! the most recent value, so a slow consumer cannot hold up file I/O. The
//! final `(1.0, "Done")` is delivered before the job returns.

use crate::archive::{Archive, Snapshot};
use crate::config::{compile_patterns, Config};
use crate::error::{MurphyError, Result};
use crate::file_queue::{FileQueue, WriteMode, DEFAULT_FILE_HANDLE_LIMIT, MIN_FILE_HANDLE_LIMIT};
use crate::progress::Progress;
use crate::source::Source;
use crate::types::{FileStatus, ProgressCallback, RestoredFile};
use crate::utils;
use chrono::Local;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Summary written at the root of every restore
pub const RESTORE_SUMMARY_FILE: &str = "Restore Summary.txt";

const BACKUP_STEPS: [(&str, f64); 7] = [
    ("read_versions", 0.08),
    ("create_version", 0.02),
    ("enumerate_source", 0.1),
    ("copy_files", 0.4),
    ("mark_deletions", 0.3),
    ("apply", 0.02),
    ("rebuild", 0.08),
];

const RESTORE_STEPS: [(&str, f64); 4] = [
    ("read_versions", 0.1),
    ("map_file_versions", 0.1),
    ("copy_files", 0.75),
    ("write_summary", 0.05),
];

const DONE_MESSAGE: &str = "Done";

/// Builder for [`Engine`]
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    exclude_patterns: Vec<String>,
    diff_workers: usize,
    file_handle_limit: usize,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Builder with no exclusions, one diff worker per CPU and the default handle limit
    pub fn new() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            diff_workers: num_cpus::get(),
            file_handle_limit: DEFAULT_FILE_HANDLE_LIMIT,
        }
    }

    /// Regular expressions matched against file keys; matches are not backed up
    ///
    /// # Examples
    ///
    /// ```rust
    /// use murphy::EngineBuilder;
    ///
    /// let engine = EngineBuilder::new()
    ///     .exclude_patterns(vec![r"\.DS_Store$".to_string(), "node_modules/".to_string()])
    ///     .build()
    ///     .unwrap();
    /// assert!(engine.is_excluded("app/node_modules/x.js"));
    /// ```
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Number of files diffed and copied at the same time
    pub fn diff_workers(mut self, workers: usize) -> Self {
        self.diff_workers = workers.max(1);
        self
    }

    /// Bound on the file handles the engine itself opens while restoring
    ///
    /// Hand the resulting [`Engine::file_queue`] to the source and archive
    /// as well to bound the whole process by one limit.
    pub fn file_handle_limit(mut self, limit: usize) -> Self {
        self.file_handle_limit = limit.max(MIN_FILE_HANDLE_LIMIT);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// [`MurphyError::InvalidPattern`] if an exclusion pattern does not compile.
    pub fn build(self) -> Result<Engine> {
        Ok(Engine {
            exclude: compile_patterns(&self.exclude_patterns)?,
            diff_workers: self.diff_workers,
            queue: FileQueue::new(self.file_handle_limit),
            jobs: AtomicUsize::new(0),
        })
    }
}

/// Runs backup and restore jobs, one at a time
#[derive(Debug)]
pub struct Engine {
    exclude: Vec<Regex>,
    diff_workers: usize,
    queue: FileQueue,
    jobs: AtomicUsize,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            diff_workers: num_cpus::get(),
            queue: FileQueue::default(),
            jobs: AtomicUsize::new(0),
        }
    }
}

struct JobGuard<'a> {
    jobs: &'a AtomicUsize,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.jobs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine {
    /// Engine without exclusions
    pub fn new() -> Self {
        Self::default()
    }

    /// Start configuring an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine using the exclusion patterns of `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        EngineBuilder::new()
            .exclude_patterns(config.exclude_patterns.clone())
            .build()
    }

    /// Whether a job is currently running
    pub fn is_busy(&self) -> bool {
        self.jobs.load(Ordering::SeqCst) > 0
    }

    /// Whether `key` matches one of the exclusion patterns
    pub fn is_excluded(&self, key: &str) -> bool {
        self.exclude.iter().any(|pattern| pattern.is_match(key))
    }

    /// Queue bounding the handles opened by restores
    pub fn file_queue(&self) -> &FileQueue {
        &self.queue
    }

    fn start_job(&self) -> Result<JobGuard<'_>> {
        self.jobs
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                warn!("Rejecting job, another one is still running");
                MurphyError::JobInProgress
            })?;
        Ok(JobGuard { jobs: &self.jobs })
    }

    /// Back up `source` into a new snapshot of `destination`
    ///
    /// Returns the new snapshot, already persisted and reflected in the
    /// archive's latest view.
    pub async fn run_backup(
        &self,
        source: &Source,
        destination: &mut Archive,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Snapshot> {
        let _job = self.start_job()?;
        let started = Instant::now();
        info!("Backing up {:?} to {:?}", source.name(), destination.name());

        let reporter = Reporter::new(&BACKUP_STEPS, on_progress);
        reporter.report("Reading backup");
        let history = destination.get_versions().await?;
        debug!("Archive {:?} holds {} versions", destination.name(), history.len());

        reporter.advance("Creating new version");
        let snapshot = destination.create_version().await?;

        reporter.advance("Reading source folder(s)");
        let files: Vec<String> = source
            .enumerate()
            .await?
            .into_iter()
            .filter(|key| {
                let excluded = self.is_excluded(key);
                if excluded {
                    trace!("Excluding {:?}", key);
                }
                !excluded
            })
            .collect();

        reporter.advance("Copying files");
        let total = files.len();
        stream::iter(files.iter().map(Ok::<_, MurphyError>))
            .try_for_each_concurrent(self.diff_workers, |key| {
                let history = &history;
                let snapshot = &snapshot;
                let reporter = &reporter;
                async move {
                    backup_file(source, history, snapshot, key).await?;
                    reporter.item_done(total, "Copying files");
                    Ok::<(), MurphyError>(())
                }
            })
            .await?;

        reporter.advance("Looking for deleted files");
        let present: HashSet<&str> = files.iter().map(String::as_str).collect();
        let deleted = deleted_files(&history, &present, &snapshot);
        for key in &deleted {
            trace!("Recording deletion of {:?}", key);
            snapshot.write_file(key, FileStatus::Delete, None, None).await?;
            reporter.item_done(deleted.len(), "Looking for deleted files");
        }

        reporter.advance("Saving new version");
        snapshot.apply().await?;

        reporter.advance("Saving backup");
        destination.rebuild().await?;
        reporter.finish().await;

        let counts = snapshot.counts();
        info!(
            "Backup {} finished in {}: {} added, {} modified, {} deleted",
            snapshot.label(),
            humantime::format_duration(std::time::Duration::from_secs(started.elapsed().as_secs())),
            counts.added,
            counts.modified,
            counts.deleted
        );
        Ok(snapshot)
    }

    /// Restore the state of `snapshot` from `archive` into `destination`
    ///
    /// # Errors
    ///
    /// - [`MurphyError::SnapshotNotFound`] if `snapshot` is not part of the archive's history
    /// - [`MurphyError::DestinationExists`] if any restored file or the summary already exists
    /// - [`MurphyError::ChecksumMismatch`] if a restored file does not match its index entry
    pub async fn run_restore(
        &self,
        archive: &mut Archive,
        snapshot: &Snapshot,
        destination: &Path,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Vec<RestoredFile>> {
        let _job = self.start_job()?;
        let started = Instant::now();
        info!("Restoring {} of {:?} to {:?}", snapshot.label(), archive.name(), destination);

        let reporter = Reporter::new(&RESTORE_STEPS, on_progress);
        reporter.report("Reading backup");
        let history = archive.get_versions().await?;
        let position = history
            .iter()
            .position(|version| version.timestamp() == snapshot.timestamp())
            .ok_or_else(|| {
                error!("Version {} is not part of {:?}", snapshot.label(), archive.name());
                MurphyError::SnapshotNotFound(snapshot.label())
            })?;

        reporter.advance("Finding file versions");
        let plan = restore_plan(&history[position..]);
        let summary_path = destination.join(RESTORE_SUMMARY_FILE);
        let mut targets = Vec::with_capacity(plan.len());
        for (key, _) in &plan {
            targets.push(utils::key_to_path(destination, key)?);
        }
        self.check_destination(targets.iter().chain(std::iter::once(&summary_path)))
            .await?;
        debug!("Restoring {} files", plan.len());

        reporter.advance("Restoring files");
        let total = plan.len();
        stream::iter(plan.iter().zip(&targets).map(Ok::<_, MurphyError>))
            .try_for_each_concurrent(self.diff_workers, |((key, version), target)| {
                let reporter = &reporter;
                async move {
                    self.restore_file(key, version, target).await?;
                    reporter.item_done(total, "Restoring files");
                    Ok::<(), MurphyError>(())
                }
            })
            .await?;

        reporter.advance("Writing summary");
        let restored: Vec<RestoredFile> = plan
            .iter()
            .map(|(key, version)| RestoredFile {
                path: key.clone(),
                snapshot: version.timestamp(),
            })
            .collect();
        self.write_summary(&summary_path, archive.name(), snapshot, &restored)
            .await?;
        reporter.finish().await;

        info!(
            "Restored {} files from {} in {}",
            restored.len(),
            snapshot.label(),
            humantime::format_duration(std::time::Duration::from_secs(started.elapsed().as_secs()))
        );
        Ok(restored)
    }

    async fn check_destination<'a>(&self, paths: impl Iterator<Item = &'a PathBuf>) -> Result<()> {
        let taken: Vec<PathBuf> = stream::iter(paths)
            .map(|path| async move { utils::path_exists(path).await.then(|| path.clone()) })
            .buffer_unordered(self.queue.limit())
            .filter_map(|taken| async move { taken })
            .collect()
            .await;

        match taken.into_iter().min() {
            Some(path) => {
                error!("Restore destination already contains {:?}", path);
                Err(MurphyError::DestinationExists(path))
            }
            None => Ok(()),
        }
    }

    async fn restore_file(&self, key: &str, version: &Snapshot, target: &Path) -> Result<()> {
        let stream = version
            .create_read_stream(key)
            .ok_or_else(|| MurphyError::internal(format!("{:?} has no content in {}", key, version.label())))?;
        utils::ensure_parent_dir(target).await?;

        self.queue
            .copy(&stream, target, WriteMode::CreateNew)
            .await
            .map_err(|e| match e {
                MurphyError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                    MurphyError::DestinationExists(target.to_path_buf())
                }
                other => {
                    error!("Error restoring {:?}: {}", key, other);
                    other
                }
            })?;

        let expected = version.get_file_checksum(key).unwrap_or_default();
        if expected.is_empty() {
            trace!("No checksum recorded for {:?}, skipping verification", key);
            return Ok(());
        }
        let mut written = self.queue.open(target).await?;
        let actual = utils::hash_stream(&mut written).await?;
        written.close().await?;
        if actual != expected {
            error!("Restored {:?} does not match its backup", key);
            return Err(MurphyError::ChecksumMismatch {
                path: key.to_string(),
                expected,
                actual,
            });
        }
        trace!("Restored {:?} from {}", key, version.label());
        Ok(())
    }

    async fn write_summary(
        &self,
        path: &Path,
        archive_name: &str,
        snapshot: &Snapshot,
        restored: &[RestoredFile],
    ) -> Result<()> {
        let width = restored.iter().map(|f| f.path.len()).max().unwrap_or(0);
        let mut summary = format!(
            "Restored from archive: {}\nBackup of:             {}\nRestore completed:     {}\n\n{} file(s) restored:\n",
            archive_name,
            snapshot.label(),
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            restored.len()
        );
        for file in restored {
            summary.push_str(&format!(
                "{:width$}  {}\n",
                file.path,
                file.snapshot.format(crate::fs_snapshot::FOLDER_NAME_FORMAT),
                width = width
            ));
        }

        utils::ensure_parent_dir(path).await?;
        let mut file = self.queue.create_new(path).await?;
        file.write_all(summary.as_bytes()).await?;
        file.close().await
    }
}

/// Diff one source file against history and store it if needed
async fn backup_file(source: &Source, history: &[Snapshot], snapshot: &Snapshot, key: &str) -> Result<()> {
    let checksum = source.get_file_checksum(key).await?;

    let mut status = Some(FileStatus::Add);
    for version in history {
        match version.get_file_status(key) {
            Some(FileStatus::Add | FileStatus::Modify) => {
                let unchanged = version.get_file_checksum(key).as_deref() == Some(checksum.as_str());
                status = if unchanged { None } else { Some(FileStatus::Modify) };
                break;
            }
            Some(FileStatus::Delete) => {
                status = Some(FileStatus::Add);
                break;
            }
            None => {}
        }
    }

    let Some(status) = status else {
        trace!("Unchanged {:?}", key);
        return Ok(());
    };

    trace!("Storing {:?} as {}", key, status);
    snapshot
        .write_file(key, status, Some(source.create_read_stream(key)), Some(&checksum))
        .await?;

    verify_stored(snapshot, key, &checksum).await
}

/// Re-read the stored copy of `key` and compare it against `expected`
async fn verify_stored(snapshot: &Snapshot, key: &str, expected: &str) -> Result<()> {
    let stored = snapshot
        .create_read_stream(key)
        .ok_or_else(|| MurphyError::internal(format!("{:?} missing right after writing it", key)))?;
    let mut file = stored.open().await?;
    let actual = utils::hash_stream(&mut file).await?;
    file.close().await?;
    if actual != expected {
        error!("Stored copy of {:?} does not match the source", key);
        return Err(MurphyError::ChecksumMismatch {
            path: key.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Keys still present according to history but missing from the source
fn deleted_files(history: &[Snapshot], present: &HashSet<&str>, snapshot: &Snapshot) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut deleted = Vec::new();
    for version in history {
        for key in version.files() {
            if !seen.insert(key.clone()) {
                continue;
            }
            let live = version.get_file_status(&key).is_some_and(|s| s.has_content());
            if live && !present.contains(key.as_str()) && snapshot.get_file_status(&key).is_none() {
                deleted.push(key);
            }
        }
    }
    deleted.sort();
    deleted
}

/// For every key with content, the newest snapshot in `history` supplying it
///
/// `history` starts at the restored snapshot and goes back in time.
fn restore_plan(history: &[Snapshot]) -> Vec<(String, Snapshot)> {
    let mut owners: BTreeMap<String, &Snapshot> = BTreeMap::new();
    for version in history {
        for key in version.files() {
            owners.entry(key).or_insert(version);
        }
    }
    owners
        .into_iter()
        .filter(|(key, version)| version.get_file_status(key).is_some_and(|s| s.has_content()))
        .map(|(key, version)| (key, version.clone()))
        .collect()
}

struct ReporterState {
    progress: Progress,
    completed: usize,
}

/// Feeds a [`Progress`] to an optional callback running on its own task
struct Reporter {
    state: Mutex<ReporterState>,
    sender: Option<watch::Sender<(f64, String)>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Reporter {
    fn new(steps: &[(&str, f64)], callback: Option<ProgressCallback>) -> Self {
        let (sender, forwarder) = match callback {
            Some(callback) => {
                let (sender, mut receiver) = watch::channel((0.0, String::new()));
                let forwarder = tokio::spawn(async move {
                    while receiver.changed().await.is_ok() {
                        let (value, message) = receiver.borrow_and_update().clone();
                        callback(value, &message);
                    }
                });
                (Some(sender), Some(forwarder))
            }
            None => (None, None),
        };
        Self {
            state: Mutex::new(ReporterState {
                progress: Progress::new(steps.iter().copied()),
                completed: 0,
            }),
            sender,
            forwarder,
        }
    }

    fn send(&self, value: f64, message: &str) {
        if let Some(sender) = &self.sender {
            sender.send_replace((value, message.to_string()));
        }
    }

    // Values are sent while the state is locked so they go out in order

    fn report(&self, message: &str) {
        let state = self.state.lock();
        self.send(state.progress.value(), message);
    }

    fn advance(&self, message: &str) {
        let mut state = self.state.lock();
        state.completed = 0;
        let value = state.progress.advance().value();
        self.send(value, message);
    }

    fn item_done(&self, total: usize, message: &str) {
        let mut state = self.state.lock();
        state.completed += 1;
        let fraction = state.completed as f64 / total.max(1) as f64;
        let value = state.progress.current(fraction).value();
        self.send(value, message);
    }

    async fn finish(mut self) {
        self.send(1.0, DONE_MESSAGE);
        self.sender = None;
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!("Progress callback failed: {}", e);
            }
        }
    }
}
