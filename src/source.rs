//! Backup sources
//!
//! A [`Source`] is a named set of root paths (folders or single files) that
//! are backed up together. Files are identified by their key relative to the
//! *common root* of all paths, so `/home/me/Documents` and `/home/me/Photos`
//! produce keys like `Documents/cv.pdf` and `Photos/cat.jpg`.
//!
//! ## Enumeration
//!
//! [`Source::enumerate`] walks every root breadth-first. Each round issues
//! the pending `stat` and directory-listing calls with bounded concurrency
//! and feeds their results into the next round. An unreadable entry does not
//! stop the walk; it is recorded, and once the walk has finished the whole
//! call fails with every recorded failure at once.
//!
//! ## Content
//!
//! [`Source::create_read_stream`] hands out lazy, throttled streams; see
//! [`crate::file_queue`]. [`Source::get_file_checksum`] drains one to compute
//! the file's SHA-1.

use crate::error::{MurphyError, Result};
use crate::file_queue::{FileQueue, ReadStream};
use crate::utils;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// A named set of filesystem roots to back up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SourceData", into = "SourceData")]
pub struct Source {
    name: String,
    paths: Vec<PathBuf>,
    root_dir: PathBuf,
    queue: FileQueue,
}

#[derive(Serialize, Deserialize)]
struct SourceData {
    name: String,
    paths: Vec<PathBuf>,
}

impl From<SourceData> for Source {
    fn from(data: SourceData) -> Self {
        Source::new(data.name, data.paths)
    }
}

impl From<Source> for SourceData {
    fn from(source: Source) -> Self {
        SourceData {
            name: source.name,
            paths: source.paths,
        }
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.paths == other.paths
    }
}

impl Eq for Source {}

enum Visit {
    Stat(PathBuf),
    List(PathBuf),
}

enum Outcome {
    File(PathBuf),
    Dir { path: PathBuf, canonical: PathBuf },
    Children(Vec<PathBuf>),
    Skipped,
    Failed(String),
}

impl Source {
    /// Create a source with its own file-handle queue
    pub fn new(name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self::with_file_queue(name, paths, FileQueue::default())
    }

    /// Create a source whose reads are admitted through `queue`
    pub fn with_file_queue(name: impl Into<String>, paths: Vec<PathBuf>, queue: FileQueue) -> Self {
        let root_dir = resolve_root(&paths);
        Self {
            name: name.into(),
            paths,
            root_dir,
            queue,
        }
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root paths in the order they were given
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Directory that file keys are relative to
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Queue admitting this source's file handles
    pub fn file_queue(&self) -> &FileQueue {
        &self.queue
    }

    /// List every file under all roots as sorted keys relative to the root
    ///
    /// # Errors
    ///
    /// [`MurphyError::Enumeration`] listing every entry that could not be
    /// read, after the rest of the tree has been walked.
    pub async fn enumerate(&self) -> Result<Vec<String>> {
        let concurrency = self.queue.limit();
        let mut files = Vec::new();
        let mut errors = Vec::new();
        let mut visited = HashSet::new();
        let mut pending: Vec<Visit> = self.paths.iter().cloned().map(Visit::Stat).collect();

        while !pending.is_empty() {
            let round = std::mem::take(&mut pending);
            let outcomes: Vec<Outcome> = stream::iter(round)
                .map(|visit| self.visit(visit))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    Outcome::File(path) => files.push(path),
                    Outcome::Dir { path, canonical } => {
                        if visited.insert(canonical) {
                            pending.push(Visit::List(path));
                        } else {
                            debug!("Skipping already visited folder {:?}", path);
                        }
                    }
                    Outcome::Children(children) => {
                        pending.extend(children.into_iter().map(Visit::Stat));
                    }
                    Outcome::Skipped => {}
                    Outcome::Failed(message) => errors.push(message),
                }
            }
        }

        if !errors.is_empty() {
            errors.sort();
            warn!("Enumerating source {:?} failed for {} path(s)", self.name, errors.len());
            return Err(MurphyError::Enumeration(errors));
        }

        let mut keys: Vec<String> = files
            .iter()
            .map(|path| utils::relative_key(path, &self.root_dir))
            .filter(|key| !key.is_empty())
            .collect();
        keys.sort();
        keys.dedup();

        info!("Found {} files in source {:?}", keys.len(), self.name);
        Ok(keys)
    }

    async fn visit(&self, visit: Visit) -> Outcome {
        match visit {
            Visit::Stat(path) => match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Outcome::File(path),
                Ok(meta) if meta.is_dir() => {
                    let canonical = tokio::fs::canonicalize(&path)
                        .await
                        .unwrap_or_else(|_| path.clone());
                    Outcome::Dir { path, canonical }
                }
                Ok(_) => Outcome::Skipped,
                Err(e) => {
                    warn!("Reading {:?} failed: {}", path, e);
                    Outcome::Failed(format!("Reading {} failed ({})", self.short_path(&path), e))
                }
            },
            Visit::List(dir) => match self.queue.read_dir(&dir).await {
                Ok(children) => Outcome::Children(children),
                Err(e) => {
                    warn!("Opening folder {:?} failed: {}", dir, e);
                    Outcome::Failed(format!(
                        "Opening folder {} failed ({})",
                        self.short_path(&dir),
                        e
                    ))
                }
            },
        }
    }

    fn short_path(&self, path: &Path) -> String {
        let key = utils::relative_key(path, &self.root_dir);
        if key.is_empty() {
            path.display().to_string()
        } else {
            key
        }
    }

    /// Absolute path of a key
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Lazy, throttled stream over a file's content
    pub fn create_read_stream(&self, key: &str) -> ReadStream {
        self.queue.read_stream(self.file_path(key))
    }

    /// SHA-1 of a file's current content
    ///
    /// Fails for directories and missing paths.
    pub async fn get_file_checksum(&self, key: &str) -> Result<String> {
        let stream = self.create_read_stream(key);
        let mut file = stream.open().await.map_err(|e| {
            error!("Error opening source file {:?}: {}", key, e);
            e
        })?;
        let checksum = utils::hash_stream(&mut file).await.map_err(|e| {
            error!("Source file hashing error {:?}: {}", key, e);
            e
        })?;
        file.close().await?;
        Ok(checksum)
    }
}

/// Root directory for a set of source paths
///
/// The lexical common root, except that a root which is an existing regular
/// file (a single-file source) is replaced by its parent folder so the file
/// keeps its own name as key.
fn resolve_root(paths: &[PathBuf]) -> PathBuf {
    let root = common_root(paths);
    if std::fs::metadata(&root).map(|m| m.is_file()).unwrap_or(false) {
        return root.parent().map(Path::to_path_buf).unwrap_or_default();
    }
    root
}

/// Longest common prefix of whole path segments
///
/// No paths give an empty root; one path is its own root. Trailing
/// separators and `.` segments are ignored.
pub fn common_root(paths: &[PathBuf]) -> PathBuf {
    let segments: Vec<_> = paths.iter().map(|p| utils::path_segments(p)).collect();
    let Some((first, rest)) = segments.split_first() else {
        return PathBuf::new();
    };

    for (index, segment) in first.iter().enumerate() {
        let mismatch = rest
            .iter()
            .any(|other| other.get(index).map_or(true, |s| s != segment));
        if mismatch {
            return first[..index].iter().collect();
        }
    }

    if !rest.is_empty() {
        warn!("Possible duplicate source paths: {:?}", paths);
    }
    first.iter().collect()
}
