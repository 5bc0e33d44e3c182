//! Core data types shared across Murphy
//!
//! - [`FileStatus`] and [`FileInfo`]: one entry of a snapshot index
//! - [`SnapshotCounts`]: per-status totals of a snapshot
//! - [`ProgressCallback`]: how jobs report progress to the outside world
//! - [`RestoredFile`]: one line of a restore summary

use crate::error::MurphyError;
use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Role of a file within one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    /// First appearance of the path, or its return after a deletion
    Add,
    /// Content changed since the snapshot that last stored it
    Modify,
    /// Path disappeared from the source
    Delete,
}

impl FileStatus {
    /// Lowercase name used in indexes and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Add => "add",
            FileStatus::Modify => "modify",
            FileStatus::Delete => "delete",
        }
    }

    /// Whether the snapshot stores content for this status
    pub fn has_content(&self) -> bool {
        !matches!(self, FileStatus::Delete)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = MurphyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(FileStatus::Add),
            "modify" => Ok(FileStatus::Modify),
            "delete" => Ok(FileStatus::Delete),
            other => Err(MurphyError::InvalidStatus(other.to_string())),
        }
    }
}

/// Index entry for one path in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// What happened to the path in this snapshot
    pub status: FileStatus,
    /// SHA-1 of the stored content; empty for deletions
    pub checksum: String,
}

/// Number of index entries per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    /// Paths added
    pub added: usize,
    /// Paths modified
    pub modified: usize,
    /// Paths deleted
    pub deleted: usize,
}

impl SnapshotCounts {
    /// Whether the snapshot records any change at all
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.modified > 0 || self.deleted > 0
    }

    /// Paths for which content was stored
    pub fn stored(&self) -> usize {
        self.added + self.modified
    }
}

/// Progress sink: `(fraction in [0, 1], message)`
///
/// Invoked repeatedly while a job runs and finally with `1.0`. Calls happen
/// on a separate task so a slow consumer never stalls the job's I/O.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// A file written by a restore, and the snapshot that supplied it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredFile {
    /// Relative path under the restore destination
    pub path: String,
    /// Timestamp of the snapshot whose content was copied
    pub snapshot: DateTime<Local>,
}
