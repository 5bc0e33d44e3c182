//! Error types for the Murphy backup engine
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is [`MurphyError`]. Variants are grouped the way callers need to react to
//! them:
//!
//! - **Preconditions**: a second job while one is running, an occupied archive
//!   or snapshot location, a snapshot missing from history, malformed writes.
//!   These fail before any unrelated side effect happens.
//! - **Enumeration**: every unreadable source entry is collected into a single
//!   [`MurphyError::Enumeration`] instead of aborting on the first one.
//! - **Integrity**: a stored copy whose checksum differs from the source.
//! - **Collisions**: a restore that would overwrite an existing file.
//!
//! Nothing is retried automatically; a failed backup leaves its partial
//! snapshot on disk for the caller to inspect or remove.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Murphy library
pub type Result<T> = std::result::Result<T, MurphyError>;

/// Main error type for all Murphy operations
#[derive(Debug, Error)]
pub enum MurphyError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors reading or writing JSON (configuration, archive descriptors)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors reading or writing a snapshot index
    #[error("Index error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A backup or restore is already running on this engine
    #[error("Cannot run more than one job at a time")]
    JobInProgress,

    /// Archive location is already occupied
    #[error("Archive already exists at path: {0:?}")]
    ArchiveAlreadyExists(PathBuf),

    /// Snapshot folder for this timestamp is already occupied
    #[error("Snapshot {0} already exists")]
    SnapshotAlreadyExists(String),

    /// Requested snapshot is not part of the archive history
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Add or modify write issued without content or checksum
    #[error("Content and checksum are required to {status} {path:?}")]
    MissingContent {
        /// Relative path being written
        path: String,
        /// Status that required the content
        status: String,
    },

    /// File status outside of add/modify/delete
    #[error("Invalid file status \"{0}\"")]
    InvalidStatus(String),

    /// Path is not a regular file
    #[error("Not a file: {0:?}")]
    NotAFile(PathBuf),

    /// One or more source entries could not be read during enumeration
    #[error("Reading source failed for {} path(s): {}", .0.len(), .0.join("; "))]
    Enumeration(Vec<String>),

    /// A stored copy does not match the content it was copied from
    #[error("Mismatching checksums for {path:?}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Relative path of the file
        path: String,
        /// Checksum of the original content
        expected: String,
        /// Checksum of the stored copy
        actual: String,
    },

    /// A stored file sits where a snapshot needs a folder for `path`
    #[error("Cannot store {path:?}: {conflict:?} is a file in the snapshot")]
    PathConflict {
        /// Relative path being stored
        path: String,
        /// Stored file occupying one of its parent folders
        conflict: String,
    },

    /// Restore destination already holds a file at this path
    #[error("Restore destination already exists: {0:?}")]
    DestinationExists(PathBuf),

    /// Snapshot index could not be understood
    #[error("Invalid snapshot index: {0}")]
    InvalidIndex(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid exclusion pattern: {0}")]
    InvalidPattern(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MurphyError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        MurphyError::Internal(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn configuration(msg: impl Into<String>) -> Self {
        MurphyError::InvalidConfiguration(msg.into())
    }

    /// Check if this error is a caller precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            MurphyError::JobInProgress
                | MurphyError::ArchiveAlreadyExists(_)
                | MurphyError::SnapshotAlreadyExists(_)
                | MurphyError::SnapshotNotFound(_)
                | MurphyError::MissingContent { .. }
                | MurphyError::InvalidStatus(_)
        )
    }

    /// Check if this error indicates corrupted or unreliable stored data
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            MurphyError::ChecksumMismatch { .. } | MurphyError::InvalidIndex(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            MurphyError::JobInProgress => {
                "Another backup or restore is still running. Wait for it to finish and try again.".to_string()
            }
            MurphyError::ArchiveAlreadyExists(path) => {
                format!("{:?} already exists. Choose an empty location for a new archive.", path)
            }
            MurphyError::DestinationExists(path) => {
                format!(
                    "{:?} already exists. Restore into an empty folder so nothing is overwritten.",
                    path
                )
            }
            MurphyError::Enumeration(failures) => {
                format!(
                    "Some source files could not be read:\n  {}\nCheck permissions and try again.",
                    failures.join("\n  ")
                )
            }
            MurphyError::ChecksumMismatch { path, .. } => {
                format!(
                    "The stored copy of {:?} does not match the original. The file may have changed during the backup; run it again.",
                    path
                )
            }
            MurphyError::PathConflict { path, conflict } => {
                format!(
                    "{:?} was stored as a file in this backup, so {:?} cannot be recorded beneath it. Move one of them in the source and run the backup again.",
                    conflict, path
                )
            }
            _ => self.to_string(),
        }
    }
}
