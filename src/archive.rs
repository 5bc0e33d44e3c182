//! Storage contract for archives and their snapshots
//!
//! An [`Archive`] is a named, durable container of [`Snapshot`]s. Each
//! storage backend is one variant of these enums; the variant *is* the type
//! discriminant, stored as plain data in the serialized form:
//!
//! ```json
//! { "name": "USB drive", "type": "FilesystemArchive", "path": "/media/usb/Backup" }
//! ```
//!
//! Deserializing an unknown `type` is a hard error. Behaviour for each
//! variant comes from its [`ArchiveBackend`] / [`SnapshotBackend`]
//! implementation and the enums forward to it.
//!
//! ## Snapshot lifecycle
//!
//! 1. constructed by its archive
//! 2. [`init`](SnapshotBackend::init) (new, empty, persisted) or
//!    [`load`](SnapshotBackend::load) (index read back from storage)
//! 3. any number of [`write_file`](SnapshotBackend::write_file) calls
//! 4. [`apply`](SnapshotBackend::apply) persists the index
//!
//! After `apply` a snapshot is only read. Each snapshot's index is driven by
//! exactly one job at a time.

use crate::error::Result;
use crate::file_queue::ReadStream;
use crate::fs_archive::FilesystemArchive;
use crate::fs_snapshot::FilesystemSnapshot;
use crate::types::{FileStatus, SnapshotCounts};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Behaviour every archive backend provides
#[allow(async_fn_in_trait)]
pub trait ArchiveBackend {
    /// Display name
    fn name(&self) -> &str;

    /// Set up the archive for the first time
    ///
    /// Fails if the target location already holds anything.
    async fn init(&mut self) -> Result<()>;

    /// Recompute the derived latest view from the full history
    async fn rebuild(&mut self) -> Result<()>;

    /// Allocate and initialize the snapshot for the current second
    async fn create_version(&mut self) -> Result<Snapshot>;

    /// All snapshots, newest first
    async fn get_versions(&mut self) -> Result<Vec<Snapshot>>;
}

/// Behaviour every snapshot backend provides
#[allow(async_fn_in_trait)]
pub trait SnapshotBackend {
    /// Identity and sort key, at second resolution
    fn timestamp(&self) -> DateTime<Local>;

    /// Label of the machine the snapshot was taken on, once initialized or loaded
    fn source_label(&self) -> Option<String>;

    /// Every path with an index entry, deletions included, sorted
    fn files(&self) -> Vec<String>;

    /// Status of `key`, `None` when the snapshot never touched it
    fn get_file_status(&self, key: &str) -> Option<FileStatus>;

    /// Stored checksum of `key`, `None` when unknown
    fn get_file_checksum(&self, key: &str) -> Option<String>;

    /// Stream over the stored content of `key`, `None` when unknown
    fn create_read_stream(&self, key: &str) -> Option<ReadStream>;

    /// Create the empty snapshot in storage
    async fn init(&self) -> Result<()>;

    /// Read the index back from storage
    async fn load(&self) -> Result<()>;

    /// Record `key` with `status`, storing `stream`'s bytes for add/modify
    ///
    /// Add and modify require both `stream` and `checksum`; delete uses
    /// neither. The in-memory index changes immediately, storage only on
    /// [`apply`](SnapshotBackend::apply).
    async fn write_file(
        &self,
        key: &str,
        status: FileStatus,
        stream: Option<ReadStream>,
        checksum: Option<&str>,
    ) -> Result<()>;

    /// Persist the index
    async fn apply(&self) -> Result<()>;
}

/// A storage backend holding versioned snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Archive {
    /// Timestamped folders plus a `Latest/` link farm on a local filesystem
    #[serde(rename = "FilesystemArchive")]
    Filesystem(FilesystemArchive),
}

impl Archive {
    /// Serialized type discriminant
    pub fn kind(&self) -> &'static str {
        match self {
            Archive::Filesystem(_) => "FilesystemArchive",
        }
    }

    /// Parse an archive descriptor; unknown types are rejected
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to `{name, type, ...}`
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Display name
    pub fn name(&self) -> &str {
        match self {
            Archive::Filesystem(archive) => archive.name(),
        }
    }

    /// See [`ArchiveBackend::init`]
    pub async fn init(&mut self) -> Result<()> {
        match self {
            Archive::Filesystem(archive) => archive.init().await,
        }
    }

    /// See [`ArchiveBackend::rebuild`]
    pub async fn rebuild(&mut self) -> Result<()> {
        match self {
            Archive::Filesystem(archive) => archive.rebuild().await,
        }
    }

    /// See [`ArchiveBackend::create_version`]
    pub async fn create_version(&mut self) -> Result<Snapshot> {
        match self {
            Archive::Filesystem(archive) => archive.create_version().await,
        }
    }

    /// See [`ArchiveBackend::get_versions`]
    pub async fn get_versions(&mut self) -> Result<Vec<Snapshot>> {
        match self {
            Archive::Filesystem(archive) => archive.get_versions().await,
        }
    }
}

impl From<FilesystemArchive> for Archive {
    fn from(archive: FilesystemArchive) -> Self {
        Archive::Filesystem(archive)
    }
}

/// One timestamped record of a source's incremental changes
///
/// Cheap to clone: clones share the same underlying snapshot.
#[derive(Debug, Clone)]
pub enum Snapshot {
    /// Snapshot folder inside a [`FilesystemArchive`]
    Filesystem(Arc<FilesystemSnapshot>),
}

macro_rules! forward {
    ($self:ident, $snapshot:ident => $call:expr) => {
        match $self {
            Snapshot::Filesystem($snapshot) => $call,
        }
    };
}

impl Snapshot {
    /// See [`SnapshotBackend::timestamp`]
    pub fn timestamp(&self) -> DateTime<Local> {
        forward!(self, s => s.timestamp())
    }

    /// See [`SnapshotBackend::source_label`]
    pub fn source_label(&self) -> Option<String> {
        forward!(self, s => s.source_label())
    }

    /// See [`SnapshotBackend::files`]
    pub fn files(&self) -> Vec<String> {
        forward!(self, s => s.files())
    }

    /// See [`SnapshotBackend::get_file_status`]
    pub fn get_file_status(&self, key: &str) -> Option<FileStatus> {
        forward!(self, s => s.get_file_status(key))
    }

    /// See [`SnapshotBackend::get_file_checksum`]
    pub fn get_file_checksum(&self, key: &str) -> Option<String> {
        forward!(self, s => s.get_file_checksum(key))
    }

    /// See [`SnapshotBackend::create_read_stream`]
    pub fn create_read_stream(&self, key: &str) -> Option<ReadStream> {
        forward!(self, s => s.create_read_stream(key))
    }

    /// See [`SnapshotBackend::init`]
    pub async fn init(&self) -> Result<()> {
        forward!(self, s => s.init().await)
    }

    /// See [`SnapshotBackend::load`]
    pub async fn load(&self) -> Result<()> {
        forward!(self, s => s.load().await)
    }

    /// See [`SnapshotBackend::write_file`]
    pub async fn write_file(
        &self,
        key: &str,
        status: FileStatus,
        stream: Option<ReadStream>,
        checksum: Option<&str>,
    ) -> Result<()> {
        forward!(self, s => s.write_file(key, status, stream, checksum).await)
    }

    /// See [`SnapshotBackend::apply`]
    pub async fn apply(&self) -> Result<()> {
        forward!(self, s => s.apply().await)
    }

    /// Number of entries per status
    pub fn counts(&self) -> SnapshotCounts {
        let mut counts = SnapshotCounts::default();
        for key in self.files() {
            match self.get_file_status(&key) {
                Some(FileStatus::Add) => counts.added += 1,
                Some(FileStatus::Modify) => counts.modified += 1,
                Some(FileStatus::Delete) => counts.deleted += 1,
                None => {}
            }
        }
        counts
    }

    /// Human-readable timestamp, as used in folder names and summaries
    pub fn label(&self) -> String {
        self.timestamp().format(crate::fs_snapshot::FOLDER_NAME_FORMAT).to_string()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp() == other.timestamp()
    }
}
