//! Snapshot folders of a filesystem archive
//!
//! Every snapshot is a folder under `Versions/` named after its timestamp
//! (local time, second resolution, e.g. `2018-01-11 05-00-00`). It holds:
//!
//! ```text
//! 2018-01-11 05-00-00/
//! ├── .index                    # YAML: source, add, modify, delete
//! ├── folder/file1.txt          # content of added / modified files
//! └── file2.txt.deleted         # empty marker for a deleted file
//! ```
//!
//! The index maps every touched key to its checksum, grouped by status:
//!
//! ```yaml
//! source: my-laptop
//! add:
//!   folder/file1.txt: da39a3ee5e6b4b0d3255bfef95601890afd80709
//! modify: {}
//! delete:
//!   file2.txt: ''
//! ```

use crate::archive::SnapshotBackend;
use crate::error::{MurphyError, Result};
use crate::file_queue::{FileQueue, ReadStream, WriteMode};
use crate::types::{FileInfo, FileStatus};
use crate::utils;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace, warn};

/// `chrono` format of snapshot folder names
///
/// Names are local wall-clock time without an offset. When clocks fall back,
/// an hour's worth of names occurs twice and reads back as the earlier
/// instant, so snapshots taken in the repeated hour may sort out of order.
pub const FOLDER_NAME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
/// Folder holding every snapshot, relative to the archive root
pub const VERSIONS_FOLDER: &str = "Versions";
/// Index file inside each snapshot folder
pub const INDEX_FILE: &str = ".index";
/// Suffix of the empty marker left for deleted files
pub const DELETED_SUFFIX: &str = ".deleted";

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    source: Option<String>,
    #[serde(default, deserialize_with = "nullable_section")]
    add: BTreeMap<String, Option<String>>,
    #[serde(default, deserialize_with = "nullable_section")]
    modify: BTreeMap<String, Option<String>>,
    #[serde(default, deserialize_with = "nullable_section")]
    delete: BTreeMap<String, Option<String>>,
}

fn nullable_section<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl IndexFile {
    fn section_mut(&mut self, status: FileStatus) -> &mut BTreeMap<String, Option<String>> {
        match status {
            FileStatus::Add => &mut self.add,
            FileStatus::Modify => &mut self.modify,
            FileStatus::Delete => &mut self.delete,
        }
    }

    fn build(source: Option<String>, index: &BTreeMap<String, FileInfo>) -> Self {
        let mut file = IndexFile {
            source,
            ..Default::default()
        };
        for (key, info) in index {
            file.section_mut(info.status)
                .insert(key.clone(), Some(info.checksum.clone()));
        }
        file
    }

    fn parse(self) -> Result<(Option<String>, BTreeMap<String, FileInfo>)> {
        let mut index = BTreeMap::new();
        let sections = [
            (FileStatus::Add, self.add),
            (FileStatus::Modify, self.modify),
            (FileStatus::Delete, self.delete),
        ];
        for (status, entries) in sections {
            for (key, checksum) in entries {
                let info = FileInfo {
                    status,
                    checksum: checksum.unwrap_or_default(),
                };
                if index.insert(key.clone(), info).is_some() {
                    return Err(MurphyError::InvalidIndex(format!(
                        "{:?} is listed under more than one status",
                        key
                    )));
                }
            }
        }
        Ok((self.source, index))
    }
}

#[derive(Debug, Default)]
struct SnapshotState {
    source: Option<String>,
    index: BTreeMap<String, FileInfo>,
}

/// Snapshot stored as a timestamped folder
pub struct FilesystemSnapshot {
    timestamp: DateTime<Local>,
    archive_path: PathBuf,
    folder_name: String,
    queue: FileQueue,
    state: Mutex<SnapshotState>,
}

impl fmt::Debug for FilesystemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemSnapshot")
            .field("folder_name", &self.folder_name)
            .field("archive_path", &self.archive_path)
            .field("files", &self.state.lock().index.len())
            .finish()
    }
}

impl FilesystemSnapshot {
    /// Snapshot of `archive_path` for `timestamp`, truncated to whole seconds
    pub fn new(timestamp: DateTime<Local>, archive_path: PathBuf, queue: FileQueue) -> Self {
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let folder_name = timestamp.format(FOLDER_NAME_FORMAT).to_string();
        Self {
            timestamp,
            archive_path,
            folder_name,
            queue,
            state: Mutex::new(SnapshotState::default()),
        }
    }

    /// Snapshot for an existing folder, `None` if the name is not a timestamp
    pub fn from_folder_name(name: &str, archive_path: PathBuf, queue: FileQueue) -> Option<Self> {
        let naive = NaiveDateTime::parse_from_str(name, FOLDER_NAME_FORMAT).ok()?;
        let timestamp = Local.from_local_datetime(&naive).earliest()?;
        Some(Self::new(timestamp, archive_path, queue))
    }

    /// Folder name derived from the timestamp
    pub fn folder_name(&self) -> &str {
        &self.folder_name
    }

    /// Absolute location of the snapshot folder
    pub fn folder_path(&self) -> PathBuf {
        self.archive_path.join(VERSIONS_FOLDER).join(&self.folder_name)
    }

    fn index_path(&self) -> PathBuf {
        self.folder_path().join(INDEX_FILE)
    }

    /// Where the content of `key` is stored inside the snapshot folder
    pub fn payload_path(&self, key: &str) -> Result<PathBuf> {
        utils::key_to_path(&self.folder_path(), key)
    }

    fn marker_path(&self, key: &str) -> Result<PathBuf> {
        let mut marker = self.payload_path(key)?.into_os_string();
        marker.push(DELETED_SUFFIX);
        Ok(PathBuf::from(marker))
    }

    /// Create the parent folders of `target`
    ///
    /// A file stored earlier in this snapshot may sit where a folder is
    /// needed (a source folder replaced by a file of the same name); that
    /// case is reported as a [`MurphyError::PathConflict`].
    async fn prepare_parent(&self, key: &str, target: &Path) -> Result<()> {
        let Err(e) = utils::ensure_parent_dir(target).await else {
            return Ok(());
        };
        let folder = self.folder_path();
        for ancestor in target.ancestors().skip(1) {
            if ancestor == folder {
                break;
            }
            if tokio::fs::metadata(ancestor).await.is_ok_and(|m| m.is_file()) {
                let conflict = utils::relative_key(ancestor, &folder);
                error!(
                    "Cannot store {:?} in snapshot {}: {:?} is a file",
                    key, self.folder_name, conflict
                );
                return Err(MurphyError::PathConflict {
                    path: key.to_string(),
                    conflict,
                });
            }
        }
        Err(e)
    }

    async fn copy_payload(&self, key: &str, stream: &ReadStream, target: &Path) -> Result<()> {
        self.prepare_parent(key, target).await?;
        if utils::path_exists(target).await {
            warn!("Payload for {:?} already exists in {}, overwriting", key, self.folder_name);
        }

        let bytes = self.queue.copy(stream, target, WriteMode::Truncate).await?;

        trace!("Stored {} bytes for {:?} in {}", bytes, key, self.folder_name);
        Ok(())
    }
}

impl SnapshotBackend for FilesystemSnapshot {
    fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    fn source_label(&self) -> Option<String> {
        self.state.lock().source.clone()
    }

    fn files(&self) -> Vec<String> {
        self.state.lock().index.keys().cloned().collect()
    }

    fn get_file_status(&self, key: &str) -> Option<FileStatus> {
        self.state.lock().index.get(key).map(|info| info.status)
    }

    fn get_file_checksum(&self, key: &str) -> Option<String> {
        self.state.lock().index.get(key).map(|info| info.checksum.clone())
    }

    fn create_read_stream(&self, key: &str) -> Option<ReadStream> {
        if !self.state.lock().index.contains_key(key) {
            return None;
        }
        let path = self.payload_path(key).ok()?;
        Some(self.queue.read_stream(path))
    }

    async fn init(&self) -> Result<()> {
        let folder = self.folder_path();
        if utils::path_exists(&folder).await {
            error!("Snapshot folder already exists: {:?}", folder);
            return Err(MurphyError::SnapshotAlreadyExists(self.folder_name.clone()));
        }

        {
            let mut state = self.state.lock();
            state.source = hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned());
            state.index.clear();
        }

        match tokio::fs::create_dir(&folder).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(MurphyError::SnapshotAlreadyExists(self.folder_name.clone()));
            }
            Err(e) => {
                error!("Error creating snapshot {:?}: {}", folder, e);
                return Err(e.into());
            }
        }

        self.apply().await?;
        debug!("Created snapshot {}", self.folder_name);
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let path = self.index_path();
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            error!("Error loading snapshot index {:?}: {}", path, e);
            e
        })?;
        let parsed: IndexFile = serde_yaml::from_str(&contents).map_err(|e| {
            error!("Error parsing snapshot index {:?}: {}", path, e);
            e
        })?;
        let (source, index) = parsed.parse()?;

        debug!("Loaded snapshot {} ({} entries)", self.folder_name, index.len());
        let mut state = self.state.lock();
        state.source = source;
        state.index = index;
        Ok(())
    }

    async fn write_file(
        &self,
        key: &str,
        status: FileStatus,
        stream: Option<ReadStream>,
        checksum: Option<&str>,
    ) -> Result<()> {
        match status {
            FileStatus::Add | FileStatus::Modify => {
                let (Some(stream), Some(checksum)) = (stream, checksum) else {
                    return Err(MurphyError::MissingContent {
                        path: key.to_string(),
                        status: status.to_string(),
                    });
                };
                let target = self.payload_path(key)?;
                self.state.lock().index.insert(
                    key.to_string(),
                    FileInfo {
                        status,
                        checksum: checksum.to_string(),
                    },
                );

                self.copy_payload(key, &stream, &target).await.map_err(|e| {
                    error!("Error writing {:?} into snapshot {}: {}", key, self.folder_name, e);
                    e
                })
            }
            FileStatus::Delete => {
                let marker = self.marker_path(key)?;
                self.state.lock().index.insert(
                    key.to_string(),
                    FileInfo {
                        status,
                        checksum: String::new(),
                    },
                );

                self.prepare_parent(key, &marker).await?;
                self.queue.write(&marker, b"").await
            }
        }
    }

    async fn apply(&self) -> Result<()> {
        let document = {
            let state = self.state.lock();
            IndexFile::build(state.source.clone(), &state.index)
        };
        let yaml = serde_yaml::to_string(&document)?;
        self.queue.write(self.index_path(), yaml).await.map_err(|e| {
            error!("Error saving snapshot index for {}: {}", self.folder_name, e);
            e
        })
    }
}
