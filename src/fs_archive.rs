//! Archives stored as plain folders
//!
//! A [`FilesystemArchive`] keeps every snapshot as a timestamped folder and
//! materializes the newest content of every file as a tree of relative
//! symbolic links, so the archive can be browsed and restored by hand
//! without Murphy:
//!
//! ```text
//! My Backup/
//! ├── READ ME.txt
//! ├── Latest/
//! │   └── folder/file1.txt -> ../../Versions/2018-01-12 05-00-00/folder/file1.txt
//! └── Versions/
//!     ├── 2018-01-11 05-00-00/
//!     └── 2018-01-12 05-00-00/
//! ```
//!
//! ## Version cache
//!
//! The loaded snapshots are cached on the archive. The cache is filled by the
//! first [`get_versions`](ArchiveBackend::get_versions), extended by
//! [`create_version`](ArchiveBackend::create_version) and never invalidated
//! otherwise. Folders added to `Versions/` by another process afterwards are
//! not seen by this instance.

use crate::archive::{ArchiveBackend, Snapshot, SnapshotBackend};
use crate::error::{MurphyError, Result};
use crate::file_queue::FileQueue;
use crate::fs_snapshot::{FilesystemSnapshot, VERSIONS_FOLDER};
use crate::types::FileStatus;
use crate::utils;
use chrono::Local;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, trace, warn};

/// Folder holding the link farm, relative to the archive root
pub const LATEST_FOLDER: &str = "Latest";
/// Instructions written once when the archive is created
pub const README_FILE: &str = "READ ME.txt";

const README_BODY: &str = "\
This folder is a Murphy backup archive.

Latest/
    The most recent copy of every backed up file, in its original folder
    structure. Browse it like any other folder and copy out what you need.

Versions/
    One folder per backup, named after the date and time it was taken.
    Each one only holds the files that backup added or changed. A file
    ending in \".deleted\" marks a file that had been removed from the
    backed up folders at that time.

Everything in Latest/ is a link into Versions/. Copy files out of the
archive, never move or edit them in place, and do not rename or delete
anything inside Versions/.
";

/// Archive living in a folder on a local or mounted filesystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemArchive {
    name: String,
    path: PathBuf,
    #[serde(skip)]
    versions: Option<Vec<Arc<FilesystemSnapshot>>>,
    #[serde(skip)]
    queue: FileQueue,
}

impl PartialEq for FilesystemArchive {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.path == other.path
    }
}

impl FilesystemArchive {
    /// Describe an archive at `path`; nothing is touched on disk
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
            versions: None,
            queue: FileQueue::default(),
        }
    }

    /// Admit the archive's file handles through `queue`
    pub fn with_file_queue(mut self, queue: FileQueue) -> Self {
        self.queue = queue;
        self
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive root folder
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the link farm
    pub fn latest_path(&self) -> PathBuf {
        self.path.join(LATEST_FOLDER)
    }

    /// Root of the snapshot folders
    pub fn versions_path(&self) -> PathBuf {
        self.path.join(VERSIONS_FOLDER)
    }

    async fn write_readme(&self) -> Result<()> {
        let header = format!(
            "{}\nCreated {}\n\n",
            self.name,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let mut file = self.queue.create_new(self.path.join(README_FILE)).await?;
        file.write_all(header.as_bytes()).await?;
        file.write_all(README_BODY.as_bytes()).await?;
        file.close().await
    }

    async fn load_versions(&self) -> Result<Vec<Arc<FilesystemSnapshot>>> {
        let mut snapshots = Vec::new();
        for entry in self.queue.read_dir(self.versions_path()).await? {
            let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !tokio::fs::metadata(&entry).await.map(|m| m.is_dir()).unwrap_or(false) {
                trace!("Ignoring {:?} in versions folder", entry);
                continue;
            }
            match FilesystemSnapshot::from_folder_name(name, self.path.clone(), self.queue.clone()) {
                Some(snapshot) => snapshots.push(Arc::new(snapshot)),
                None => warn!("Skipping unrecognized version folder {:?}", entry),
            }
        }
        snapshots.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));

        let concurrency = self.queue.limit();
        stream::iter(snapshots)
            .map(|snapshot| async move {
                snapshot.load().await?;
                Ok::<_, MurphyError>(snapshot)
            })
            .buffered(concurrency)
            .try_collect()
            .await
    }

    async fn link_latest(&self, key: &str, folder_name: &str, status: FileStatus) -> Result<()> {
        let link = utils::key_to_path(&self.latest_path(), key)?;
        utils::remove_file_if_exists(&link).await?;
        if !status.has_content() {
            return Ok(());
        }

        utils::ensure_parent_dir(&link).await?;
        let target = latest_link_target(key, folder_name);
        utils::create_symlink(&target, &link).await.map_err(|e| {
            error!("Error linking {:?} to {:?}: {}", link, target, e);
            e
        })
    }
}

/// Relative target for the link of `key` in `Latest/`
fn latest_link_target(key: &str, folder_name: &str) -> PathBuf {
    let depth = key.split('/').filter(|s| !s.is_empty()).count();
    let mut target = PathBuf::new();
    for _ in 0..depth {
        target.push("..");
    }
    target.push(VERSIONS_FOLDER);
    target.push(folder_name);
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        target.push(segment);
    }
    target
}

impl ArchiveBackend for FilesystemArchive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<()> {
        if utils::path_exists(&self.path).await {
            error!("Archive location already exists: {:?}", self.path);
            return Err(MurphyError::ArchiveAlreadyExists(self.path.clone()));
        }

        tokio::fs::create_dir_all(&self.path).await?;
        tokio::fs::create_dir(self.latest_path()).await?;
        tokio::fs::create_dir(self.versions_path()).await?;
        self.write_readme().await?;
        self.versions = Some(Vec::new());

        info!("Created archive {:?} at {:?}", self.name, self.path);
        Ok(())
    }

    async fn rebuild(&mut self) -> Result<()> {
        let versions = self.get_versions().await?;

        // Newest snapshot touching a key decides its link
        let mut newest: BTreeMap<String, (String, FileStatus)> = BTreeMap::new();
        for snapshot in &versions {
            let Snapshot::Filesystem(snapshot) = snapshot;
            for key in snapshot.files() {
                if newest.contains_key(&key) {
                    continue;
                }
                if let Some(status) = snapshot.get_file_status(&key) {
                    newest.insert(key, (snapshot.folder_name().to_string(), status));
                }
            }
        }

        debug!("Rebuilding {} latest entries for {:?}", newest.len(), self.name);
        tokio::fs::create_dir_all(self.latest_path()).await?;
        let this = &*self;
        stream::iter(newest.into_iter().map(Ok::<_, MurphyError>))
            .try_for_each_concurrent(self.queue.limit(), |(key, (folder, status))| async move {
                this.link_latest(&key, &folder, status).await
            })
            .await?;

        info!("Rebuilt latest view of {:?}", self.name);
        Ok(())
    }

    async fn create_version(&mut self) -> Result<Snapshot> {
        let snapshot = Arc::new(FilesystemSnapshot::new(
            Local::now(),
            self.path.clone(),
            self.queue.clone(),
        ));
        snapshot.init().await?;

        if let Some(versions) = self.versions.as_mut() {
            versions.insert(0, Arc::clone(&snapshot));
        }
        info!("Created version {} in {:?}", snapshot.folder_name(), self.name);
        Ok(Snapshot::Filesystem(snapshot))
    }

    async fn get_versions(&mut self) -> Result<Vec<Snapshot>> {
        let versions = match &self.versions {
            Some(cached) => cached.clone(),
            None => {
                let loaded = self.load_versions().await.map_err(|e| {
                    error!("Error reading versions of {:?}: {}", self.name, e);
                    e
                })?;
                debug!("Loaded {} versions of {:?}", loaded.len(), self.name);
                self.versions = Some(loaded.clone());
                loaded
            }
        };
        Ok(versions.into_iter().map(Snapshot::Filesystem).collect())
    }
}
