//! # Murphy - Incremental folder backups
//!
//! Murphy backs up named sets of folders into archives of timestamped
//! snapshots and restores any of them, file for file, into a fresh folder.
//!
//! ## Overview
//!
//! - A [`Source`] names the folders to back up.
//! - An [`Archive`] stores [`Snapshot`]s. Each snapshot only contains what
//!   changed since the previous ones: added and modified files with their
//!   content, deleted files as markers.
//! - The [`Engine`] runs backups and restores, one at a time, reporting
//!   progress through an optional callback.
//!
//! Files are compared by SHA-1 checksum, so touching a file without
//! changing it does not store a new copy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use murphy::{Archive, Engine, FilesystemArchive, Source};
//! use std::path::PathBuf;
//!
//! # async fn example() -> murphy::Result<()> {
//! let source = Source::new("Documents", vec![PathBuf::from("/home/me/Documents")]);
//! let mut archive: Archive =
//!     FilesystemArchive::new("USB drive", PathBuf::from("/media/usb/Backup")).into();
//! archive.init().await?;
//!
//! let engine = Engine::new();
//! let snapshot = engine.run_backup(&source, &mut archive, None).await?;
//! println!("{} files changed", snapshot.counts().stored());
//!
//! engine
//!     .run_restore(&mut archive, &snapshot, &PathBuf::from("/tmp/restore"), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Filesystem archives
//!
//! A [`FilesystemArchive`] is an ordinary folder:
//!
//! ```text
//! USB drive/
//! ├── READ ME.txt
//! ├── Latest/                      links to the newest copy of every file
//! └── Versions/
//!     └── 2018-01-11 05-00-00/     one folder per backup
//!         ├── .index               YAML: source, add, modify, delete
//!         ├── notes/todo.txt       content of added or modified files
//!         └── old.txt.deleted      marker for a deleted file
//! ```
//!
//! Nothing in it needs Murphy to be read back: `Latest/` can be browsed and
//! copied from directly.
//!
//! ## Resource usage
//!
//! Reads and writes go through a [`FileQueue`](file_queue::FileQueue) that
//! caps the number of simultaneously open file handles (100 by default),
//! however many files a backup touches.

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_queue;
pub mod fs_archive;
pub mod fs_snapshot;
pub mod progress;
pub mod source;
pub mod types;
pub mod utils;

pub use archive::{Archive, ArchiveBackend, Snapshot, SnapshotBackend};
pub use config::Config;
pub use engine::{Engine, EngineBuilder, RESTORE_SUMMARY_FILE};
pub use error::{MurphyError, Result};
pub use file_queue::{FileQueue, ReadStream};
pub use fs_archive::FilesystemArchive;
pub use fs_snapshot::FilesystemSnapshot;
pub use progress::Progress;
pub use source::Source;
pub use types::*;
