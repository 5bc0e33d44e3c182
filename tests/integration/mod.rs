//! Integration tests for Murphy
//!
//! End-to-end backup and restore scenarios against real folders: status
//! detection across several versions, the latest view, restores of older
//! versions and destination collisions.

use ::murphy::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Source folder, archive and engine wired together
pub struct BackupHarness {
    pub temp_dir: TempDir,
    pub source_dir: PathBuf,
    pub source: Source,
    pub archive: Archive,
    pub engine: Engine,
    last_backup: Option<i64>,
    restores: usize,
}

impl BackupHarness {
    /// Empty source folder and a freshly initialized archive
    pub async fn new() -> Self {
        Self::with_engine(Engine::new()).await
    }

    pub async fn with_engine(engine: Engine) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let source_dir = temp_dir.path().join("Source");
        fs::create_dir_all(&source_dir).unwrap();

        let mut archive: Archive =
            FilesystemArchive::new("Test Archive", temp_dir.path().join("Archive")).into();
        archive.init().await.unwrap();

        Self {
            source: Source::new("Test Source", vec![source_dir.clone()]),
            source_dir,
            temp_dir,
            archive,
            engine,
            last_backup: None,
            restores: 0,
        }
    }

    pub fn archive_path(&self) -> PathBuf {
        self.temp_dir.path().join("Archive")
    }

    pub fn write(&self, key: &str, contents: &str) {
        let path = self.source_dir.join(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    pub fn remove(&self, key: &str) {
        fs::remove_file(self.source_dir.join(key)).unwrap();
    }

    /// Run a backup, first waiting for a new second so every version gets its own folder
    pub async fn backup(&mut self) -> Snapshot {
        self.try_backup().await.unwrap()
    }

    /// Like [`BackupHarness::backup`], handing back the job's error
    pub async fn try_backup(&mut self) -> Result<Snapshot> {
        if let Some(last) = self.last_backup {
            while chrono::Local::now().timestamp() <= last {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            }
        }
        let result = self
            .engine
            .run_backup(&self.source, &mut self.archive, None)
            .await;
        self.last_backup = Some(match &result {
            Ok(snapshot) => snapshot.timestamp().timestamp(),
            Err(_) => chrono::Local::now().timestamp(),
        });
        result
    }

    /// Restore `snapshot` into a new folder and return it
    pub async fn restore(&mut self, snapshot: &Snapshot) -> (PathBuf, Vec<RestoredFile>) {
        self.restores += 1;
        let destination = self.temp_dir.path().join(format!("Restore {}", self.restores));
        let restored = self
            .engine
            .run_restore(&mut self.archive, snapshot, &destination, None)
            .await
            .unwrap();
        (destination, restored)
    }

    /// Relative link path to link target for everything in `Latest/`
    pub fn latest_links(&self) -> BTreeMap<String, PathBuf> {
        let latest = self.archive_path().join("Latest");
        WalkDir::new(&latest)
            .into_iter()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.path_is_symlink())
            .map(|entry| {
                let key = utils::relative_key(entry.path(), &latest);
                (key, fs::read_link(entry.path()).unwrap())
            })
            .collect()
    }
}

/// Relative path to content of every regular file under `root`
pub fn folder_contents(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .into_iter()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            (
                utils::relative_key(entry.path(), root),
                fs::read_to_string(entry.path()).unwrap(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_map(snapshot: &Snapshot) -> BTreeMap<String, FileStatus> {
        snapshot
            .files()
            .into_iter()
            .map(|key| {
                let status = snapshot.get_file_status(&key).unwrap();
                (key, status)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_noop_backup_changes_nothing() {
        let mut harness = BackupHarness::new().await;
        harness.write("folder/file1.txt", "one");
        harness.write("file2.txt", "two");

        let first = harness.backup().await;
        assert_eq!(first.counts(), SnapshotCounts { added: 2, modified: 0, deleted: 0 });
        let links_before = harness.latest_links();
        assert_eq!(links_before.len(), 2);

        let second = harness.backup().await;
        assert!(!second.counts().has_changes());
        assert!(second.files().is_empty());
        assert_eq!(harness.latest_links(), links_before);
    }

    #[tokio::test]
    async fn test_deleted_files_are_recorded() {
        let mut harness = BackupHarness::new().await;
        for key in ["f1.txt", "f2.txt", "sub/f3.txt"] {
            harness.write(key, key);
        }
        harness.backup().await;

        for key in ["f1.txt", "f2.txt", "sub/f3.txt"] {
            harness.remove(key);
        }
        let snapshot = harness.backup().await;

        let expected: BTreeMap<String, FileStatus> = ["f1.txt", "f2.txt", "sub/f3.txt"]
            .into_iter()
            .map(|key| (key.to_string(), FileStatus::Delete))
            .collect();
        assert_eq!(status_map(&snapshot), expected);
        assert!(harness.latest_links().is_empty());

        let folder = harness
            .archive_path()
            .join("Versions")
            .join(snapshot.label());
        assert!(folder.join("sub/f3.txt.deleted").is_file());
        assert!(!folder.join("sub/f3.txt").exists());

        // Deleting again is not a new change
        let third = harness.backup().await;
        assert!(third.files().is_empty());
    }

    #[tokio::test]
    async fn test_returning_file_is_added_again() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "first life");
        harness.backup().await;

        harness.remove("a.txt");
        let deleted = harness.backup().await;
        assert_eq!(deleted.get_file_status("a.txt"), Some(FileStatus::Delete));

        harness.write("a.txt", "second life");
        let returned = harness.backup().await;
        assert_eq!(returned.get_file_status("a.txt"), Some(FileStatus::Add));

        // Same content as before the deletion is still an add
        harness.remove("a.txt");
        harness.backup().await;
        harness.write("a.txt", "second life");
        let again = harness.backup().await;
        assert_eq!(again.get_file_status("a.txt"), Some(FileStatus::Add));
    }

    #[tokio::test]
    async fn test_unchanged_file_is_skipped_until_modified() {
        let mut harness = BackupHarness::new().await;
        harness.write("stable.txt", "never changes");
        harness.write("busy.txt", "v1");
        let first = harness.backup().await;
        assert_eq!(first.get_file_status("stable.txt"), Some(FileStatus::Add));

        for version in ["v2", "v3"] {
            harness.write("busy.txt", version);
            let snapshot = harness.backup().await;
            assert_eq!(snapshot.get_file_status("stable.txt"), None);
            assert_eq!(snapshot.get_file_status("busy.txt"), Some(FileStatus::Modify));
        }

        // Rewriting identical bytes is not a change
        harness.write("stable.txt", "never changes");
        let rewritten = harness.backup().await;
        assert!(rewritten.files().is_empty());

        harness.write("stable.txt", "changed at last");
        let changed = harness.backup().await;
        assert_eq!(changed.files(), vec!["stable.txt"]);
        assert_eq!(changed.get_file_status("stable.txt"), Some(FileStatus::Modify));
    }

    #[tokio::test]
    async fn test_restore_each_version() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "1");
        harness.write("b.txt", "b");
        harness.write("docs/c.txt", "c");
        let v1 = harness.backup().await;

        harness.write("a.txt", "2");
        harness.remove("b.txt");
        let v2 = harness.backup().await;

        let (dest2, restored2) = harness.restore(&v2).await;
        let mut contents = folder_contents(&dest2);
        let summary = contents.remove(RESTORE_SUMMARY_FILE).unwrap();
        assert_eq!(
            contents,
            BTreeMap::from([
                ("a.txt".to_string(), "2".to_string()),
                ("docs/c.txt".to_string(), "c".to_string()),
            ])
        );
        assert_eq!(
            restored2,
            vec![
                RestoredFile { path: "a.txt".to_string(), snapshot: v2.timestamp() },
                RestoredFile { path: "docs/c.txt".to_string(), snapshot: v1.timestamp() },
            ]
        );
        assert!(summary.contains("Test Archive"));
        assert!(summary.contains(&v2.label()));
        assert!(summary.contains(&format!("docs/c.txt  {}", v1.label())));
        assert!(!summary.contains("b.txt"));

        let (dest1, _) = harness.restore(&v1).await;
        let mut contents = folder_contents(&dest1);
        contents.remove(RESTORE_SUMMARY_FILE);
        assert_eq!(
            contents,
            BTreeMap::from([
                ("a.txt".to_string(), "1".to_string()),
                ("b.txt".to_string(), "b".to_string()),
                ("docs/c.txt".to_string(), "c".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn test_restore_refuses_existing_files() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a");
        harness.write("b.txt", "b");
        harness.write("nested/c.txt", "c");
        let snapshot = harness.backup().await;

        let destination = harness.temp_dir.path().join("Occupied");
        fs::create_dir_all(&destination).unwrap();
        fs::write(destination.join("b.txt"), "mine").unwrap();

        let result = harness
            .engine
            .run_restore(&mut harness.archive, &snapshot, &destination, None)
            .await;
        match result {
            Err(MurphyError::DestinationExists(path)) => assert_eq!(path, destination.join("b.txt")),
            other => panic!("expected a collision, got {:?}", other),
        }

        // Nothing else was written
        assert_eq!(
            folder_contents(&destination),
            BTreeMap::from([("b.txt".to_string(), "mine".to_string())])
        );
        assert!(!harness.engine.is_busy());
    }

    #[tokio::test]
    async fn test_restore_refuses_existing_summary() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a");
        let snapshot = harness.backup().await;

        let destination = harness.temp_dir.path().join("Occupied");
        fs::create_dir_all(&destination).unwrap();
        fs::write(destination.join(RESTORE_SUMMARY_FILE), "old").unwrap();

        let result = harness
            .engine
            .run_restore(&mut harness.archive, &snapshot, &destination, None)
            .await;
        assert!(matches!(result, Err(MurphyError::DestinationExists(_))));
        assert!(!destination.join("a.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_latest_points_at_newest_content() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a1");
        harness.write("deep/er/b.txt", "b1");
        let v1 = harness.backup().await;
        harness.write("a.txt", "a2");
        let v2 = harness.backup().await;

        let links = harness.latest_links();
        assert_eq!(
            links["a.txt"],
            PathBuf::from(format!("../Versions/{}/a.txt", v2.label()))
        );
        assert_eq!(
            links["deep/er/b.txt"],
            PathBuf::from(format!("../../../Versions/{}/deep/er/b.txt", v1.label()))
        );

        let latest = harness.archive_path().join("Latest");
        assert_eq!(fs::read_to_string(latest.join("a.txt")).unwrap(), "a2");
        assert_eq!(fs::read_to_string(latest.join("deep/er/b.txt")).unwrap(), "b1");
    }

    #[tokio::test]
    async fn test_reopened_archive_sees_history() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a");
        let first = harness.backup().await;

        // A fresh archive value has no cache and reads Versions/ from disk
        let json = harness.archive.to_json().unwrap();
        harness.archive = Archive::from_json(json).unwrap();
        let versions = harness.archive.get_versions().await.unwrap();
        assert_eq!(versions, vec![first.clone()]);
        assert_eq!(versions[0].get_file_checksum("a.txt"), first.get_file_checksum("a.txt"));
        assert!(versions[0].source_label().is_some());

        let second = harness.backup().await;
        assert!(second.files().is_empty());
    }

    #[tokio::test]
    async fn test_multiple_source_roots() {
        let temp_dir = TempDir::new().unwrap();
        let docs = temp_dir.path().join("home/docs");
        let pics = temp_dir.path().join("home/pics");
        fs::create_dir_all(&docs).unwrap();
        fs::create_dir_all(&pics).unwrap();
        fs::write(docs.join("cv.txt"), "cv").unwrap();
        fs::write(pics.join("cat.jpg"), "meow").unwrap();
        fs::write(temp_dir.path().join("home/unrelated.txt"), "x").unwrap();

        let source = Source::new("Home", vec![docs, pics]);
        let mut archive: Archive =
            FilesystemArchive::new("Archive", temp_dir.path().join("Archive")).into();
        archive.init().await.unwrap();

        let engine = Engine::new();
        let snapshot = engine.run_backup(&source, &mut archive, None).await.unwrap();
        assert_eq!(snapshot.files(), vec!["docs/cv.txt", "pics/cat.jpg"]);

        let destination = temp_dir.path().join("Restore");
        engine
            .run_restore(&mut archive, &snapshot, &destination, None)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(destination.join("pics/cat.jpg")).unwrap(), "meow");
    }

    #[tokio::test]
    async fn test_enumeration_failure_aborts_backup() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a");
        harness.source = Source::new(
            "Broken",
            vec![harness.source_dir.clone(), harness.temp_dir.path().join("missing")],
        );

        let result = harness
            .engine
            .run_backup(&harness.source, &mut harness.archive, None)
            .await;
        match result {
            Err(MurphyError::Enumeration(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("missing"));
            }
            other => panic!("expected an enumeration failure, got {:?}", other),
        }
        assert!(!harness.engine.is_busy());
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_restore() {
        let mut harness = BackupHarness::new().await;
        harness.write("folder/a.txt", "original");
        harness.write("b.txt", "untouched");
        let snapshot = harness.backup().await;

        let payload = harness
            .archive_path()
            .join("Versions")
            .join(snapshot.label())
            .join("folder/a.txt");
        fs::write(&payload, "tampered").unwrap();

        let destination = harness.temp_dir.path().join("Restore");
        let err = harness
            .engine
            .run_restore(&mut harness.archive, &snapshot, &destination, None)
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        match err {
            MurphyError::ChecksumMismatch { path, expected, actual } => {
                assert_eq!(path, "folder/a.txt");
                assert_eq!(expected, utils::hash_data(b"original"));
                assert_eq!(actual, utils::hash_data(b"tampered"));
            }
            other => panic!("expected a checksum mismatch, got {:?}", other),
        }
        assert!(!harness.engine.is_busy());
    }

    #[tokio::test]
    async fn test_folder_replaced_by_file_names_the_conflict() {
        let mut harness = BackupHarness::new().await;
        harness.write("a/b.txt", "inside");
        harness.backup().await;

        fs::remove_dir_all(harness.source_dir.join("a")).unwrap();
        harness.write("a", "now a file");
        let err = harness.try_backup().await.unwrap_err();

        match &err {
            MurphyError::PathConflict { path, conflict } => {
                assert_eq!(path, "a/b.txt");
                assert_eq!(conflict, "a");
            }
            other => panic!("expected a path conflict, got {:?}", other),
        }
        assert!(err.user_message().contains("a/b.txt"));
        assert!(!harness.engine.is_busy());
    }
}
