//! Main test module for Murphy
//!
//! This module includes all test suites:
//! - Integration tests for backup and restore scenarios
//! - Property-based tests for invariants
//! - Edge cases around concurrency and resource limits

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use super::integration::{folder_contents, BackupHarness};
    use ::murphy::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_handles_are_throttled() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("file.txt"), "throttle me").unwrap();
        let queue = FileQueue::new(100);
        let source = Source::with_file_queue("Many reads", vec![temp_dir.path().to_path_buf()], queue.clone());

        let tasks: Vec<_> = (0..15_001)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.get_file_checksum("file.txt").await })
            })
            .collect();

        let expected = utils::hash_data(b"throttle me");
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), expected);
        }

        assert!(queue.peak_handles() <= 100, "peak was {}", queue.peak_handles());
        assert!(queue.peak_handles() > 1);
        assert_eq!(queue.open_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_queue_for_everything_does_not_stall() {
        let engine = EngineBuilder::new()
            .diff_workers(8)
            .file_handle_limit(4)
            .build()
            .unwrap();
        let queue = engine.file_queue().clone();

        let temp_dir = TempDir::new().unwrap();
        let source_dir = temp_dir.path().join("Source");
        fs::create_dir_all(&source_dir).unwrap();
        for i in 0..16 {
            fs::write(source_dir.join(format!("file{}.txt", i)), i.to_string()).unwrap();
        }
        let source = Source::with_file_queue("Shared", vec![source_dir], queue.clone());
        let mut archive: Archive = FilesystemArchive::new("Shared", temp_dir.path().join("Archive"))
            .with_file_queue(queue.clone())
            .into();
        archive.init().await.unwrap();

        let limit = std::time::Duration::from_secs(30);
        let snapshot = tokio::time::timeout(limit, engine.run_backup(&source, &mut archive, None))
            .await
            .expect("backup stalled")
            .unwrap();
        assert_eq!(snapshot.files().len(), 16);

        let destination = temp_dir.path().join("Restore");
        let restored = tokio::time::timeout(
            limit,
            engine.run_restore(&mut archive, &snapshot, &destination, None),
        )
        .await
        .expect("restore stalled")
        .unwrap();
        assert_eq!(restored.len(), 16);
        assert_eq!(folder_contents(&destination)["file7.txt"], "7");

        assert!(queue.peak_handles() <= 4, "peak was {}", queue.peak_handles());
        assert_eq!(queue.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_second_job_is_rejected() {
        let mut harness = BackupHarness::new().await;
        harness.write("a.txt", "a");
        let mut other: Archive =
            FilesystemArchive::new("Other", harness.temp_dir.path().join("Other")).into();
        other.init().await.unwrap();

        let (first, second) = tokio::join!(
            harness.engine.run_backup(&harness.source, &mut harness.archive, None),
            harness.engine.run_backup(&harness.source, &mut other, None),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(MurphyError::JobInProgress)));
        assert!(second.unwrap_err().is_precondition());

        // The guard is gone once the first job finishes
        assert!(!harness.engine.is_busy());
        let snapshot = harness.engine.run_backup(&harness.source, &mut other, None).await.unwrap();
        assert_eq!(snapshot.files(), vec!["a.txt"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_is_monotonic_and_completes() {
        let mut harness = BackupHarness::new().await;
        for i in 0..50 {
            harness.write(&format!("dir{}/file{}.txt", i % 5, i), &i.to_string());
        }
        let seen = Arc::new(Mutex::new(Vec::<(f64, String)>::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |value, message| {
            sink.lock().push((value, message.to_string()));
        });

        let snapshot = harness
            .engine
            .run_backup(&harness.source, &mut harness.archive, Some(callback.clone()))
            .await
            .unwrap();
        {
            let seen = seen.lock();
            assert!(seen.iter().all(|(v, _)| (0.0..=1.0).contains(v)));
            assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0 + 1e-9));
            assert_eq!(seen.last().unwrap(), &(1.0, "Done".to_string()));
        }

        seen.lock().clear();
        let destination = harness.temp_dir.path().join("Restore");
        harness
            .engine
            .run_restore(&mut harness.archive, &snapshot, &destination, Some(callback))
            .await
            .unwrap();
        let seen = seen.lock();
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0 + 1e-9));
        assert_eq!(seen.last().unwrap(), &(1.0, "Done".to_string()));
    }

    #[tokio::test]
    async fn test_slow_progress_consumer_does_not_stall() {
        let mut harness = BackupHarness::new().await;
        for i in 0..200 {
            harness.write(&format!("file{}.txt", i), "x");
        }
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let callback: ProgressCallback = Arc::new(move |_, _| {
            *counter.lock() += 1;
            std::thread::sleep(std::time::Duration::from_millis(5));
        });

        harness
            .engine
            .run_backup(&harness.source, &mut harness.archive, Some(callback))
            .await
            .unwrap();
        // Never more than one call per update
        let calls = *calls.lock();
        assert!(calls >= 1);
        assert!(calls < 220);
    }

    #[tokio::test]
    async fn test_unicode_and_special_names() {
        let mut harness = BackupHarness::new().await;
        let names = [
            "file with spaces.txt",
            "file@with#special$chars.txt",
            "файл.txt",
            "文件/ファイル.txt",
            "🚀🌟💾.txt",
        ];
        let mut created = Vec::new();
        for name in names {
            let path = harness.source_dir.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            if fs::write(&path, format!("content of {}", name)).is_ok() {
                created.push(name);
            }
        }

        let snapshot = harness.backup().await;
        assert_eq!(snapshot.files().len(), created.len());

        let (destination, _) = harness.restore(&snapshot).await;
        let contents = folder_contents(&destination);
        for name in created {
            assert_eq!(contents[name], format!("content of {}", name));
        }
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut harness = BackupHarness::new().await;
        let snapshot = harness.backup().await;
        assert!(snapshot.files().is_empty());

        let (destination, restored) = harness.restore(&snapshot).await;
        assert!(restored.is_empty());
        assert!(destination.join(RESTORE_SUMMARY_FILE).is_file());
    }
}
