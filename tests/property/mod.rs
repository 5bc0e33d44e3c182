//! Property-based testing for Murphy
//!
//! Uses proptest to check invariants of the common-root computation, the
//! weighted progress tracker and whole backup/restore cycles over randomly
//! generated file trees.

use super::integration::{folder_contents, BackupHarness};
use ::murphy::source::common_root;
use ::murphy::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Absolute paths made of a few short segments drawn from a small alphabet
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    prop::collection::vec("[ab]{1,2}", 1..5).prop_map(|segments| {
        let mut path = PathBuf::from("/");
        for segment in segments {
            path.push(segment);
        }
        path
    })
}

fn segments(path: &Path) -> Vec<Component<'_>> {
    path.components().collect()
}

/// Relative keys for generated source trees
fn key_strategy() -> impl Strategy<Value = String> {
    (prop::collection::vec("dir[0-2]", 0..3), "file[0-5]\\.txt").prop_map(|(dirs, file)| {
        let mut parts = dirs;
        parts.push(file);
        parts.join("/")
    })
}

/// One round of changes: key -> Some(content) to write, None to delete
fn round_strategy() -> impl Strategy<Value = BTreeMap<String, Option<String>>> {
    prop::collection::btree_map(key_strategy(), prop::option::of("[a-c]{0,3}"), 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The common root is a whole-segment prefix of every path, and no longer one exists
    #[test]
    fn common_root_is_longest_segment_prefix(
        paths in prop::collection::vec(path_strategy(), 1..5)
    ) {
        let root = common_root(&paths);
        let root_segments: Vec<_> = root.components().collect();

        for path in &paths {
            prop_assert!(segments(path).starts_with(&root_segments));
        }

        let first = segments(&paths[0]);
        if let Some(next) = first.get(root_segments.len()) {
            let all_share_next = paths
                .iter()
                .all(|p| segments(p).get(root_segments.len()) == Some(next));
            prop_assert!(!all_share_next);
        }
    }

    /// Progress never leaves 0..=1 and never goes backwards when advancing
    #[test]
    fn progress_stays_in_bounds(
        weights in prop::collection::vec(1u32..10, 1..8),
        fractions in prop::collection::vec(0.0f64..=1.0, 1..8)
    ) {
        let total: u32 = weights.iter().sum();
        let steps: Vec<(String, f64)> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| (format!("step{}", i), *w as f64 / total as f64))
            .collect();
        let mut progress = Progress::new(steps);

        let mut previous = progress.value();
        for fraction in &fractions {
            progress.current(*fraction);
            let value = progress.value();
            prop_assert!((0.0..=1.0 + 1e-9).contains(&value));
            progress.advance();
            prop_assert!(progress.value() + 1e-9 >= value);
            prop_assert!(progress.value() + 1e-9 >= previous);
            previous = progress.value();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    /// Restoring any version reproduces the source exactly as it was backed up
    #[test]
    fn restore_reproduces_each_backup(
        rounds in prop::collection::vec(round_strategy(), 1..4)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut harness = BackupHarness::new().await;
            let mut expected_states = Vec::new();

            for round in &rounds {
                for (key, content) in round {
                    let path = harness.source_dir.join(key);
                    match content {
                        Some(content) => harness.write(key, content),
                        None if path.is_file() => harness.remove(key),
                        None => {}
                    }
                }
                let snapshot = harness.backup().await;
                expected_states.push((snapshot, folder_contents(&harness.source_dir)));
            }

            for (snapshot, expected) in &expected_states {
                let (destination, restored) = harness.restore(snapshot).await;
                let mut contents = folder_contents(&destination);
                contents.remove(RESTORE_SUMMARY_FILE);
                assert_eq!(&contents, expected);
                assert_eq!(restored.len(), expected.len());
            }
        });
    }
}
