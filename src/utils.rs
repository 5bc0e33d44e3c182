//! Utility functions for Murphy
//!
//! Stream hashing, path keys and small filesystem helpers shared by the
//! source, snapshot and engine modules.
//!
//! ## Path keys
//!
//! Files inside a source or snapshot are identified by a *key*: the path
//! relative to the source's common root, with components joined by `/`
//! regardless of platform. Keys are what snapshot indexes store, so they
//! must stay stable across machines. [`relative_key`] produces them and
//! [`key_to_path`] turns one back into a path under some root.
//!
//! ## Hashing
//!
//! Checksums are SHA-1 hex digests of file content, computed by draining an
//! async reader in fixed-size chunks.

use crate::error::{MurphyError, Result};
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Drain `reader` completely and return the SHA-1 hex digest of its bytes
pub async fn hash_stream<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-1
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether anything (file, directory or dangling link) exists at `path`
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}

/// Create every missing parent directory of `path`
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Remove a file or link if present; a missing path is not an error
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            trace!("Removed {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Create a file symlink at `link` pointing to `target`
#[cfg(unix)]
pub async fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

/// Create a file symlink at `link` pointing to `target` (Windows)
#[cfg(windows)]
pub async fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink_file(target, link).await?;
    Ok(())
}

/// Normalized components of `path`: `.` dropped, trailing separators ignored
pub fn path_segments(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Key of `path` relative to `root`, components joined with `/`
///
/// A path outside of `root` keeps all of its normal components.
pub fn relative_key(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Path of `key` underneath `root`
///
/// Rejects keys that could escape `root` (`..`, absolute segments).
pub fn key_to_path(root: &Path, key: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || Path::new(segment).is_absolute() {
            return Err(MurphyError::InvalidIndex(format!(
                "path {:?} leaves its folder",
                key
            )));
        }
        path.push(segment);
    }
    Ok(path)
}

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
