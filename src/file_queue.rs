//! Bounded admission for OS file handles
//!
//! A single backup may touch tens of thousands of files, and every one of
//! them is read at least twice (checksum, copy) while its stored copy is
//! written and re-read. Issuing all of that at once exhausts the process'
//! file-handle limit long before the disk becomes the bottleneck.
//!
//! [`FileQueue`] is a clonable handle around a semaphore. Every open handle
//! (file or directory listing) holds one permit for exactly as long as the
//! handle is alive, so the number of simultaneously open handles never
//! exceeds [`FileQueue::limit`] no matter how many logical operations are
//! pending. Operations beyond the bound simply wait their turn.
//!
//! ```rust,no_run
//! use murphy::file_queue::FileQueue;
//! use tokio::io::AsyncReadExt;
//!
//! # async fn example() -> murphy::Result<()> {
//! let queue = FileQueue::new(100);
//! let mut file = queue.open("notes.txt").await?;
//! let mut contents = String::new();
//! file.read_to_string(&mut contents).await?;
//! file.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{MurphyError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Default number of simultaneously open handles per queue
pub const DEFAULT_FILE_HANDLE_LIMIT: usize = 100;

/// Smallest usable limit: a copy holds a reader and a writer at once
pub const MIN_FILE_HANDLE_LIMIT: usize = 2;

/// How [`FileQueue::copy`] opens its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create the file or truncate an existing one
    Truncate,
    /// Fail if anything already exists at the target
    CreateNew,
}

#[derive(Debug, Default)]
struct HandleStats {
    open: AtomicUsize,
    peak: AtomicUsize,
}

/// Admission queue bounding concurrently open file handles
#[derive(Clone)]
pub struct FileQueue {
    semaphore: Arc<Semaphore>,
    limit: usize,
    stats: Arc<HandleStats>,
}

impl fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQueue")
            .field("limit", &self.limit)
            .field("open", &self.open_handles())
            .field("peak", &self.peak_handles())
            .finish()
    }
}

impl Default for FileQueue {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_HANDLE_LIMIT)
    }
}

impl FileQueue {
    /// Create a queue admitting at most `limit` open handles (minimum 2)
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(MIN_FILE_HANDLE_LIMIT);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            stats: Arc::new(HandleStats::default()),
        }
    }

    /// Maximum number of simultaneously open handles
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of handles currently open through this queue
    pub fn open_handles(&self) -> usize {
        self.stats.open.load(Ordering::SeqCst)
    }

    /// Highest number of handles that were ever open at the same time
    pub fn peak_handles(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    async fn acquire(&self, permits: u32) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| MurphyError::internal("file queue closed"))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> HandlePermit {
        let open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(open, Ordering::SeqCst);
        HandlePermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        }
    }

    async fn admit(&self) -> Result<HandlePermit> {
        let permit = self.acquire(1).await?;
        Ok(self.track(permit))
    }

    /// Admit the two handles of a copy from `stream` into this queue
    ///
    /// When both sides draw from the same semaphore the permits are taken in
    /// one step; a copy never holds its reader while waiting for its writer.
    async fn admit_pair(&self, stream: &ReadStream) -> Result<(HandlePermit, HandlePermit)> {
        if Arc::ptr_eq(&self.semaphore, &stream.queue.semaphore) {
            let mut both = self.acquire(2).await?;
            let reader = both
                .split(1)
                .ok_or_else(|| MurphyError::internal("file queue permit split"))?;
            return Ok((self.track(reader), self.track(both)));
        }
        let reader = stream.queue.admit().await?;
        let writer = self.admit().await?;
        Ok((reader, writer))
    }

    async fn open_with(path: &Path, permit: HandlePermit) -> Result<QueuedFile> {
        let file = File::open(path).await?;
        trace!("Opened {:?} for reading", path);
        Ok(QueuedFile { file, _permit: permit })
    }

    async fn create_with(path: &Path, mode: WriteMode, permit: HandlePermit) -> Result<QueuedFile> {
        let file = match mode {
            WriteMode::Truncate => File::create(path).await?,
            WriteMode::CreateNew => {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await?
            }
        };
        trace!("Opened {:?} for writing", path);
        Ok(QueuedFile { file, _permit: permit })
    }

    /// Open an existing file for reading
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<QueuedFile> {
        let permit = self.admit().await?;
        Self::open_with(path.as_ref(), permit).await
    }

    /// Create or truncate a file for writing
    pub async fn create(&self, path: impl AsRef<Path>) -> Result<QueuedFile> {
        let permit = self.admit().await?;
        Self::create_with(path.as_ref(), WriteMode::Truncate, permit).await
    }

    /// Create a file for writing, failing if anything already exists at `path`
    pub async fn create_new(&self, path: impl AsRef<Path>) -> Result<QueuedFile> {
        let permit = self.admit().await?;
        Self::create_with(path.as_ref(), WriteMode::CreateNew, permit).await
    }

    /// Write `contents` to `path`, replacing any existing file
    pub async fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let mut file = self.create(path).await?;
        file.write_all(contents.as_ref()).await?;
        file.close().await
    }

    /// Copy everything `stream` yields into a file at `target`
    ///
    /// The reader is admitted by the stream's queue and the writer by this
    /// one. Returns the number of bytes copied.
    pub async fn copy(&self, stream: &ReadStream, target: impl AsRef<Path>, mode: WriteMode) -> Result<u64> {
        let target = target.as_ref();
        let (reader_permit, writer_permit) = self.admit_pair(stream).await?;
        let mut reader = stream.open_with(reader_permit).await?;
        let mut writer = Self::create_with(target, mode, writer_permit).await?;
        let bytes = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.close().await?;
        reader.close().await?;
        Ok(bytes)
    }

    /// List the entries of a directory while holding one handle
    pub async fn read_dir(&self, path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let _permit = self.admit().await?;
        let mut entries = tokio::fs::read_dir(path.as_ref()).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        Ok(paths)
    }

    /// Lazy read stream for `path`; no handle is opened until [`ReadStream::open`]
    pub fn read_stream(&self, path: impl Into<PathBuf>) -> ReadStream {
        ReadStream {
            path: path.into(),
            queue: self.clone(),
        }
    }
}

struct HandlePermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<HandleStats>,
}

impl Drop for HandlePermit {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An open file that holds its admission permit until it is closed or dropped
pub struct QueuedFile {
    // Declared before the permit so the handle closes before the slot frees up.
    file: File,
    _permit: HandlePermit,
}

impl fmt::Debug for QueuedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedFile").field("file", &self.file).finish()
    }
}

impl QueuedFile {
    /// Metadata of the open file
    pub async fn metadata(&self) -> Result<std::fs::Metadata> {
        Ok(self.file.metadata().await?)
    }

    /// Flush pending writes and release the handle
    pub async fn close(mut self) -> Result<()> {
        self.file.flush().await?;
        drop(self);
        Ok(())
    }
}

impl AsyncRead for QueuedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl AsyncWrite for QueuedFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

/// A throttled byte stream that opens its file only when drained
#[derive(Debug, Clone)]
pub struct ReadStream {
    path: PathBuf,
    queue: FileQueue,
}

impl ReadStream {
    /// Absolute path the stream reads from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for admission and open the underlying file
    ///
    /// Fails with [`MurphyError::NotAFile`] for directories and other
    /// non-regular entries.
    pub async fn open(&self) -> Result<QueuedFile> {
        let permit = self.queue.admit().await?;
        self.open_with(permit).await
    }

    async fn open_with(&self, permit: HandlePermit) -> Result<QueuedFile> {
        let file = FileQueue::open_with(&self.path, permit).await?;
        if !file.metadata().await?.is_file() {
            return Err(MurphyError::NotAFile(self.path.clone()));
        }
        Ok(file)
    }
}
