//! Filesystem semantics required by the queue core.
//!
//! The queue does not talk to the operating system directly. Everything it
//! needs from a filesystem is captured by the [FileDriver] trait: atomic
//! whole-file reads and writes that survive torn writes, an exclusive lock
//! file that can distinguish a live owner from a stale one, two-phase
//! deletion that defers irreversible work until after a transaction commits,
//! and random-access [File] handles for data files and the transaction log.
//!
//! Two implementations are provided:
//!
//! - [disk::Disk] persists to a real directory using `tokio::fs` and is the
//!   production backend.
//! - [memory::Memory] keeps everything in a shared map and models an abrupt
//!   crash by discarding bytes that were never synced. It also exposes raw
//!   access to stored contents so tests can corrupt state precisely.
//!
//! # Atomic Writes
//!
//! [FileDriver::atomic_write] renames the current file to a `.old_copy`
//! backup, writes a fresh replacement, flushes it to disk, and only then
//! deletes the backup. A crash at any point leaves either a complete
//! primary, a complete backup, or both; [FileDriver::atomic_read] reconciles
//! by preferring the primary (the backup is stale once the primary exists)
//! and restoring the backup as the primary when the crash struck between
//! the rename and the fresh create.
//!
//! # Locking
//!
//! [FileDriver::lock] creates the lock file exclusively. If the file already
//! exists its [LockFileData] contents decide the outcome: the same process
//! is refused outright, a live foreign process whose start time matches is
//! refused as contention, and anything else is a stale lock that is deleted
//! and re-acquired.
//!
//! # Serialization
//!
//! Every mutating driver operation takes a single driver-wide async mutex at
//! its entry point and releases it before returning. Helpers below that
//! level never lock, so there is no re-entrancy to manage.

pub mod disk;
pub mod memory;

use bytes::{Buf, BufMut};
use std::{future::Future, io};
use thiserror::Error;

/// Suffix of the backup file maintained by [FileDriver::atomic_write].
pub const OLD_COPY_SUFFIX: &str = ".old_copy";

/// Infix of files renamed by [FileDriver::prepare_delete] while they await
/// [FileDriver::finalise].
pub const DELETED_INFIX: &str = ".deleted.";

/// How many times transient I/O is attempted before the error surfaces.
pub(crate) const RETRY_ATTEMPTS: u64 = 10;

/// Base of the linear backoff between retries (attempt `i` waits `i` times
/// this long).
pub(crate) const RETRY_BACKOFF_MS: u64 = 100;

/// Errors that can occur when interacting with a [FileDriver].
#[derive(Debug, Error)]
pub enum Error {
    #[error("open failed for {0}: {1}")]
    OpenFailed(String, #[source] io::Error),
    #[error("read failed for {0}: {1}")]
    ReadFailed(String, #[source] io::Error),
    #[error("write failed for {0}: {1}")]
    WriteFailed(String, #[source] io::Error),
    #[error("sync failed for {0}: {1}")]
    SyncFailed(String, #[source] io::Error),
    #[error("rename failed for {0}: {1}")]
    RenameFailed(String, #[source] io::Error),
    #[error("delete failed for {0}: {1}")]
    DeleteFailed(String, #[source] io::Error),
    #[error("scan failed: {0}")]
    ScanFailed(#[source] io::Error),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("read past end of {0}")]
    InsufficientLength(String),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("queue directory is locked by this thread")]
    LockedByThisThread,
    #[error("queue directory is locked by thread {0} of this process")]
    LockedByThisProcess(i32),
    #[error("queue directory is locked by running process {0}")]
    LockedByLiveProcess(i32),
}

impl Error {
    /// Whether the error is lock contention that may clear if the caller
    /// retries later.
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            Self::LockedByThisThread | Self::LockedByThisProcess(_) | Self::LockedByLiveProcess(_)
        )
    }
}

/// Identity of a lock holder, persisted as the contents of the lock file.
///
/// Serialized as 16 little-endian bytes: `process_id` (i32), `thread_id`
/// (i32), `process_start_time_ms` (i64). The start time disambiguates a
/// recycled pid: a lock naming a running process with a different start
/// time belonged to a previous incarnation and is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockFileData {
    pub process_id: i32,
    pub thread_id: i32,
    pub process_start_time_ms: i64,
}

impl LockFileData {
    /// Serialized size in bytes.
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_i32_le(self.process_id);
        buf.put_i32_le(self.thread_id);
        buf.put_i64_le(self.process_start_time_ms);
        buf
    }

    /// Decode from lock file contents. Returns `None` when the contents are
    /// not exactly [Self::SIZE] bytes (a torn or foreign lock file, which
    /// callers treat as stale).
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            process_id: buf.get_i32_le(),
            thread_id: buf.get_i32_le(),
            process_start_time_ms: buf.get_i64_le(),
        })
    }
}

/// Guard holding the queue lock.
///
/// [Lock::release] removes the lock file and completes once the removal is
/// durable. A guard dropped without release must still free the lock, but
/// only best-effort and without blocking the dropping thread (drops can run
/// on an async worker).
pub trait Lock: Send + Sync + 'static {
    /// Release the lock, removing its file.
    fn release(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A random-access handle to one file in the queue directory.
///
/// Writes become durable only after [File::sync] returns. Handles are cheap
/// to clone and clones share the same underlying file.
pub trait File: Clone + Send + Sync + 'static {
    /// Fill `buf` from the bytes at `offset`, returning it. Fails with
    /// [Error::InsufficientLength] if the file ends before `buf` is full.
    fn read_at(&self, buf: Vec<u8>, offset: u64) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `buf` at `offset`, extending the file as needed.
    fn write_at(&self, buf: Vec<u8>, offset: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Flush all written bytes to durable storage.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Abstract filesystem scoped to a single queue directory.
///
/// Names are flat (no separators); the driver maps them onto its backing
/// store. All mutating operations serialize on a driver-wide lock.
pub trait FileDriver: Clone + Send + Sync + 'static {
    type File: File;

    /// Guard holding the queue lock. Released explicitly via
    /// [Lock::release]; dropping without releasing falls back to
    /// best-effort background cleanup.
    type Lock: Lock;

    /// Read the full contents of `name`, reconciling any `.old_copy` left
    /// by an interrupted [FileDriver::atomic_write]. Returns `None` when
    /// neither the primary nor a backup exists.
    fn atomic_read(&self, name: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Error>> + Send;

    /// Replace the contents of `name` with `contents` such that a crash at
    /// any point leaves a recoverable copy of either the old or the new
    /// contents.
    fn atomic_write(&self, name: &str, contents: Vec<u8>) -> impl Future<Output = Result<(), Error>> + Send;

    /// Acquire the exclusive queue lock, replacing a stale one if the
    /// recorded owner is no longer running.
    fn lock(&self, name: &str) -> impl Future<Output = Result<Self::Lock, Error>> + Send;

    /// Open `name` for random access, creating it when absent. Returns the
    /// handle and the current file size.
    fn open(&self, name: &str) -> impl Future<Output = Result<(Self::File, u64), Error>> + Send;

    /// List the names of all files in the queue directory.
    fn scan(&self) -> impl Future<Output = Result<Vec<String>, Error>> + Send;

    /// First phase of deletion: move `name` aside under a unique suffix and
    /// remember it. The file stays on disk until [FileDriver::finalise].
    fn prepare_delete(&self, name: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Second phase of deletion: delete everything prepared so far, in
    /// order. Names that fail to delete remain pending for a later pass.
    fn finalise(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Delete `name` immediately. Used only to sweep orphans left by a
    /// crash between the two deletion phases.
    fn remove(&self, name: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Reject names that could escape the queue directory or collide with the
/// driver's own bookkeeping suffixes.
pub(crate) fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == ".."
        || name.ends_with(OLD_COPY_SUFFIX)
    {
        return Err(Error::InvalidName(name.into()));
    }
    Ok(())
}

/// Name of the `.old_copy` backup for `name`.
pub(crate) fn old_copy(name: &str) -> String {
    format!("{name}{OLD_COPY_SUFFIX}")
}
