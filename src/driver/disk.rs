//! Production [FileDriver] backed by a directory on the local filesystem.

use super::{
    old_copy, validate_name, Error, FileDriver, LockFileData, DELETED_INFIX, OLD_COPY_SUFFIX,
    RETRY_ATTEMPTS, RETRY_BACKOFF_MS,
};
use std::{
    io::ErrorKind,
    mem,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use sysinfo::{Pid, System};
use tokio::{fs, sync::Mutex, task, time};
use tracing::{debug, warn};

/// Configuration for [Disk].
#[derive(Clone)]
pub struct Config {
    /// Directory holding the queue's files. Created on first use.
    pub directory: PathBuf,
}

/// Filesystem driver over `tokio::fs`.
///
/// A single process-wide mutex (per driver value) serializes every mutating
/// operation; [super::File] handles read and write without taking it, the
/// same split the queue relies on for concurrent payload reads.
#[derive(Clone)]
pub struct Disk {
    directory: Arc<PathBuf>,
    guard: Arc<Mutex<Pending>>,
}

/// Deletions prepared but not yet finalised, in preparation order.
struct Pending {
    deletes: Vec<PathBuf>,
    sequence: u64,
}

impl Disk {
    pub fn new(cfg: Config) -> Self {
        Self {
            directory: Arc::new(cfg.directory),
            guard: Arc::new(Mutex::new(Pending {
                deletes: Vec::new(),
                sequence: 0,
            })),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    /// Reconcile an interrupted atomic write. With both files present the
    /// primary is the newer one and the backup is discarded; with only the
    /// backup present the crash struck before the fresh create and the
    /// backup still holds the authoritative contents.
    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let primary = self.path(name);
        let backup = self.path(&old_copy(name));
        if !fs::try_exists(&backup)
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?
        {
            return Ok(());
        }
        if fs::try_exists(&primary)
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?
        {
            warn!(name, "removing stale {OLD_COPY_SUFFIX} backup");
            fs::remove_file(&backup)
                .await
                .map_err(|e| Error::DeleteFailed(name.into(), e))?;
        } else {
            warn!(name, "restoring {OLD_COPY_SUFFIX} backup as primary");
            fs::rename(&backup, &primary)
                .await
                .map_err(|e| Error::RenameFailed(name.into(), e))?;
        }
        sync_dir(&self.directory).await
    }

    /// One attempt at [FileDriver::atomic_read].
    async fn try_atomic_read(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        self.reconcile(name).await?;
        match fs::read(self.path(name)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::ReadFailed(name.into(), e)),
        }
    }

    /// One attempt at [FileDriver::atomic_write]. Restartable at every
    /// step: a backup left by an earlier failed attempt still holds the
    /// authoritative previous contents and is kept in place.
    async fn try_atomic_write(&self, name: &str, contents: &[u8]) -> Result<(), Error> {
        let primary = self.path(name);
        let backup = self.path(&old_copy(name));
        let have_primary = fs::try_exists(&primary)
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        let have_backup = fs::try_exists(&backup)
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        if have_primary && !have_backup {
            fs::rename(&primary, &backup)
                .await
                .map_err(|e| Error::RenameFailed(name.into(), e))?;
        }
        fs::create_dir_all(self.directory.as_ref())
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        let mut file = fs::File::create(&primary)
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents)
            .await
            .map_err(|e| Error::WriteFailed(name.into(), e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::SyncFailed(name.into(), e))?;
        match fs::remove_file(&backup).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::DeleteFailed(name.into(), e)),
        }
        sync_dir(&self.directory).await
    }
}

impl FileDriver for Disk {
    type File = DiskFile;
    type Lock = DiskLock;

    async fn atomic_read(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        validate_name(name)?;
        let _guard = self.guard.lock().await;
        let mut attempt = 0u64;
        loop {
            match self.try_atomic_read(name).await {
                Ok(contents) => return Ok(contents),
                Err(err) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(error = %err, attempt, "transient read failure, retrying");
                    backoff(attempt).await;
                }
            }
        }
    }

    async fn atomic_write(&self, name: &str, contents: Vec<u8>) -> Result<(), Error> {
        validate_name(name)?;
        let _guard = self.guard.lock().await;
        let mut attempt = 0u64;
        loop {
            match self.try_atomic_write(name, &contents).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(err);
                    }
                    warn!(error = %err, attempt, "transient write failure, retrying");
                    backoff(attempt).await;
                }
            }
        }
    }

    async fn lock(&self, name: &str) -> Result<Self::Lock, Error> {
        validate_name(name)?;
        let _guard = self.guard.lock().await;
        fs::create_dir_all(self.directory.as_ref())
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        let path = self.path(name);
        let owner = current_owner();
        for _ in 0..RETRY_ATTEMPTS {
            let attempt = path.clone();
            let created = task::spawn_blocking(move || {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(attempt)
            })
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e.into()))?;
            match created {
                Ok(file) => {
                    let bytes = owner.encode();
                    let write_name = name.to_string();
                    let file = task::spawn_blocking(move || {
                        file.write_all_at(&bytes, 0)
                            .map_err(|e| Error::WriteFailed(write_name.clone(), e))?;
                        file.sync_all()
                            .map_err(|e| Error::SyncFailed(write_name, e))?;
                        Ok::<_, Error>(file)
                    })
                    .await
                    .map_err(|e| Error::WriteFailed(name.into(), e.into()))??;
                    sync_dir(&self.directory).await?;
                    debug!(
                        pid = owner.process_id,
                        thread = owner.thread_id,
                        "acquired queue lock"
                    );
                    return Ok(DiskLock {
                        path,
                        file: Some(file),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let contents = fs::read(&path)
                        .await
                        .map_err(|e| Error::ReadFailed(name.into(), e))?;
                    if let Some(err) = classify(LockFileData::decode(&contents), &owner).await {
                        return Err(err);
                    }
                    // Stale holder: remove and race for the lock again.
                    warn!(name, "removing stale queue lock");
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(Error::DeleteFailed(name.into(), e)),
                    }
                }
                Err(e) => return Err(Error::OpenFailed(name.into(), e)),
            }
        }
        Err(Error::OpenFailed(
            name.into(),
            std::io::Error::other("lock creation kept racing"),
        ))
    }

    async fn open(&self, name: &str) -> Result<(Self::File, u64), Error> {
        validate_name(name)?;
        let _guard = self.guard.lock().await;
        fs::create_dir_all(self.directory.as_ref())
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(name))
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::OpenFailed(name.into(), e))?
            .len();
        if len == 0 {
            // Newly created (or empty, which syncs harmlessly): make the
            // directory entry durable before handing the file out.
            file.sync_all()
                .await
                .map_err(|e| Error::SyncFailed(name.into(), e))?;
            sync_dir(&self.directory).await?;
        }
        let file = file.into_std().await;
        Ok((
            DiskFile {
                name: name.into(),
                file: Arc::new(file),
            },
            len,
        ))
    }

    async fn scan(&self) -> Result<Vec<String>, Error> {
        let _guard = self.guard.lock().await;
        let mut entries = match fs::read_dir(self.directory.as_ref()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::ScanFailed(e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(Error::ScanFailed)? {
            let file_type = entry.file_type().await.map_err(Error::ScanFailed)?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn prepare_delete(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let mut guard = self.guard.lock().await;
        let sequence = guard.sequence;
        guard.sequence += 1;
        let target = self.path(&format!("{name}{DELETED_INFIX}{sequence}"));
        fs::rename(self.path(name), &target)
            .await
            .map_err(|e| Error::RenameFailed(name.into(), e))?;
        sync_dir(&self.directory).await?;
        guard.deletes.push(target);
        Ok(())
    }

    async fn finalise(&self) -> Result<(), Error> {
        let mut guard = self.guard.lock().await;
        if guard.deletes.is_empty() {
            return Ok(());
        }
        while let Some(path) = guard.deletes.first().cloned() {
            let mut attempt = 0u64;
            loop {
                match fs::remove_file(&path).await {
                    Ok(()) => break,
                    Err(e) if e.kind() == ErrorKind::NotFound => break,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= RETRY_ATTEMPTS {
                            // Leave this and later paths pending for the
                            // next pass.
                            return Err(Error::DeleteFailed(path.display().to_string(), e));
                        }
                        warn!(
                            path = %path.display(),
                            error = %e,
                            attempt,
                            "transient delete failure, retrying"
                        );
                        backoff(attempt).await;
                    }
                }
            }
            debug!(path = %path.display(), "finalised delete");
            guard.deletes.remove(0);
        }
        sync_dir(&self.directory).await
    }

    async fn remove(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let _guard = self.guard.lock().await;
        match fs::remove_file(self.path(name)).await {
            Ok(()) => sync_dir(&self.directory).await,
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::DeleteFailed(name.into(), e)),
        }
    }
}

/// Random-access handle over a blocking file, with I/O moved off the async
/// worker threads.
#[derive(Clone)]
pub struct DiskFile {
    name: String,
    file: Arc<std::fs::File>,
}

impl super::File for DiskFile {
    async fn read_at(&self, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>, Error> {
        let file = self.file.clone();
        let name = self.name.clone();
        task::spawn_blocking(move || match file.read_exact_at(&mut buf, offset) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::InsufficientLength(name)),
            Err(e) => Err(Error::ReadFailed(name, e)),
        })
        .await
        .map_err(|e| Error::ReadFailed(self.name.clone(), e.into()))?
    }

    async fn write_at(&self, buf: Vec<u8>, offset: u64) -> Result<(), Error> {
        let file = self.file.clone();
        let name = self.name.clone();
        task::spawn_blocking(move || {
            file.write_all_at(&buf, offset)
                .map_err(|e| Error::WriteFailed(name, e))
        })
        .await
        .map_err(|e| Error::WriteFailed(self.name.clone(), e.into()))?
    }

    async fn sync(&self) -> Result<(), Error> {
        let file = self.file.clone();
        let name = self.name.clone();
        task::spawn_blocking(move || file.sync_all().map_err(|e| Error::SyncFailed(name, e)))
            .await
            .map_err(|e| Error::SyncFailed(self.name.clone(), e.into()))?
    }
}

/// Guard holding the lock file open for its lifetime.
///
/// [super::Lock::release] removes the file and reports failures. A guard
/// dropped without release hands the removal to a detached thread instead:
/// drops can run on an async worker, which must not block on an unlink.
pub struct DiskLock {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl super::Lock for DiskLock {
    async fn release(mut self) -> Result<(), Error> {
        let file = self.file.take();
        let path = mem::take(&mut self.path);
        let name = path.display().to_string();
        let joined = name.clone();
        task::spawn_blocking(move || {
            drop(file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::DeleteFailed(name, e)),
            }
            // Make the unlink durable, like every other delete path.
            if let Some(parent) = path.parent() {
                let dir = std::fs::File::open(parent)
                    .map_err(|e| Error::OpenFailed(name.clone(), e))?;
                dir.sync_all().map_err(|e| Error::SyncFailed(name, e))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::DeleteFailed(joined, e.into()))?
    }
}

impl Drop for DiskLock {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            // Already released.
            return;
        };
        let path = mem::take(&mut self.path);
        std::thread::spawn(move || {
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove queue lock");
                }
            }
        });
    }
}

/// Decide whether an existing lock refuses the requester. `None` means the
/// lock is stale and may be replaced. Torn contents are treated as stale.
async fn classify(existing: Option<LockFileData>, requester: &LockFileData) -> Option<Error> {
    let existing = existing?;
    if existing.process_id == requester.process_id {
        return if existing.thread_id == requester.thread_id {
            Some(Error::LockedByThisThread)
        } else {
            Some(Error::LockedByThisProcess(existing.thread_id))
        };
    }
    if existing.process_id < 0 {
        return None;
    }
    let pid = existing.process_id as u32;
    let started = task::spawn_blocking(move || {
        let system = System::new_all();
        system
            .process(Pid::from_u32(pid))
            .map(|process| process.start_time())
    })
    .await
    .ok()
    .flatten();
    match started {
        // Start times are second-granular on most platforms.
        Some(seconds) if seconds as i64 == existing.process_start_time_ms / 1000 => {
            Some(Error::LockedByLiveProcess(existing.process_id))
        }
        _ => None,
    }
}

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1);

thread_local! {
    static THREAD_ID: i32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Identity recorded in lock files created by this process.
pub fn current_owner() -> LockFileData {
    static START_TIME_MS: OnceLock<i64> = OnceLock::new();
    let process_id = std::process::id() as i32;
    let start = *START_TIME_MS.get_or_init(|| {
        let system = System::new_all();
        sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid))
            .map(|process| process.start_time() as i64 * 1000)
            .unwrap_or_default()
    });
    LockFileData {
        process_id,
        thread_id: THREAD_ID.with(|id| *id),
        process_start_time_ms: start,
    }
}

/// Linear backoff before retry `attempt`.
async fn backoff(attempt: u64) {
    time::sleep(Duration::from_millis(attempt * RETRY_BACKOFF_MS)).await;
}

/// Make directory-entry changes durable. Unlike file contents, creations,
/// deletions, and renames only persist once the directory itself is synced.
async fn sync_dir(path: &Path) -> Result<(), Error> {
    let name = path.display().to_string();
    let dir = fs::File::open(path)
        .await
        .map_err(|e| Error::OpenFailed(name.clone(), e))?;
    dir.sync_all().await.map_err(|e| Error::SyncFailed(name, e))
}
