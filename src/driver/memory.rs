//! In-memory [FileDriver] for tests.
//!
//! Contents live in a shared map that only reflects *synced* bytes: every
//! [super::File] handle works on its own copy and merges it into the map on
//! [super::File::sync]. Dropping handles and reopening therefore behaves
//! like an abrupt process kill, with all unsynced writes lost.
//!
//! Tests can reach past the driver API to stage precise failure states:
//! raw contents may be read, replaced, or removed (to corrupt a log tail or
//! fabricate a torn checkpoint), the lock identity is injectable, foreign
//! pids can be declared live, and a bounded number of upcoming writes can
//! be made to fail (to exercise pending-write aggregation).

use super::{old_copy, validate_name, Error, FileDriver, LockFileData, DELETED_INFIX};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tracing::warn;

/// In-memory driver. Clones share the same backing map.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<Inner>,
}

struct Inner {
    identity: LockFileData,
    /// Synced contents by name.
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Deletions prepared but not finalised, in order.
    pending: Mutex<Vec<String>>,
    /// Foreign pids considered running, with their start times.
    live: Mutex<BTreeMap<i32, i64>>,
    /// Writes that should fail before writes succeed again.
    write_faults: AtomicU32,
    sequence: AtomicU64,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self::with_identity(LockFileData {
            process_id: 1,
            thread_id: 1,
            process_start_time_ms: 1_000,
        })
    }

    /// Create a driver whose lock attempts carry the given identity.
    pub fn with_identity(identity: LockFileData) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity,
                files: Mutex::new(BTreeMap::new()),
                pending: Mutex::new(Vec::new()),
                live: Mutex::new(BTreeMap::new()),
                write_faults: AtomicU32::new(0),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Synced contents of `name`, if present.
    pub fn raw(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.files.lock().unwrap().get(name).cloned()
    }

    /// Replace the synced contents of `name`.
    pub fn put_raw(&self, name: &str, contents: Vec<u8>) {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(name.into(), contents);
    }

    /// Remove `name` outright.
    pub fn remove_raw(&self, name: &str) {
        self.inner.files.lock().unwrap().remove(name);
    }

    /// Declare a foreign pid as running with the given start time.
    pub fn mark_live(&self, process_id: i32, start_time_ms: i64) {
        self.inner
            .live
            .lock()
            .unwrap()
            .insert(process_id, start_time_ms);
    }

    /// Make the next `count` [super::File::write_at] calls fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.write_faults.store(count, Ordering::SeqCst);
    }
}

impl FileDriver for Memory {
    type File = MemoryFile;
    type Lock = MemoryLock;

    async fn atomic_read(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        validate_name(name)?;
        let mut files = self.inner.files.lock().unwrap();
        let backup = old_copy(name);
        if files.contains_key(&backup) {
            if files.contains_key(name) {
                warn!(name, "removing stale backup");
                files.remove(&backup);
            } else {
                warn!(name, "restoring backup as primary");
                let contents = files.remove(&backup).unwrap();
                files.insert(name.into(), contents);
            }
        }
        Ok(files.get(name).cloned())
    }

    async fn atomic_write(&self, name: &str, contents: Vec<u8>) -> Result<(), Error> {
        validate_name(name)?;
        let mut files = self.inner.files.lock().unwrap();
        let backup = old_copy(name);
        if files.contains_key(name) && !files.contains_key(&backup) {
            let previous = files.remove(name).unwrap();
            files.insert(backup.clone(), previous);
        }
        files.insert(name.into(), contents);
        files.remove(&backup);
        Ok(())
    }

    async fn lock(&self, name: &str) -> Result<Self::Lock, Error> {
        validate_name(name)?;
        let requester = self.inner.identity;
        let mut files = self.inner.files.lock().unwrap();
        if let Some(contents) = files.get(name) {
            match LockFileData::decode(contents) {
                Some(existing) if existing.process_id == requester.process_id => {
                    return if existing.thread_id == requester.thread_id {
                        Err(Error::LockedByThisThread)
                    } else {
                        Err(Error::LockedByThisProcess(existing.thread_id))
                    };
                }
                Some(existing)
                    if self.inner.live.lock().unwrap().get(&existing.process_id)
                        == Some(&existing.process_start_time_ms) =>
                {
                    return Err(Error::LockedByLiveProcess(existing.process_id));
                }
                // Stale or torn: replace below.
                _ => warn!(name, "removing stale queue lock"),
            }
        }
        files.insert(name.into(), requester.encode());
        Ok(MemoryLock {
            inner: self.inner.clone(),
            name: Some(name.into()),
        })
    }

    async fn open(&self, name: &str) -> Result<(Self::File, u64), Error> {
        validate_name(name)?;
        let mut files = self.inner.files.lock().unwrap();
        let contents = files.entry(name.into()).or_default().clone();
        let len = contents.len() as u64;
        Ok((
            MemoryFile {
                name: name.into(),
                content: Arc::new(RwLock::new(contents)),
                inner: self.inner.clone(),
            },
            len,
        ))
    }

    async fn scan(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.files.lock().unwrap().keys().cloned().collect())
    }

    async fn prepare_delete(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let mut files = self.inner.files.lock().unwrap();
        let contents = files
            .remove(name)
            .ok_or_else(|| Error::FileMissing(name.into()))?;
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let target = format!("{name}{DELETED_INFIX}{sequence}");
        files.insert(target.clone(), contents);
        self.inner.pending.lock().unwrap().push(target);
        Ok(())
    }

    async fn finalise(&self) -> Result<(), Error> {
        let pending: Vec<String> = self.inner.pending.lock().unwrap().drain(..).collect();
        let mut files = self.inner.files.lock().unwrap();
        for name in pending {
            files.remove(&name);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        self.inner.files.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Handle over a private copy of the file, merged into the shared map on
/// [super::File::sync].
#[derive(Clone)]
pub struct MemoryFile {
    name: String,
    content: Arc<RwLock<Vec<u8>>>,
    inner: Arc<Inner>,
}

impl super::File for MemoryFile {
    async fn read_at(&self, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>, Error> {
        let content = self.content.read().unwrap();
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| Error::InsufficientLength(self.name.clone()))?;
        if end > content.len() {
            return Err(Error::InsufficientLength(self.name.clone()));
        }
        buf.copy_from_slice(&content[offset..end]);
        Ok(buf)
    }

    async fn write_at(&self, buf: Vec<u8>, offset: u64) -> Result<(), Error> {
        if self
            .inner
            .write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |faults| {
                faults.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::WriteFailed(
                self.name.clone(),
                io::Error::other("injected write fault"),
            ));
        }
        let mut content = self.content.write().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(&buf);
        Ok(())
    }

    async fn sync(&self) -> Result<(), Error> {
        let snapshot = self.content.read().unwrap().clone();
        let mut files = self.inner.files.lock().unwrap();
        let contents = files
            .get_mut(&self.name)
            .ok_or_else(|| Error::FileMissing(self.name.clone()))?;
        *contents = snapshot;
        Ok(())
    }
}

/// Guard for the in-memory lock. Releasing (or dropping) removes the lock
/// entry; whichever happens first wins.
pub struct MemoryLock {
    inner: Arc<Inner>,
    name: Option<String>,
}

impl super::Lock for MemoryLock {
    async fn release(mut self) -> Result<(), Error> {
        if let Some(name) = self.name.take() {
            self.inner.files.lock().unwrap().remove(&name);
        }
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.inner.files.lock().unwrap().remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::File as _;

    #[tokio::test]
    async fn test_unsynced_writes_lost_on_reopen() {
        let driver = Memory::new();
        let (file, len) = driver.open("data.0000").await.unwrap();
        assert_eq!(len, 0);

        file.write_at(b"durable".to_vec(), 0).await.unwrap();
        file.sync().await.unwrap();
        file.write_at(b" and not".to_vec(), 7).await.unwrap();

        // Crash: drop the handle without syncing the second write.
        drop(file);
        let (file, len) = driver.open("data.0000").await.unwrap();
        assert_eq!(len, 7);
        let buf = file.read_at(vec![0u8; 7], 0).await.unwrap();
        assert_eq!(&buf, b"durable");
    }

    #[tokio::test]
    async fn test_atomic_write_reconcile() {
        let driver = Memory::new();
        driver
            .atomic_write("meta.state", b"one".to_vec())
            .await
            .unwrap();
        driver
            .atomic_write("meta.state", b"two".to_vec())
            .await
            .unwrap();
        assert_eq!(
            driver.atomic_read("meta.state").await.unwrap(),
            Some(b"two".to_vec())
        );

        // Backup plus primary: primary wins.
        driver.put_raw("meta.state.old_copy", b"stale".to_vec());
        assert_eq!(
            driver.atomic_read("meta.state").await.unwrap(),
            Some(b"two".to_vec())
        );
        assert_eq!(driver.raw("meta.state.old_copy"), None);

        // Backup alone: restored as primary.
        driver.put_raw("meta.state.old_copy", b"two".to_vec());
        driver.remove_raw("meta.state");
        assert_eq!(
            driver.atomic_read("meta.state").await.unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_lock_classification() {
        let driver = Memory::new();
        let lock = driver.lock("lock").await.unwrap();
        assert!(matches!(
            driver.lock("lock").await,
            Err(Error::LockedByThisThread)
        ));
        drop(lock);

        // Another thread of this process.
        driver.put_raw(
            "lock",
            LockFileData {
                process_id: 1,
                thread_id: 2,
                process_start_time_ms: 1_000,
            }
            .encode(),
        );
        assert!(matches!(
            driver.lock("lock").await,
            Err(Error::LockedByThisProcess(2))
        ));

        // A live foreign process.
        driver.mark_live(77, 5_000);
        driver.put_raw(
            "lock",
            LockFileData {
                process_id: 77,
                thread_id: 1,
                process_start_time_ms: 5_000,
            }
            .encode(),
        );
        assert!(matches!(
            driver.lock("lock").await,
            Err(Error::LockedByLiveProcess(77))
        ));

        // Same pid, different start time: a previous incarnation, stale.
        driver.put_raw(
            "lock",
            LockFileData {
                process_id: 77,
                thread_id: 1,
                process_start_time_ms: 4_000,
            }
            .encode(),
        );
        let lock = driver.lock("lock").await.unwrap();
        drop(lock);
    }

    #[tokio::test]
    async fn test_write_fault_injection() {
        let driver = Memory::new();
        let (file, _) = driver.open("data.0000").await.unwrap();
        driver.fail_next_writes(2);
        assert!(file.write_at(b"a".to_vec(), 0).await.is_err());
        assert!(file.write_at(b"b".to_vec(), 0).await.is_err());
        file.write_at(b"c".to_vec(), 0).await.unwrap();
    }
}
