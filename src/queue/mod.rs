//! A persistent, transactional, single-node disk queue.
//!
//! [Queue] is a durable FIFO queue of byte payloads. Its state survives
//! restarts and crashes: every committed transaction is appended to a
//! write-ahead transaction log, payload bytes live in append-only data
//! files, and a checkpoint caches what replaying the log would rebuild.
//! At most one holder per queue directory is enforced through a lock file
//! that records its owner, so a lock left behind by a dead process is
//! detected and replaced.
//!
//! All queue access happens through transactional [Session]s: enqueues are
//! buffered and dequeues are tentative until [Session::flush] commits the
//! batch atomically. A session abandoned without flushing reverts: its
//! enqueues were never visible and its dequeues rejoin the head of the
//! queue in their original order.
//!
//! # Durability
//!
//! [Session::flush] only returns once the transaction's payload bytes and
//! log record are synced to disk. The checkpoint rewrite that follows is
//! advisory: if it is torn by a crash, the next open rebuilds it from the
//! log.
//!
//! # Example
//!
//! ```rust
//! use diskqueue::driver::disk::{Config as DiskConfig, Disk};
//! use diskqueue::queue::{Config, Queue};
//! use prometheus_client::registry::Registry;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), diskqueue::queue::Error> {
//! # let directory = std::env::temp_dir().join("diskqueue_doc_example");
//! # let _ = std::fs::remove_dir_all(&directory);
//! let driver = Disk::new(DiskConfig { directory });
//! let mut registry = Registry::default();
//! let queue = Queue::open(driver, Config::default(), &mut registry).await?;
//!
//! // Produce.
//! let mut session = queue.open_session();
//! session.enqueue(b"hello");
//! session.flush().await?;
//! drop(session);
//!
//! // Consume.
//! let mut session = queue.open_session();
//! let payload = session.dequeue().await?;
//! assert_eq!(payload.as_deref(), Some(&b"hello"[..]));
//! session.flush().await?;
//! drop(session);
//!
//! queue.close().await?;
//! # Ok(())
//! # }
//! ```

mod metrics;
mod session;
mod storage;

pub use session::Session;
pub use storage::Queue;

use crate::{checkpoint, driver, log};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Smallest permitted [Config::write_buffer_size].
pub const MIN_WRITE_BUFFER: usize = 64 * 1024;

/// Configuration for [Queue].
#[derive(Clone, Debug)]
pub struct Config {
    /// Roll to a new data file once the current one would grow past this.
    /// A single payload larger than the limit still lands in one file.
    pub max_file_size: u64,

    /// Session buffer size above which buffered enqueues are written to
    /// the data file in the background, ahead of commit. Clamped to at
    /// least [MIN_WRITE_BUFFER].
    pub write_buffer_size: usize,

    /// Recovery policy for a corrupt transaction log tail: truncate to the
    /// last good record instead of failing the open.
    pub allow_truncated_entries: bool,

    /// How long each batch of pending background writes may take during
    /// [Session::flush] before the flush fails with a timeout.
    pub timeout_limit: Duration,

    /// Buffer size hint for sequential log replay.
    pub suggested_read_buffer: usize,

    /// Rewrite the transaction log as a single snapshot transaction once
    /// it grows past this.
    pub log_size_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: 32 * 1024 * 1024,
            write_buffer_size: 128 * 1024,
            allow_truncated_entries: false,
            timeout_limit: Duration::from_secs(10),
            suggested_read_buffer: 1024 * 1024,
            log_size_limit: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    pub(crate) fn validated(mut self) -> Self {
        if self.write_buffer_size < MIN_WRITE_BUFFER {
            warn!(
                requested = self.write_buffer_size,
                clamped = MIN_WRITE_BUFFER,
                "write buffer below minimum"
            );
            self.write_buffer_size = MIN_WRITE_BUFFER;
        }
        self
    }
}

/// Errors that can occur when interacting with [Queue].
#[derive(Debug, Error)]
pub enum Error {
    #[error("driver error: {0}")]
    Driver(#[from] driver::Error),
    #[error("transaction log error: {0}")]
    Log(#[from] log::Error),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::Error),
    #[error("operation conflicts with live range (file {file_number}, start {start}, length {length})")]
    RangeConflict {
        file_number: u32,
        start: u64,
        length: u32,
    },
    #[error("queue poisoned by an earlier unrecoverable error; reopen to continue")]
    Poisoned,
    #[error("{} pending operation(s) failed", .0.len())]
    PendingWrites(Vec<Error>),
    #[error("timed out waiting for pending writes")]
    Timeout,
    #[error("background write task failed: {0}")]
    Background(String),
}

impl Error {
    /// Whether the error is lock contention that [Queue::wait_for] may
    /// outlast.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Driver(inner) if inner.is_lock_contention())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{disk, memory::Memory, FileDriver, LockFileData};
    use prometheus_client::registry::Registry;

    async fn open_memory(driver: &Memory, cfg: Config) -> Queue<Memory> {
        let mut registry = Registry::default();
        Queue::open(driver.clone(), cfg, &mut registry)
            .await
            .expect("failed to open queue")
    }

    /// Enqueue one payload and flush, in its own session.
    async fn produce(queue: &Queue<Memory>, payload: &[u8]) {
        let mut session = queue.open_session();
        session.enqueue(payload);
        session.flush().await.expect("failed to flush");
    }

    /// Dequeue one payload and flush, in its own session.
    async fn consume(queue: &Queue<Memory>) -> Option<Vec<u8>> {
        let mut session = queue.open_session();
        let payload = session.dequeue().await.expect("failed to dequeue");
        session.flush().await.expect("failed to flush");
        payload
    }

    #[tokio::test]
    async fn test_enqueue_survives_reopen_and_drains() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[1, 2, 3, 4]).await;
            queue.close().await.unwrap();
        }
        {
            let queue = open_memory(&driver, Config::default()).await;
            assert_eq!(consume(&queue).await, Some(vec![1, 2, 3, 4]));
            queue.close().await.unwrap();
        }
        {
            let queue = open_memory(&driver, Config::default()).await;
            assert_eq!(consume(&queue).await, None);
            queue.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips_as_empty() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        produce(&queue, &[]).await;
        assert_eq!(consume(&queue).await, Some(Vec::new()));
        assert_eq!(consume(&queue).await, None);
    }

    #[tokio::test]
    async fn test_empty_payloads_share_offsets() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            let mut session = queue.open_session();
            session.enqueue(&[]);
            session.enqueue(&[]);
            session.enqueue(&[7]);
            session.flush().await.unwrap();
            drop(session);
            queue.close().await.unwrap();
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 3);
        assert_eq!(consume(&queue).await, Some(Vec::new()));
        assert_eq!(consume(&queue).await, Some(Vec::new()));
        assert_eq!(consume(&queue).await, Some(vec![7]));
    }

    #[tokio::test]
    async fn test_estimated_count_across_sessions_and_reopen() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            for i in 0..5u8 {
                produce(&queue, &[i]).await;
            }
            assert_eq!(queue.estimated_count(), 5);
            queue.close().await.unwrap();
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 5);
    }

    #[tokio::test]
    async fn test_abandoned_dequeue_returns_to_head() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        produce(&queue, &[1, 2, 3, 4]).await;

        let mut thief = queue.open_session();
        assert_eq!(thief.dequeue().await.unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(queue.estimated_count(), 0);
        thief.dispose();

        assert_eq!(queue.estimated_count(), 1);
        assert_eq!(consume(&queue).await, Some(vec![1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_competing_sessions_race_for_single_item() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        produce(&queue, &[1, 2, 3, 4]).await;

        let mut first = queue.open_session();
        let mut second = queue.open_session();
        assert_eq!(first.dequeue().await.unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(second.dequeue().await.unwrap(), None);
        first.flush().await.unwrap();
        second.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_reinstatement_preserves_order() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        for payload in [b"a", b"b", b"c"] {
            produce(&queue, payload).await;
        }

        let mut session = queue.open_session();
        assert_eq!(session.dequeue().await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(session.dequeue().await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(session.dequeue().await.unwrap(), Some(b"c".to_vec()));
        session.dispose();

        let mut session = queue.open_session();
        assert_eq!(session.dequeue().await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(session.dequeue().await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(session.dequeue().await.unwrap(), Some(b"c".to_vec()));
        session.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_unflushed_session_invisible_after_reopen() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[1]).await;

            let mut session = queue.open_session();
            session.enqueue(&[2]);
            assert_eq!(session.dequeue().await.unwrap(), Some(vec![1]));
            // Crash with the session unflushed.
            drop(session);
            drop(queue);
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 1);
        assert_eq!(consume(&queue).await, Some(vec![1]));
        assert_eq!(consume(&queue).await, None);
    }

    #[tokio::test]
    async fn test_flush_is_durable_without_close() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[42]).await;
            // Kill the process: no close, no checkpoint rewrite.
            drop(queue);
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(consume(&queue).await, Some(vec![42]));
    }

    #[tokio::test]
    async fn test_idempotent_recovery() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[1]).await;
            produce(&queue, &[2]).await;
            queue.close().await.unwrap();
        }
        {
            let queue = open_memory(&driver, Config::default()).await;
            assert_eq!(queue.estimated_count(), 2);
            queue.close().await.unwrap();
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 2);
        assert_eq!(consume(&queue).await, Some(vec![1]));
    }

    #[tokio::test]
    async fn test_fifo_across_sessions() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        {
            let mut session = queue.open_session();
            session.enqueue(&[1]);
            session.enqueue(&[2]);
            session.flush().await.unwrap();
        }
        produce(&queue, &[3]).await;
        for expected in 1..=3u8 {
            assert_eq!(consume(&queue).await, Some(vec![expected]));
        }
        assert_eq!(consume(&queue).await, None);
    }

    #[tokio::test]
    async fn test_crash_during_checkpoint_rewrite() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            // Checkpoint as it stood before the transaction.
            let stale = driver.raw("meta.state").unwrap();
            produce(&queue, &[9]).await;
            drop(queue);

            // Stage a kill after the log append but mid-checkpoint-rewrite:
            // the fresh primary is torn and the backup still holds the
            // pre-transaction snapshot.
            let mut torn = driver.raw("meta.state").unwrap();
            torn.truncate(torn.len() / 2);
            driver.put_raw("meta.state", torn);
            driver.put_raw("meta.state.old_copy", stale);
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(consume(&queue).await, Some(vec![9]));
    }

    #[tokio::test]
    async fn test_corrupt_log_tail_policies() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[1, 2, 3, 4]).await;
            produce(&queue, &[5, 6]).await;
            queue.close().await.unwrap();
        }
        let mut contents = driver.raw("transaction.log").unwrap();
        let len = contents.len();
        for byte in &mut contents[len - 3..] {
            *byte ^= 0xFF;
        }
        driver.put_raw("transaction.log", contents);

        // Strict: the open fails, naming the bad transaction.
        let mut registry = Registry::default();
        let err = Queue::open(driver.clone(), Config::default(), &mut registry)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Tx #2"), "{err}");

        // Permissive: the tail is truncated and the prefix recovered.
        let cfg = Config {
            allow_truncated_entries: true,
            ..Config::default()
        };
        let queue = open_memory(&driver, cfg.clone()).await;
        assert_eq!(queue.estimated_count(), 1);
        assert_eq!(consume(&queue).await, Some(vec![1, 2, 3, 4]));
        assert_eq!(consume(&queue).await, None);
        queue.close().await.unwrap();

        // The truncated log stays readable under the strict policy.
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_lock_replaced_live_lock_refused() {
        let driver = Memory::new();

        // A recorded owner that is not running: stale, replaced.
        driver.put_raw(
            "lock",
            LockFileData {
                process_id: 999_999,
                thread_id: 4,
                process_start_time_ms: 77,
            }
            .encode(),
        );
        let queue = open_memory(&driver, Config::default()).await;
        drop(queue);

        // A recorded owner that is running with a matching start time:
        // genuine contention.
        driver.mark_live(777, 5_000);
        driver.put_raw(
            "lock",
            LockFileData {
                process_id: 777,
                thread_id: 1,
                process_start_time_ms: 5_000,
            }
            .encode(),
        );
        let mut registry = Registry::default();
        let err = Queue::open(driver.clone(), Config::default(), &mut registry)
            .await
            .unwrap_err();
        assert!(err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_second_open_refused_until_released() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;

        let mut registry = Registry::default();
        let err = Queue::open(driver.clone(), Config::default(), &mut registry)
            .await
            .unwrap_err();
        assert!(err.is_lock_contention());

        // wait_for gives up once the timeout elapses...
        let err = Queue::wait_for(
            driver.clone(),
            Config::default(),
            &mut registry,
            Duration::from_millis(250),
        )
        .await
        .unwrap_err();
        assert!(err.is_lock_contention());

        // ...and succeeds once the holder is gone.
        drop(queue);
        let queue = Queue::wait_for(
            driver.clone(),
            Config::default(),
            &mut registry,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollover_spans_files_within_one_commit() {
        let driver = Memory::new();
        let cfg = Config {
            max_file_size: 16,
            ..Config::default()
        };
        {
            let queue = open_memory(&driver, cfg.clone()).await;
            let mut session = queue.open_session();
            for i in 0..5u8 {
                session.enqueue(&[i; 10]);
            }
            session.flush().await.unwrap();
            drop(session);

            // One transaction, five data files.
            let names = driver.scan().await.unwrap();
            for file in ["data.0000", "data.0001", "data.0002", "data.0003", "data.0004"] {
                assert!(names.contains(&file.to_string()), "{names:?}");
            }
            queue.close().await.unwrap();
        }
        let queue = open_memory(&driver, cfg.clone()).await;
        assert_eq!(queue.estimated_count(), 5);
        for i in 0..5u8 {
            assert_eq!(consume(&queue).await, Some(vec![i; 10]));
        }

        // Draining retired every sealed file; only the write target stays.
        let names = driver.scan().await.unwrap();
        let data: Vec<String> = names
            .iter()
            .filter(|name| name.starts_with("data."))
            .cloned()
            .collect();
        assert_eq!(data, vec!["data.0004".to_string()]);
    }

    #[tokio::test]
    async fn test_payload_larger_than_max_file_size() {
        let driver = Memory::new();
        let cfg = Config {
            max_file_size: 16,
            ..Config::default()
        };
        let queue = open_memory(&driver, cfg).await;
        let mut session = queue.open_session();
        session.enqueue(&[1; 4]);
        session.enqueue(&[2; 40]);
        session.enqueue(&[3; 4]);
        session.flush().await.unwrap();
        drop(session);

        assert_eq!(consume(&queue).await, Some(vec![1; 4]));
        assert_eq!(consume(&queue).await, Some(vec![2; 40]));
        assert_eq!(consume(&queue).await, Some(vec![3; 4]));
    }

    #[tokio::test]
    async fn test_pending_write_failure_aborts_flush() {
        let driver = Memory::new();
        let cfg = Config {
            write_buffer_size: 1, // clamped to the 64 KiB minimum
            ..Config::default()
        };
        let queue = open_memory(&driver, cfg).await;

        driver.fail_next_writes(1);
        let mut session = queue.open_session();
        session.enqueue(&vec![1u8; 40 * 1024]);
        session.enqueue(&vec![2u8; 40 * 1024]); // crosses the buffer threshold
        let err = session.flush().await.unwrap_err();
        match err {
            Error::PendingWrites(failures) => assert!(!failures.is_empty()),
            other => panic!("expected PendingWrites, got {other}"),
        }
        session.dispose();

        // Nothing was committed and the queue remains usable.
        assert_eq!(queue.estimated_count(), 0);
        produce(&queue, &[3]).await;
        assert_eq!(consume(&queue).await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_log_compaction_preserves_state() {
        let driver = Memory::new();
        let cfg = Config {
            log_size_limit: 64,
            ..Config::default()
        };
        {
            let queue = open_memory(&driver, cfg.clone()).await;
            for i in 0..6u8 {
                produce(&queue, &[i]).await;
            }
            queue.close().await.unwrap();
        }

        // Compacted down to one snapshot transaction of six enqueues:
        // 16 + 4 + 6 * 17 + 16 bytes.
        assert_eq!(driver.raw("transaction.log").unwrap().len(), 138);

        let queue = open_memory(&driver, cfg.clone()).await;
        assert_eq!(queue.estimated_count(), 6);
        for i in 0..6u8 {
            assert_eq!(consume(&queue).await, Some(vec![i]));
        }
        assert_eq!(consume(&queue).await, None);
    }

    #[tokio::test]
    async fn test_checkpoint_lag_rebuilt_from_log() {
        let driver = Memory::new();
        {
            let queue = open_memory(&driver, Config::default()).await;
            produce(&queue, &[1]).await;
            let stale = driver.raw("meta.state").unwrap();
            produce(&queue, &[2]).await;
            drop(queue);
            // The checkpoint lags the log by one transaction.
            driver.put_raw("meta.state", stale);
        }
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(queue.estimated_count(), 2);
        assert_eq!(consume(&queue).await, Some(vec![1]));
        assert_eq!(consume(&queue).await, Some(vec![2]));
    }

    #[tokio::test]
    async fn test_dequeue_on_empty_queue() {
        let driver = Memory::new();
        let queue = open_memory(&driver, Config::default()).await;
        assert_eq!(consume(&queue).await, None);
        assert_eq!(queue.estimated_count(), 0);
    }

    #[tokio::test]
    async fn test_disk_round_trip() {
        let directory = tempfile::tempdir().unwrap();
        let driver = disk::Disk::new(disk::Config {
            directory: directory.path().to_path_buf(),
        });
        {
            let mut registry = Registry::default();
            let queue = Queue::open(driver.clone(), Config::default(), &mut registry)
                .await
                .unwrap();
            assert!(directory.path().join("lock").exists());
            let mut session = queue.open_session();
            session.enqueue(&[1, 2, 3, 4]);
            session.flush().await.unwrap();
            drop(session);
            queue.close().await.unwrap();
        }
        // The lock is released with the last handle.
        assert!(!directory.path().join("lock").exists());
        assert!(directory.path().join("transaction.log").exists());
        assert!(directory.path().join("meta.state").exists());
        assert!(directory.path().join("data.0000").exists());

        let mut registry = Registry::default();
        let queue = Queue::open(driver.clone(), Config::default(), &mut registry)
            .await
            .unwrap();
        assert_eq!(queue.estimated_count(), 1);
        let mut session = queue.open_session();
        assert_eq!(session.dequeue().await.unwrap(), Some(vec![1, 2, 3, 4]));
        session.flush().await.unwrap();
        drop(session);
        queue.close().await.unwrap();
    }
}
