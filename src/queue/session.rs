//! Transactional session over a [Queue].

use super::{
    storage::{Entry, Queue},
    Error,
};
use crate::{driver::FileDriver, log::Operation};
use futures::future::join_all;
use std::mem;
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, warn};

/// Pending write handles awaited together per timeout window during
/// [Session::flush].
const PENDING_WRITE_BATCH: usize = 32;

/// A transactional handle on the queue.
///
/// Enqueues are buffered locally and dequeues are tentative until
/// [Session::flush] commits them atomically. A session dropped (or
/// [Session::dispose]d) without flushing reverts: buffered enqueues are
/// discarded and tentative dequeues rejoin the head of the queue in their
/// original order.
///
/// When the buffer outgrows [super::Config::write_buffer_size], its
/// contents are written to the current data file in the background. The
/// bytes stay invisible to other sessions until commit, because the
/// transaction log does not reference them yet; the background tasks are
/// chained so payloads land on disk in enqueue order, and their handles
/// are awaited collectively at flush.
pub struct Session<D: FileDriver> {
    queue: Queue<D>,
    /// Payloads not yet written to the data file.
    buffer: Vec<Vec<u8>>,
    /// Running total of buffered payload bytes.
    buffered: usize,
    /// In-flight opportunistic writes, in spawn order.
    writes: Vec<JoinHandle<Result<Vec<Operation>, Error>>>,
    /// Completion signal of the most recently spawned write, awaited by
    /// the next one to keep on-disk order equal to enqueue order.
    chain: Option<oneshot::Receiver<()>>,
    /// Tentative dequeues, in dequeue order.
    reads: Vec<Entry>,
}

impl<D: FileDriver> Session<D> {
    pub(crate) fn new(queue: Queue<D>) -> Self {
        Self {
            queue,
            buffer: Vec::new(),
            buffered: 0,
            writes: Vec::new(),
            chain: None,
            reads: Vec::new(),
        }
    }

    /// Buffer a payload for enqueue. Empty payloads are valid entries and
    /// dequeue as empty (not absent) byte vectors.
    pub fn enqueue(&mut self, payload: &[u8]) {
        self.buffered += payload.len();
        self.buffer.push(payload.to_vec());
        if self.buffered > self.queue.shared.cfg.write_buffer_size {
            self.spawn_write();
        }
    }

    /// Drain the buffer into a background write of the current data file.
    fn spawn_write(&mut self) {
        let batch = mem::take(&mut self.buffer);
        self.buffered = 0;
        let queue = self.queue.clone();
        let previous = self.chain.take();
        let (done, next) = oneshot::channel();
        self.chain = Some(next);
        self.writes.push(tokio::spawn(async move {
            if let Some(previous) = previous {
                // A failed or cancelled predecessor just drops its sender;
                // order no longer matters for bytes that will not commit.
                let _ = previous.await;
            }
            let result = queue.write(batch).await;
            let _ = done.send(());
            result
        }));
    }

    /// Take the next committed entry off the queue, returning its payload.
    /// `None` when the queue is empty. The removal is tentative until
    /// [Session::flush].
    ///
    /// This session's own buffered enqueues are not visible here; nothing
    /// is until its transaction commits.
    pub async fn dequeue(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match self.queue.dequeue().await? {
            Some((entry, payload)) => {
                self.reads.push(entry);
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Commit everything this session has done since the last flush.
    ///
    /// Waits for outstanding background writes (in batches of
    /// [PENDING_WRITE_BATCH] under [super::Config::timeout_limit] each),
    /// writes the residual buffer, and commits the accumulated operations.
    /// If any write failed or timed out, the aggregate surfaces as
    /// [Error::PendingWrites] and nothing is committed.
    pub async fn flush(&mut self) -> Result<(), Error> {
        let mut failures = Vec::new();
        let mut operations = Vec::new();

        let mut handles = mem::take(&mut self.writes).into_iter().peekable();
        self.chain = None;
        while handles.peek().is_some() {
            let batch: Vec<_> = handles.by_ref().take(PENDING_WRITE_BATCH).collect();
            match time::timeout(self.queue.shared.cfg.timeout_limit, join_all(batch)).await {
                Ok(results) => {
                    for result in results {
                        match result {
                            Ok(Ok(ops)) => operations.extend(ops),
                            Ok(Err(err)) => failures.push(err),
                            Err(err) => failures.push(Error::Background(err.to_string())),
                        }
                    }
                }
                Err(_) => failures.push(Error::Timeout),
            }
        }

        if failures.is_empty() && !self.buffer.is_empty() {
            let batch = mem::take(&mut self.buffer);
            self.buffered = 0;
            match self.queue.write(batch).await {
                Ok(ops) => operations.extend(ops),
                Err(err) => failures.push(err),
            }
        }

        if !failures.is_empty() {
            warn!(
                failures = failures.len(),
                "flush aborted, transaction not committed"
            );
            self.buffer.clear();
            self.buffered = 0;
            return Err(Error::PendingWrites(failures));
        }

        operations.extend(
            self.reads
                .iter()
                .map(|entry| Operation::dequeue(entry.file_number, entry.start, entry.length)),
        );
        if operations.is_empty() {
            return Ok(());
        }
        match self.queue.commit(operations).await {
            Ok(()) => {
                self.reads.clear();
                Ok(())
            }
            // The transaction is durable; only post-commit cleanup failed.
            Err(err @ Error::PendingWrites(_)) => {
                self.reads.clear();
                Err(err)
            }
            Err(err) => {
                let reads = mem::take(&mut self.reads);
                self.queue.reinstate(&reads);
                Err(err)
            }
        }
    }

    /// Abandon the session, reverting everything since the last flush.
    /// Equivalent to dropping it, but explicit at call sites.
    pub fn dispose(self) {}
}

impl<D: FileDriver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.reads.is_empty() || !self.buffer.is_empty() || !self.writes.is_empty() {
            warn!(
                reverted_dequeues = self.reads.len(),
                dropped_enqueues = self.buffer.len() + self.writes.len(),
                "session dropped without flush, reverting tentative operations"
            );
        } else {
            debug!("session closed");
        }
        // Written-but-uncommitted payload bytes need no cleanup: nothing
        // references them and recovery writes past them.
        let reads = mem::take(&mut self.reads);
        self.queue.reinstate(&reads);
    }
}
