//! Queue core: recovery, the committed-entry queue, writer serialization,
//! and the commit pipeline.

use super::{metrics::Metrics, Config, Error, Session};
use crate::{
    checkpoint::{CheckpointStore, MetaState},
    driver::{File, FileDriver, Lock as _, DELETED_INFIX},
    log::{self, encode_record, Operation, OperationKind, Replayer},
};
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex as StdMutex,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, time};
use tracing::{debug, warn};

/// Name of the exclusive lock file.
pub(crate) const LOCK: &str = "lock";

/// Name of the transaction log file.
pub(crate) const TRANSACTION_LOG: &str = "transaction.log";

const DATA_PREFIX: &str = "data.";

/// Delay between lock attempts in [Queue::wait_for].
const WAIT_FOR_INTERVAL: Duration = Duration::from_millis(100);

/// Name of data file `file_number` (zero-padded, growing past four digits
/// as needed).
pub(crate) fn data_name(file_number: u32) -> String {
    format!("{DATA_PREFIX}{file_number:04}")
}

fn parse_data_name(name: &str) -> Option<u32> {
    name.strip_prefix(DATA_PREFIX)?.parse().ok()
}

/// Coordinates of one stored payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub file_number: u32,
    pub start: u64,
    pub length: u32,
}

/// Live entries starting at one offset of one data file.
///
/// Zero-length entries consume no bytes, so any number of them can pile up
/// at the same offset alongside at most one sized entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Slot {
    zeros: u32,
    sized: Option<u32>,
}

type LiveMap = BTreeMap<u32, BTreeMap<u64, Slot>>;

/// In-memory queue state. Guarded by a non-async mutex and never held
/// across an await, which lets abandoned sessions reinstate synchronously
/// from `Drop`.
struct State {
    /// Committed entries not yet handed to any session, in FIFO order.
    entries: VecDeque<Entry>,
    live: LiveMap,
    transaction_id: u64,
    /// Mirrors of the writer's file and position, for checkpoint snapshots.
    write_file: u32,
    write_position: u64,
    /// Set on an unrecoverable conflict; all further commits are refused
    /// until the queue is reopened.
    poisoned: bool,
}

/// The current append target. Guarded by an async mutex so only one
/// session writes at a time.
struct Writer<F> {
    file_number: u32,
    position: u64,
    handle: F,
}

/// The transaction log's append handle and size. Its mutex also sequences
/// the whole commit pipeline.
struct LogWriter<F> {
    handle: F,
    size: u64,
}

/// Everything recovery rebuilds before the queue takes ownership of the
/// directory lock.
struct Recovered<D: FileDriver> {
    checkpoint: CheckpointStore<D>,
    state: State,
    writer: Writer<D::File>,
    log: LogWriter<D::File>,
    files: BTreeMap<u32, D::File>,
    metrics: Metrics,
}

pub(crate) struct Shared<D: FileDriver> {
    pub(crate) driver: D,
    pub(crate) cfg: Config,
    checkpoint: CheckpointStore<D>,
    state: StdMutex<State>,
    writer: Mutex<Writer<D::File>>,
    commit: Mutex<LogWriter<D::File>>,
    files: StdMutex<BTreeMap<u32, D::File>>,
    pub(crate) metrics: Metrics,
    /// Taken (and released) by [Queue::close]; the drop fallback covers a
    /// queue that is never closed.
    lock: StdMutex<Option<D::Lock>>,
}

/// A durable FIFO queue of byte payloads with transactional sessions.
///
/// Cheap to clone; clones share the same state. The directory lock is
/// released when the last clone (and session) drops.
pub struct Queue<D: FileDriver> {
    pub(crate) shared: Arc<Shared<D>>,
}

impl<D: FileDriver> std::fmt::Debug for Queue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").finish_non_exhaustive()
    }
}

impl<D: FileDriver> Clone for Queue<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: FileDriver> Queue<D> {
    /// Open the queue, recovering durable state.
    ///
    /// Fails immediately with lock contention if another live holder owns
    /// the directory; use [Queue::wait_for] to retry. With
    /// [Config::allow_truncated_entries] unset, a corrupt transaction log
    /// fails the open; otherwise the log is truncated to its last good
    /// record and recovery continues.
    pub async fn open(driver: D, cfg: Config, registry: &mut Registry) -> Result<Self, Error> {
        let cfg = cfg.validated();
        let lock = driver.lock(LOCK).await?;
        let recovered = match Self::recover(driver.clone(), &cfg, registry).await {
            Ok(recovered) => recovered,
            Err(err) => {
                // Give the lock back before surfacing the failure so an
                // immediate retry (for example with a different truncation
                // policy) does not contend with our own leftover file.
                if let Err(release) = lock.release().await {
                    warn!(error = %release, "failed to release queue lock");
                }
                return Err(err);
            }
        };
        Ok(Self {
            shared: Arc::new(Shared {
                driver,
                cfg,
                checkpoint: recovered.checkpoint,
                state: StdMutex::new(recovered.state),
                writer: Mutex::new(recovered.writer),
                commit: Mutex::new(recovered.log),
                files: StdMutex::new(recovered.files),
                metrics: recovered.metrics,
                lock: StdMutex::new(Some(lock)),
            }),
        })
    }

    /// Rebuild durable state: sweep, load the checkpoint, replay the log,
    /// compute the write target, rewrite the checkpoint, and retire dead
    /// files. The caller holds the directory lock.
    async fn recover(
        driver: D,
        cfg: &Config,
        registry: &mut Registry,
    ) -> Result<Recovered<D>, Error> {
        // Sweep deletions a crash left half-finished.
        for name in driver.scan().await? {
            if name.contains(DELETED_INFIX) {
                warn!(name = %name, "sweeping orphaned deletion");
                driver.remove(&name).await?;
            }
        }

        // The checkpoint is advisory: it contributes the write-file hint,
        // while the log replay below is authoritative for everything.
        let checkpoint = CheckpointStore::new(driver.clone());
        let hint = checkpoint.load().await?;

        // Replay the transaction log from offset 0.
        let (log_handle, log_size) = driver.open(TRANSACTION_LOG).await?;
        let mut live = LiveMap::new();
        let mut replayer = Replayer::new(log_handle, log_size, cfg.suggested_read_buffer);
        let mut transactions = 0u64;
        loop {
            match replayer.next().await {
                Ok(Some(operations)) => {
                    apply(&mut live, &operations)?;
                    transactions += 1;
                }
                Ok(None) => break,
                Err(log::Error::Corrupted(transaction)) => {
                    if !cfg.allow_truncated_entries {
                        return Err(log::Error::Corrupted(transaction).into());
                    }
                    let valid = replayer.valid_offset();
                    warn!(
                        transaction,
                        valid, "corrupt transaction log tail, truncating"
                    );
                    let prefix = if valid == 0 {
                        Vec::new()
                    } else {
                        let (handle, _) = driver.open(TRANSACTION_LOG).await?;
                        handle.read_at(vec![0u8; valid as usize], 0).await?
                    };
                    driver.atomic_write(TRANSACTION_LOG, prefix).await?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        drop(replayer);

        // Reopen the log: truncation replaced the file, and the append
        // handle must be against whatever is now on disk.
        let (log_handle, log_size) = driver.open(TRANSACTION_LOG).await?;

        // The write target is the highest-numbered data file anyone knows
        // about; the write position is its physical end, which skips over
        // any uncommitted garbage from opportunistic writes.
        let on_disk: Vec<u32> = driver
            .scan()
            .await?
            .iter()
            .filter_map(|name| parse_data_name(name))
            .collect();
        let mut write_file = hint.as_ref().map(|h| h.write_file).unwrap_or(0);
        if let Some(max) = on_disk.iter().copied().max() {
            write_file = write_file.max(max);
        }
        if let Some(max) = live.keys().next_back() {
            write_file = write_file.max(*max);
        }
        let (write_handle, write_position) = driver.open(&data_name(write_file)).await?;

        // Keep every file with live entries open for payload reads.
        let mut files = BTreeMap::new();
        for file_number in live.keys().copied().collect::<Vec<_>>() {
            if file_number != write_file {
                let (handle, _) = driver.open(&data_name(file_number)).await?;
                files.insert(file_number, handle);
            }
        }
        files.insert(write_file, write_handle);

        // Head pointer: oldest live entry first.
        let entries: VecDeque<Entry> = flatten(&live).collect();

        let meta = MetaState {
            write_file,
            write_position,
            transaction_id: transactions,
            live: checkpoint_live(&live),
        };
        checkpoint.store(&meta).await?;

        // Data files fully drained before the write file are dead weight.
        for file_number in on_disk {
            if file_number < write_file && !live.contains_key(&file_number) {
                debug!(file_number, "retiring drained data file");
                driver.prepare_delete(&data_name(file_number)).await?;
            }
        }
        driver.finalise().await?;

        let metrics = Metrics::init(registry);
        metrics.items.set(entries.len() as i64);
        debug!(
            write_file,
            write_position,
            transactions,
            entries = entries.len(),
            "queue opened"
        );

        let write_handle = files.get(&write_file).unwrap().clone();
        Ok(Recovered {
            checkpoint,
            state: State {
                entries,
                live,
                transaction_id: transactions,
                write_file,
                write_position,
                poisoned: false,
            },
            writer: Writer {
                file_number: write_file,
                position: write_position,
                handle: write_handle,
            },
            log: LogWriter {
                handle: log_handle,
                size: log_size,
            },
            files,
            metrics,
        })
    }

    /// Retry [Queue::open] while the directory is locked, up to `timeout`.
    pub async fn wait_for(
        driver: D,
        cfg: Config,
        registry: &mut Registry,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let deadline = time::Instant::now() + timeout;
        loop {
            match Self::open(driver.clone(), cfg.clone(), registry).await {
                Ok(queue) => return Ok(queue),
                Err(err) if err.is_lock_contention() && time::Instant::now() < deadline => {
                    time::sleep(WAIT_FOR_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Open a transactional session.
    pub fn open_session(&self) -> Session<D> {
        Session::new(self.clone())
    }

    /// Committed entries awaiting dequeue, excluding tentative dequeues
    /// held by live sessions.
    pub fn estimated_count(&self) -> u64 {
        self.shared.state.lock().unwrap().entries.len() as u64
    }

    /// Sync outstanding writes, rewrite the checkpoint, finalise any
    /// pending deletions, and release the directory lock.
    pub async fn close(self) -> Result<(), Error> {
        {
            let writer = self.shared.writer.lock().await;
            writer.handle.sync().await?;
        }
        let log = self.shared.commit.lock().await;
        log.handle.sync().await?;
        let meta = self.snapshot();
        self.shared.checkpoint.store(&meta).await?;
        drop(log);
        self.shared.driver.finalise().await?;
        let lock = self.shared.lock.lock().unwrap().take();
        if let Some(lock) = lock {
            lock.release().await?;
        }
        debug!("queue closed");
        Ok(())
    }

    fn snapshot(&self) -> MetaState {
        let state = self.shared.state.lock().unwrap();
        MetaState {
            write_file: state.write_file,
            write_position: state.write_position,
            transaction_id: state.transaction_id,
            live: checkpoint_live(&state.live),
        }
    }

    /// Handle for a data file, opened on first use and cached.
    async fn file_handle(&self, file_number: u32) -> Result<D::File, Error> {
        if let Some(handle) = self.shared.files.lock().unwrap().get(&file_number) {
            return Ok(handle.clone());
        }
        let (handle, _) = self.shared.driver.open(&data_name(file_number)).await?;
        Ok(self
            .shared
            .files
            .lock()
            .unwrap()
            .entry(file_number)
            .or_insert(handle)
            .clone())
    }

    /// Write a batch of payloads at the tail, rolling to new data files as
    /// [Config::max_file_size] requires, and return the Enqueue operations
    /// describing where each payload landed. The bytes are invisible to
    /// readers until the operations are committed.
    pub(crate) async fn write(&self, payloads: Vec<Vec<u8>>) -> Result<Vec<Operation>, Error> {
        let mut writer = self.shared.writer.lock().await;
        let mut operations = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let length = payload.len();
            if writer.position > 0
                && length > 0
                && writer.position + length as u64 > self.shared.cfg.max_file_size
            {
                // Seal the current file and roll. A payload larger than the
                // limit still lands in one file: entries are contiguous.
                writer.handle.sync().await?;
                let file_number = writer.file_number + 1;
                let (handle, size) = self.shared.driver.open(&data_name(file_number)).await?;
                self.shared
                    .files
                    .lock()
                    .unwrap()
                    .insert(file_number, handle.clone());
                debug!(file_number, "rolled to new data file");
                writer.file_number = file_number;
                writer.position = size;
                writer.handle = handle;
            }
            let start = writer.position;
            if length > 0 {
                writer.handle.write_at(payload, start).await?;
            }
            operations.push(Operation::enqueue(writer.file_number, start, length as u32));
            writer.position += length as u64;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.write_file = writer.file_number;
        state.write_position = writer.position;
        Ok(operations)
    }

    /// Take the head entry and read its payload. `None` when the queue is
    /// empty. The entry is tentatively removed from the shared view; the
    /// caller commits the removal or reinstates it.
    pub(crate) async fn dequeue(&self) -> Result<Option<(Entry, Vec<u8>)>, Error> {
        let entry = {
            let mut state = self.shared.state.lock().unwrap();
            let entry = state.entries.pop_front();
            self.shared.metrics.items.set(state.entries.len() as i64);
            entry
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.length == 0 {
            return Ok(Some((entry, Vec::new())));
        }
        let payload = match self.file_handle(entry.file_number).await {
            Ok(handle) => {
                handle
                    .read_at(vec![0u8; entry.length as usize], entry.start)
                    .await
            }
            Err(err) => {
                self.reinstate(&[entry]);
                return Err(err);
            }
        };
        match payload {
            Ok(payload) => Ok(Some((entry, payload))),
            Err(err) => {
                self.reinstate(&[entry]);
                Err(err.into())
            }
        }
    }

    /// Return tentatively dequeued entries to the head of the queue in
    /// their original FIFO order.
    pub(crate) fn reinstate(&self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        for entry in entries.iter().rev() {
            state.entries.push_front(*entry);
        }
        self.shared.metrics.items.set(state.entries.len() as i64);
        self.shared.metrics.reinstated.inc_by(entries.len() as u64);
    }

    /// Commit a transaction: make its payload bytes durable, append and
    /// sync the log record, apply the operations to shared state, rewrite
    /// the checkpoint, and retire drained data files.
    ///
    /// A failure before the log sync leaves nothing committed. A
    /// checkpoint failure after it is logged and absorbed (the log is the
    /// source of truth). Retirement failures after it surface as
    /// [Error::PendingWrites] even though the transaction stands.
    pub(crate) async fn commit(&self, operations: Vec<Operation>) -> Result<(), Error> {
        if operations.is_empty() {
            return Ok(());
        }
        if self.shared.state.lock().unwrap().poisoned {
            return Err(Error::Poisoned);
        }
        let mut log = self.shared.commit.lock().await;

        // Payload bytes must hit disk before the record that references
        // them.
        let mut touched: Vec<u32> = operations
            .iter()
            .filter(|op| op.kind == OperationKind::Enqueue && op.length > 0)
            .map(|op| op.file_number)
            .collect();
        touched.sort_unstable();
        touched.dedup();
        for file_number in touched {
            self.file_handle(file_number).await?.sync().await?;
        }

        let record = encode_record(&operations);
        let record_len = record.len() as u64;
        log.handle.write_at(record, log.size).await?;
        log.handle.sync().await?;
        log.size += record_len;

        // The transaction is now durable.
        let (meta, retired) = {
            let mut state = self.shared.state.lock().unwrap();
            if let Err(err) = apply(&mut state.live, &operations) {
                state.poisoned = true;
                warn!(error = %err, "unrecoverable conflict, queue poisoned");
                return Err(err);
            }
            for op in &operations {
                if op.kind == OperationKind::Enqueue {
                    state.entries.push_back(Entry {
                        file_number: op.file_number,
                        start: op.start,
                        length: op.length,
                    });
                }
            }
            state.transaction_id += 1;
            let mut retired: Vec<u32> = operations
                .iter()
                .filter(|op| {
                    op.kind == OperationKind::Dequeue
                        && op.file_number < state.write_file
                        && !state.live.contains_key(&op.file_number)
                })
                .map(|op| op.file_number)
                .collect();
            retired.sort_unstable();
            retired.dedup();
            self.shared.metrics.items.set(state.entries.len() as i64);
            let meta = MetaState {
                write_file: state.write_file,
                write_position: state.write_position,
                transaction_id: state.transaction_id,
                live: checkpoint_live(&state.live),
            };
            (meta, retired)
        };
        self.shared.metrics.transactions.inc();

        if let Err(err) = self.shared.checkpoint.store(&meta).await {
            warn!(error = %err, "checkpoint rewrite failed; will rebuild from log on next open");
        }

        if log.size > self.shared.cfg.log_size_limit {
            self.compact(&mut log, &meta).await;
        }

        let mut failures = Vec::new();
        for file_number in retired {
            self.shared.files.lock().unwrap().remove(&file_number);
            match self.shared.driver.prepare_delete(&data_name(file_number)).await {
                Ok(()) => {
                    debug!(file_number, "retiring drained data file");
                    self.shared.metrics.retired.inc();
                }
                Err(err) => failures.push(err.into()),
            }
        }
        if let Err(err) = self.shared.driver.finalise().await {
            failures.push(err.into());
        }
        drop(log);
        if !failures.is_empty() {
            return Err(Error::PendingWrites(failures));
        }
        Ok(())
    }

    /// Rewrite the log as a single transaction enqueueing every live
    /// range. Failures are absorbed: the oversized log is still valid.
    async fn compact(&self, log: &mut LogWriter<D::File>, meta: &MetaState) {
        let operations: Vec<Operation> = meta
            .live
            .iter()
            .flat_map(|(file_number, ranges)| {
                let file_number = *file_number;
                ranges
                    .iter()
                    .map(move |&(start, length)| Operation::enqueue(file_number, start, length))
            })
            .collect();
        let compacted = encode_record(&operations);
        if compacted.len() as u64 >= log.size {
            return;
        }
        let before = log.size;
        if let Err(err) = self
            .shared
            .driver
            .atomic_write(TRANSACTION_LOG, compacted)
            .await
        {
            warn!(error = %err, "transaction log compaction failed");
            return;
        }
        match self.shared.driver.open(TRANSACTION_LOG).await {
            Ok((handle, size)) => {
                debug!(before, after = size, "compacted transaction log");
                log.handle = handle;
                log.size = size;
            }
            Err(err) => {
                warn!(error = %err, "failed to reopen compacted transaction log");
            }
        }
    }
}

/// Apply a committed transaction's operations to the live-range map.
/// Enqueues must not collide with or overlap a live range; dequeues must
/// exactly match one. Violations are unrecoverable.
fn apply(live: &mut LiveMap, operations: &[Operation]) -> Result<(), Error> {
    for op in operations {
        let conflict = || Error::RangeConflict {
            file_number: op.file_number,
            start: op.start,
            length: op.length,
        };
        match op.kind {
            OperationKind::Enqueue => {
                let slots = live.entry(op.file_number).or_default();
                if op.length == 0 {
                    slots.entry(op.start).or_default().zeros += 1;
                    continue;
                }
                if slots.get(&op.start).is_some_and(|slot| slot.sized.is_some()) {
                    return Err(conflict());
                }
                if let Some((start, slot)) = slots
                    .range(..op.start)
                    .rev()
                    .find(|(_, slot)| slot.sized.is_some())
                {
                    if start + slot.sized.unwrap() as u64 > op.start {
                        return Err(conflict());
                    }
                }
                if let Some((start, _)) = slots
                    .range(op.start + 1..)
                    .find(|(_, slot)| slot.sized.is_some())
                {
                    if op.start + op.length as u64 > *start {
                        return Err(conflict());
                    }
                }
                slots.entry(op.start).or_default().sized = Some(op.length);
            }
            OperationKind::Dequeue => {
                let Some(slots) = live.get_mut(&op.file_number) else {
                    return Err(conflict());
                };
                let Some(slot) = slots.get_mut(&op.start) else {
                    return Err(conflict());
                };
                if op.length == 0 {
                    if slot.zeros == 0 {
                        return Err(conflict());
                    }
                    slot.zeros -= 1;
                } else {
                    if slot.sized != Some(op.length) {
                        return Err(conflict());
                    }
                    slot.sized = None;
                }
                if slot.zeros == 0 && slot.sized.is_none() {
                    slots.remove(&op.start);
                }
                if slots.is_empty() {
                    live.remove(&op.file_number);
                }
            }
        }
    }
    Ok(())
}

/// All live entries in recovery order: by file, then start, with
/// zero-length entries before a sized entry at the same offset (they were
/// necessarily enqueued first, since a sized entry advances the position).
fn flatten(live: &LiveMap) -> impl Iterator<Item = Entry> + '_ {
    live.iter().flat_map(|(file_number, slots)| {
        let file_number = *file_number;
        slots.iter().flat_map(move |(start, slot)| {
            let start = *start;
            let zeros = (0..slot.zeros).map(move |_| Entry {
                file_number,
                start,
                length: 0,
            });
            let sized = slot.sized.into_iter().map(move |length| Entry {
                file_number,
                start,
                length,
            });
            zeros.chain(sized)
        })
    })
}

/// The live map in checkpoint form.
fn checkpoint_live(live: &LiveMap) -> BTreeMap<u32, Vec<(u64, u32)>> {
    let mut out: BTreeMap<u32, Vec<(u64, u32)>> = BTreeMap::new();
    for entry in flatten(live) {
        out.entry(entry.file_number)
            .or_default()
            .push((entry.start, entry.length));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_tracks_live_ranges() {
        let mut live = LiveMap::new();
        apply(
            &mut live,
            &[
                Operation::enqueue(0, 0, 4),
                Operation::enqueue(0, 4, 0),
                Operation::enqueue(0, 4, 0),
                Operation::enqueue(0, 4, 8),
            ],
        )
        .unwrap();
        let entries: Vec<Entry> = flatten(&live).collect();
        assert_eq!(
            entries,
            vec![
                Entry { file_number: 0, start: 0, length: 4 },
                Entry { file_number: 0, start: 4, length: 0 },
                Entry { file_number: 0, start: 4, length: 0 },
                Entry { file_number: 0, start: 4, length: 8 },
            ]
        );

        apply(
            &mut live,
            &[
                Operation::dequeue(0, 0, 4),
                Operation::dequeue(0, 4, 0),
                Operation::dequeue(0, 4, 8),
                Operation::dequeue(0, 4, 0),
            ],
        )
        .unwrap();
        assert!(live.is_empty());
    }

    #[test]
    fn test_apply_rejects_overlap_and_double_free() {
        let mut live = LiveMap::new();
        apply(&mut live, &[Operation::enqueue(0, 10, 8)]).unwrap();

        // Same start.
        assert!(matches!(
            apply(&mut live, &[Operation::enqueue(0, 10, 2)]),
            Err(Error::RangeConflict { .. })
        ));
        // Starts inside the live range.
        assert!(matches!(
            apply(&mut live, &[Operation::enqueue(0, 12, 4)]),
            Err(Error::RangeConflict { .. })
        ));
        // Ends inside the live range.
        assert!(matches!(
            apply(&mut live, &[Operation::enqueue(0, 4, 8)]),
            Err(Error::RangeConflict { .. })
        ));
        // Adjacent on both sides is fine.
        apply(
            &mut live,
            &[Operation::enqueue(0, 2, 8), Operation::enqueue(0, 18, 8)],
        )
        .unwrap();

        // Dequeue with the wrong length.
        assert!(matches!(
            apply(&mut live, &[Operation::dequeue(0, 10, 4)]),
            Err(Error::RangeConflict { .. })
        ));
        // Dequeue of a range that was never enqueued.
        assert!(matches!(
            apply(&mut live, &[Operation::dequeue(1, 0, 4)]),
            Err(Error::RangeConflict { .. })
        ));
        // Double free.
        apply(&mut live, &[Operation::dequeue(0, 10, 8)]).unwrap();
        assert!(matches!(
            apply(&mut live, &[Operation::dequeue(0, 10, 8)]),
            Err(Error::RangeConflict { .. })
        ));
    }

    #[test]
    fn test_data_names() {
        assert_eq!(data_name(0), "data.0000");
        assert_eq!(data_name(42), "data.0042");
        assert_eq!(data_name(123_456), "data.123456");
        assert_eq!(parse_data_name("data.0042"), Some(42));
        assert_eq!(parse_data_name("data.123456"), Some(123_456));
        assert_eq!(parse_data_name("data.0001.deleted.3"), None);
        assert_eq!(parse_data_name("transaction.log"), None);
    }
}
