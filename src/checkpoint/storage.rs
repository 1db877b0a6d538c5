//! Checkpoint codec and store.

use super::{Error, META_STATE};
use crate::driver::FileDriver;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Snapshot of the queue state that replaying the transaction log would
/// reconstruct.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaState {
    /// Data file currently being appended to.
    pub write_file: u32,
    /// Next append offset within the write file.
    pub write_position: u64,
    /// Count of committed transactions.
    pub transaction_id: u64,
    /// Live `(start, length)` ranges per data file, in offset order.
    /// Zero-length entries may repeat a start offset, so this is a list
    /// rather than a map.
    pub live: BTreeMap<u32, Vec<(u64, u32)>>,
}

impl MetaState {
    fn encode(&self) -> Vec<u8> {
        let ranges: usize = self.live.values().map(|ranges| ranges.len()).sum();
        let mut buf = Vec::with_capacity(28 + self.live.len() * 8 + ranges * 12);
        buf.put_u32_le(self.write_file);
        buf.put_u64_le(self.write_position);
        buf.put_u64_le(self.transaction_id);
        buf.put_u32_le(self.live.len() as u32);
        for (file_number, ranges) in &self.live {
            buf.put_u32_le(*file_number);
            buf.put_u32_le(ranges.len() as u32);
            for &(start, length) in ranges {
                buf.put_u64_le(start);
                buf.put_u32_le(length);
            }
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf
    }

    /// Decode a checkpoint payload. `None` when the payload is short, has
    /// trailing bytes, or fails its checksum: all shapes a torn write can
    /// take, all handled by rebuilding from the log.
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 28 {
            return None;
        }
        let (body, trailer) = buf.split_at(buf.len() - 4);
        let stored = (&trailer[..]).get_u32_le();
        if crc32fast::hash(body) != stored {
            return None;
        }
        let mut body = body;
        let write_file = body.get_u32_le();
        let write_position = body.get_u64_le();
        let transaction_id = body.get_u64_le();
        let files = body.get_u32_le();
        let mut live = BTreeMap::new();
        for _ in 0..files {
            if body.remaining() < 8 {
                return None;
            }
            let file_number = body.get_u32_le();
            let count = body.get_u32_le();
            if body.remaining() < count as usize * 12 {
                return None;
            }
            let mut ranges = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let start = body.get_u64_le();
                let length = body.get_u32_le();
                ranges.push((start, length));
            }
            live.insert(file_number, ranges);
        }
        if body.has_remaining() {
            return None;
        }
        Some(Self {
            write_file,
            write_position,
            transaction_id,
            live,
        })
    }
}

/// Reads and writes `meta.state` through the driver's atomic-write
/// protocol.
#[derive(Clone)]
pub struct CheckpointStore<D: FileDriver> {
    driver: D,
}

impl<D: FileDriver> CheckpointStore<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// Load the checkpoint. Absent, torn, or corrupt checkpoints all come
    /// back as `None`; the caller rebuilds from the log.
    pub async fn load(&self) -> Result<Option<MetaState>, Error> {
        let Some(contents) = self.driver.atomic_read(META_STATE).await? else {
            return Ok(None);
        };
        match MetaState::decode(&contents) {
            Some(meta) => {
                debug!(
                    write_file = meta.write_file,
                    write_position = meta.write_position,
                    transaction_id = meta.transaction_id,
                    "loaded checkpoint"
                );
                Ok(Some(meta))
            }
            None => {
                warn!("discarding unreadable checkpoint, rebuilding from log");
                Ok(None)
            }
        }
    }

    /// Persist the checkpoint.
    pub async fn store(&self, meta: &MetaState) -> Result<(), Error> {
        self.driver.atomic_write(META_STATE, meta.encode()).await?;
        Ok(())
    }
}
