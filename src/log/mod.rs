//! Binary framing for the append-only transaction log.
//!
//! The log is a sequence of records, one per committed transaction, read
//! back sequentially from offset 0 on every open. All integers are
//! little-endian:
//!
//! ```text
//! +----------------+-------------+-------------------+--------------+
//! | START (16 B)   | count (u32) | operation * count | END (16 B)   |
//! +----------------+-------------+-------------------+--------------+
//!
//! operation := kind (u8) | file_number (u32) | start (u64) | length (u32)
//! ```
//!
//! [START_MARKER] and [END_MARKER] are fixed, distinct 16-byte values that
//! make record boundaries recognizable even though payload coordinates may
//! contain arbitrary bytes. A record is only accepted when its start
//! marker, operation tags, and end marker all line up; anything else is
//! corruption at that transaction.
//!
//! # Repair
//!
//! Like sqlite and rocksdb, a bad tail can be treated as the new end of the
//! log: [Replayer::valid_offset] reports the end of the last complete
//! record so the caller can truncate to it and continue. Under the strict
//! policy the same condition is surfaced as [Error::Corrupted], naming the
//! 1-based index of the offending transaction.

use crate::driver::{self, File};
use bytes::{Buf, BufMut};
use thiserror::Error;
use tracing::trace;

/// Marks the start of a transaction record.
pub const START_MARKER: [u8; 16] = [
    0x83, 0x6D, 0x1F, 0x52, 0xF2, 0x11, 0x47, 0x0B, 0x94, 0x3E, 0x66, 0x0A, 0xD9, 0x8E, 0x5C, 0x21,
];

/// Marks the end of a transaction record.
pub const END_MARKER: [u8; 16] = [
    0x3C, 0x97, 0xE5, 0x48, 0x5B, 0xAD, 0x41, 0xC6, 0xA0, 0x7F, 0x24, 0xB2, 0x19, 0xF3, 0x6A, 0x8D,
];

/// Serialized size of one [Operation].
pub const OPERATION_SIZE: usize = 17;

/// Errors that can occur when interacting with the transaction log.
#[derive(Debug, Error)]
pub enum Error {
    #[error("driver error: {0}")]
    Driver(#[from] driver::Error),
    #[error(
        "Unexpected data in transaction log. Expected to get transaction separator \
         but got unknown data. Tx #{0}"
    )]
    Corrupted(u64),
}

/// What a transaction did to one byte range of one data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// The range was written and now holds a live entry.
    Enqueue = 0,
    /// The range's entry was consumed.
    Dequeue = 1,
}

/// One element of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub file_number: u32,
    pub start: u64,
    pub length: u32,
}

impl Operation {
    pub fn enqueue(file_number: u32, start: u64, length: u32) -> Self {
        Self {
            kind: OperationKind::Enqueue,
            file_number,
            start,
            length,
        }
    }

    pub fn dequeue(file_number: u32, start: u64, length: u32) -> Self {
        Self {
            kind: OperationKind::Dequeue,
            file_number,
            start,
            length,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind as u8);
        buf.put_u32_le(self.file_number);
        buf.put_u64_le(self.start);
        buf.put_u32_le(self.length);
    }

    /// Decode one operation from exactly [OPERATION_SIZE] bytes. `None` on
    /// an unknown kind tag.
    fn decode(mut buf: &[u8]) -> Option<Self> {
        let kind = match buf.get_u8() {
            0 => OperationKind::Enqueue,
            1 => OperationKind::Dequeue,
            _ => return None,
        };
        Some(Self {
            kind,
            file_number: buf.get_u32_le(),
            start: buf.get_u64_le(),
            length: buf.get_u32_le(),
        })
    }
}

/// Encode one transaction as a separator-terminated record.
pub fn encode_record(operations: &[Operation]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36 + operations.len() * OPERATION_SIZE);
    buf.put_slice(&START_MARKER);
    buf.put_u32_le(operations.len() as u32);
    for operation in operations {
        operation.encode(&mut buf);
    }
    buf.put_slice(&END_MARKER);
    buf
}

/// Sequential reader over a transaction log file.
///
/// Reads are buffered in chunks of the configured read buffer size; records
/// never need to be resident all at once beyond one refill.
pub struct Replayer<F: File> {
    file: F,
    size: u64,
    position: u64,
    /// End offset of the last complete record.
    valid: u64,
    /// Count of complete records read so far.
    transactions: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    read_buffer: usize,
}

impl<F: File> Replayer<F> {
    pub fn new(file: F, size: u64, read_buffer: usize) -> Self {
        Self {
            file,
            size,
            position: 0,
            valid: 0,
            transactions: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            read_buffer: read_buffer.max(64),
        }
    }

    /// End offset of the last complete record; the log's new size if the
    /// caller decides to truncate a bad tail.
    pub fn valid_offset(&self) -> u64 {
        self.valid
    }

    /// Number of complete transactions read so far.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// Copy the next `len` bytes out of the log, refilling the buffer as
    /// needed. `None` when fewer than `len` bytes remain.
    async fn take(&mut self, len: usize) -> Result<Option<Vec<u8>>, Error> {
        if self.size - self.position < len as u64 {
            return Ok(None);
        }
        let within = (self.position - self.buffer_start) as usize;
        if self.position < self.buffer_start || within + len > self.buffer.len() {
            let available = (self.size - self.position) as usize;
            let fill = available.min(self.read_buffer.max(len));
            self.buffer = self.file.read_at(vec![0u8; fill], self.position).await?;
            self.buffer_start = self.position;
        }
        let within = (self.position - self.buffer_start) as usize;
        let bytes = self.buffer[within..within + len].to_vec();
        self.position += len as u64;
        Ok(Some(bytes))
    }

    /// Read the next transaction's operations.
    ///
    /// Returns `Ok(None)` at a clean end of the log. Any malformed or
    /// truncated record yields [Error::Corrupted] with the 1-based index of
    /// the offending transaction; [Replayer::valid_offset] then reports
    /// where the good prefix ends.
    pub async fn next(&mut self) -> Result<Option<Vec<Operation>>, Error> {
        if self.position == self.size {
            return Ok(None);
        }
        let index = self.transactions + 1;
        let start = match self.take(START_MARKER.len()).await? {
            Some(bytes) => bytes,
            None => return Err(Error::Corrupted(index)),
        };
        if start != START_MARKER {
            return Err(Error::Corrupted(index));
        }
        let count = match self.take(4).await? {
            Some(bytes) => (&bytes[..]).get_u32_le(),
            None => return Err(Error::Corrupted(index)),
        };
        // A garbage count reads past the end of the log.
        let body = (count as u64) * OPERATION_SIZE as u64 + END_MARKER.len() as u64;
        if self.size - self.position < body {
            return Err(Error::Corrupted(index));
        }
        let mut operations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let bytes = match self.take(OPERATION_SIZE).await? {
                Some(bytes) => bytes,
                None => return Err(Error::Corrupted(index)),
            };
            match Operation::decode(&bytes) {
                Some(operation) => operations.push(operation),
                None => return Err(Error::Corrupted(index)),
            }
        }
        match self.take(END_MARKER.len()).await? {
            Some(bytes) if bytes == END_MARKER => {}
            _ => return Err(Error::Corrupted(index)),
        }
        self.transactions = index;
        self.valid = self.position;
        trace!(transaction = index, operations = operations.len(), "replayed record");
        Ok(Some(operations))
    }
}
