//! Atomic persistence of the queue's checkpoint.
//!
//! The checkpoint (`meta.state`) caches what a full replay of the
//! transaction log would reconstruct: the current write file and position,
//! the transaction counter, and every live byte range per data file. It is
//! rewritten after each successful commit through the driver's atomic-write
//! protocol, so a torn rewrite always leaves either the old or the new
//! snapshot recoverable.
//!
//! The checkpoint is advisory. The transaction log is the source of truth:
//! a checkpoint that is missing, torn, or checksum-mismatched is discarded
//! with a warning and rebuilt from replay, and a checkpoint that lags the
//! log is simply overwritten.
//!
//! # Format
//!
//! Little-endian, with a trailing CRC32 over everything before it:
//!
//! ```text
//! +------------+---------------+----------------+------------+
//! | write_file | write_position| transaction_id | file_count |
//! |   (u32)    |     (u64)     |      (u64)     |   (u32)    |
//! +------------+---------------+----------------+------------+
//! | per file: file_number (u32) | range_count (u32)          |
//! |           { start (u64) | length (u32) } * range_count   |
//! +------------------------------------------+---------------+
//! | CRC32 (u32)                                              |
//! +----------------------------------------------------------+
//! ```

mod storage;
pub use storage::{CheckpointStore, MetaState};

use thiserror::Error;

/// Name of the checkpoint file in the queue directory.
pub const META_STATE: &str = "meta.state";

/// Errors that can occur when interacting with the checkpoint store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("driver error: {0}")]
    Driver(#[from] crate::driver::Error),
}
