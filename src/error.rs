use std::io;

use thiserror::Error;

/// Errors produced while driving a single segment's state machine.
///
/// These correspond one-to-one to the state-machine violations named in the
/// error taxonomy: a request arrived for a segment that wasn't in the state
/// the operation requires.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("segment is not open")]
    NotOpen,
    #[error("segment is already closed")]
    AlreadyClosed,
    #[error("segment has been freed")]
    Freed,
    #[error("segment has not been persisted yet")]
    NotPersisted,
    #[error("segment is still open")]
    StillOpen,
    #[error("the last reload attempt for this segment failed")]
    LoadFailed,
    #[error("write of {len} bytes at offset {offset} overruns segment size {segment_size}")]
    OutOfRange { offset: u64, len: u64, segment_size: u64 },
}

/// Errors returned by the [`crate::pool::SegmentPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("segment pool exhausted")]
    Exhausted,
}

/// Errors returned by a [`crate::storage::Storage`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend has no free extents")]
    OutOfSpace,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Top-level error type returned by [`crate::server::BackupServer`] handlers.
///
/// Composes the per-component errors above, so a handler can propagate with
/// `?` and translate the result into a wire status code at the dispatch
/// boundary (see [`crate::dispatch::status_of`]).
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("segment ({master_id}, {segment_id}) is already open")]
    AlreadyOpen { master_id: u64, segment_id: u64 },
    #[error("segment ({master_id}, {segment_id}) is not present in the registry")]
    Unavailable { master_id: u64, segment_id: u64 },
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("startReadingData has not been called for master {0}")]
    RecoveryNotStarted(u64),
}
