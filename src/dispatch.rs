//! Typed request/response shapes for the dispatch surface named in spec §6:
//! `OpenSegment`, `WriteSegment`, `CloseSegment`, `FreeSegment`,
//! `StartReadingData`, `GetRecoveryData`.
//!
//! The actual transport framing and routing loop are out of scope (spec
//! §1); this module is the in-process boundary a transport hands typed
//! requests across. [`crate::server::BackupServer::dispatch`] is the
//! routing function itself.

use bitflags::bitflags;

use crate::error::{BackupError, PoolError, SegmentError, StorageError};
use crate::recovery::RecoveryPayload;
use crate::wire::TabletConfig;

bitflags! {
    /// `WriteSegment`'s convenience flags (spec §6): combine `OPEN` (create
    /// the segment if absent) and `CLOSE` (close it after this write) to
    /// cut round trips.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u8 {
        const OPEN = 0b0000_0001;
        const CLOSE = 0b0000_0010;
    }
}

/// One request as the dispatch surface would receive it after the
/// transport has decoded the fixed header + payload (spec §6's RPC table).
#[derive(Debug)]
pub enum BackupRequest {
    OpenSegment {
        master_id: u64,
        segment_id: u64,
    },
    WriteSegment {
        master_id: u64,
        segment_id: u64,
        offset: u64,
        flags: WriteFlags,
        data: Vec<u8>,
    },
    CloseSegment {
        master_id: u64,
        segment_id: u64,
    },
    FreeSegment {
        master_id: u64,
        segment_id: u64,
    },
    StartReadingData {
        master_id: u64,
        tablets: TabletConfig,
    },
    GetRecoveryData {
        master_id: u64,
        segment_id: u64,
        partition_index: usize,
    },
}

/// Status codes from the error taxonomy of spec §7, carried in the
/// response header alongside `0 = OK` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    BadRequest = 1,
    SegmentAlreadyOpen = 2,
    SegmentNotOpen = 3,
    SegmentAlreadyClosed = 4,
    SegmentFreed = 5,
    SegmentUnavailable = 6,
    PoolExhausted = 7,
    StorageOutOfSpace = 8,
    StorageIoError = 9,
}

/// The dispatch surface's reply. Transports map this onto the concrete
/// wire response header/payload pairs of spec §6.
#[derive(Debug)]
pub enum BackupResponse {
    Ok,
    SegmentIds(Vec<u64>),
    RecoveryData(RecoveryPayload),
    Error(Status),
}

/// Translate a handler error into the wire status code a transport would
/// send back (spec §7's propagation policy: handlers never terminate the
/// server, they just report a status).
pub fn status_of(err: &BackupError) -> Status {
    match err {
        BackupError::BadRequest(_) | BackupError::RecoveryNotStarted(_) => Status::BadRequest,
        BackupError::AlreadyOpen { .. } => Status::SegmentAlreadyOpen,
        BackupError::Unavailable { .. } => Status::SegmentUnavailable,
        BackupError::Segment(segment_err) => match segment_err {
            SegmentError::NotOpen | SegmentError::NotPersisted | SegmentError::StillOpen => Status::SegmentNotOpen,
            SegmentError::AlreadyClosed => Status::SegmentAlreadyClosed,
            SegmentError::Freed => Status::SegmentFreed,
            SegmentError::LoadFailed => Status::SegmentUnavailable,
            SegmentError::OutOfRange { .. } => Status::BadRequest,
        },
        BackupError::Pool(PoolError::Exhausted) => Status::PoolExhausted,
        BackupError::Storage(storage_err) => match storage_err {
            StorageError::OutOfSpace => Status::StorageOutOfSpace,
            StorageError::Io(_) => Status::StorageIoError,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flags_combine() {
        let flags = WriteFlags::OPEN | WriteFlags::CLOSE;
        assert!(flags.contains(WriteFlags::OPEN));
        assert!(flags.contains(WriteFlags::CLOSE));
        assert!(!WriteFlags::OPEN.contains(WriteFlags::CLOSE));
    }

    #[test]
    fn status_of_maps_pool_exhausted() {
        assert_eq!(status_of(&BackupError::Pool(PoolError::Exhausted)), Status::PoolExhausted);
    }
}
