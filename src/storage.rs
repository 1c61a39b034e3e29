//! Abstraction over block storage: extent allocation, write-through, and
//! read-back with a completion handle.
//!
//! Grounded on the commitlog's `Repo` trait (`create_segment`,
//! `open_segment`, `remove_segment`) and its `Fs`/`mem::Memory` split: a
//! real, direct-I/O-aligned file backend and an in-memory stand-in used by
//! tests. Here the unit of storage is a fixed-size *extent* rather than an
//! open-ended append log, since a backup replica is always exactly
//! `segment_size` bytes.

use std::io;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::StorageError;

/// Opaque handle to an allocated extent. Only meaningful to the [`Storage`]
/// implementation that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) u64);

/// Capability set a backup server needs from its block storage layer.
///
/// Implementations may batch or coalesce writes internally, but completion
/// semantics must be per-request: a caller's `write`/`read` future resolves
/// only once *that* request's bytes have landed (or been filled).
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Reserve an on-device extent sized to the configured segment size.
    async fn allocate(&self) -> Result<Handle, StorageError>;

    /// Durably write `buf` to the extent identified by `handle`.
    async fn write(&self, handle: Handle, buf: &[u8]) -> Result<(), StorageError>;

    /// Fill `buf` from the extent identified by `handle`.
    async fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Release the extent, making it available for future `allocate` calls.
    async fn free(&self, handle: Handle) -> Result<(), StorageError>;
}

/// A fixed-size, pre-allocated flat-file storage backend.
///
/// The file is `capacity * segment_size` bytes, carved into `capacity`
/// fixed extents addressed by index — the on-disk analogue of
/// [`crate::pool::SegmentPool`]. Real direct I/O (`O_DIRECT`) is a platform-
/// and filesystem-specific concern outside this crate's scope; this backend
/// issues plain positioned reads/writes and leaves alignment enforcement to
/// the caller, which always hands it a [`crate::pool::PoolBuffer`]-backed
/// slice sized and aligned to `segment_size`.
pub struct FileStorage {
    file: Mutex<std::fs::File>,
    segment_size: u64,
    free: Mutex<Vec<u64>>,
}

impl FileStorage {
    pub fn open(path: &std::path::Path, capacity: u64, segment_size: u64) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(capacity * segment_size)?;
        Ok(Self {
            file: Mutex::new(file),
            segment_size,
            free: Mutex::new((0..capacity).rev().collect()),
        })
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn allocate(&self) -> Result<Handle, StorageError> {
        let mut free = self.free.lock();
        let idx = free.pop().ok_or(StorageError::OutOfSpace)?;
        Ok(Handle(idx))
    }

    async fn write(&self, handle: Handle, buf: &[u8]) -> Result<(), StorageError> {
        use std::os::unix::fs::FileExt;
        let offset = handle.0 * self.segment_size;
        let file = self.file.lock();
        file.write_all_at(buf, offset)?;
        file.sync_data()?;
        Ok(())
    }

    async fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<(), StorageError> {
        use std::os::unix::fs::FileExt;
        let offset = handle.0 * self.segment_size;
        let file = self.file.lock();
        file.read_exact_at(buf, offset)?;
        Ok(())
    }

    async fn free(&self, handle: Handle) -> Result<(), StorageError> {
        self.free.lock().push(handle.0);
        Ok(())
    }
}

/// In-memory storage backend for tests — a stand-in for the commitlog's
/// `repo::mem::Memory`, sized and extent-addressed rather than append-only.
pub struct MemoryStorage {
    extents: Mutex<Vec<Option<Arc<Mutex<Vec<u8>>>>>>,
    segment_size: usize,
}

impl MemoryStorage {
    pub fn new(capacity: usize, segment_size: usize) -> Self {
        Self {
            extents: Mutex::new((0..capacity).map(|_| None).collect()),
            segment_size,
        }
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn allocate(&self) -> Result<Handle, StorageError> {
        let mut extents = self.extents.lock();
        let idx = extents
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(StorageError::OutOfSpace)?;
        extents[idx] = Some(Arc::new(Mutex::new(vec![0u8; self.segment_size])));
        Ok(Handle(idx as u64))
    }

    async fn write(&self, handle: Handle, buf: &[u8]) -> Result<(), StorageError> {
        let extent = self.extent(handle)?;
        let mut data = extent.lock();
        data.clear();
        data.extend_from_slice(buf);
        Ok(())
    }

    async fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<(), StorageError> {
        let extent = self.extent(handle)?;
        let data = extent.lock();
        if data.len() != buf.len() {
            warn!(
                "memory storage read size mismatch: extent={} expected={} actual={}",
                handle.0,
                buf.len(),
                data.len()
            );
        }
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    async fn free(&self, handle: Handle) -> Result<(), StorageError> {
        let mut extents = self.extents.lock();
        let slot = extents
            .get_mut(handle.0 as usize)
            .ok_or_else(|| StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "no such extent")))?;
        *slot = None;
        debug!("freed extent {}", handle.0);
        Ok(())
    }
}

impl MemoryStorage {
    fn extent(&self, handle: Handle) -> Result<Arc<Mutex<Vec<u8>>>, StorageError> {
        let extents = self.extents.lock();
        extents
            .get(handle.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| StorageError::Io(io::Error::new(io::ErrorKind::NotFound, "no such extent")))
    }
}
