//! Per-replica state machine: the progression of a single `(masterId,
//! segmentId)` replica from `UNINIT` through `OPEN`, `CLOSED`, and finally
//! `FREED`.
//!
//! Grounded on the commitlog's `segment::Writer`/`Header` split — a typed
//! wrapper around buffered I/O whose methods return `Result`s describing
//! precisely what went wrong — generalized here to a state machine with
//! four named states instead of one always-open writer, since a backup
//! replica (unlike a commitlog segment) is explicitly closed and later
//! reloaded for recovery.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{BackupError, SegmentError};
use crate::pool::{PoolBuffer, SegmentPool};
use crate::storage::{Handle, Storage};

/// State of an in-flight or past reload attempt for a `CLOSED` segment
/// whose buffer has been evicted.
enum LoadStatus {
    /// No load has been attempted since the buffer was last evicted.
    Idle,
    /// A read is in flight; waiters are woken via the held [`Notify`].
    InFlight(Arc<Notify>),
    /// The last attempt failed. A further `startLoading` call retries.
    Failed,
}

enum State {
    Uninit,
    Open {
        buffer: PoolBuffer,
        handle: Handle,
    },
    Closed {
        buffer: Option<PoolBuffer>,
        handle: Handle,
        load: LoadStatus,
    },
    Freed,
}

/// Human-readable label for the current state, used by the test-visibility
/// interface and log lines — the Rust replacement for a friend-class
/// testing hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLabel {
    Uninit,
    Open,
    Closed,
    Freed,
}

/// A single replica of one master's log segment.
///
/// `master_id` and `segment_id` are immutable for the lifetime of the
/// value; everything else is guarded by an internal mutex so concurrent
/// operations on *other* segments never block on this one (spec §5).
pub struct Segment {
    pub master_id: u64,
    pub segment_id: u64,
    segment_size: u64,
    pool: Arc<SegmentPool>,
    storage: Arc<dyn Storage>,
    state: Mutex<State>,
}

impl Segment {
    /// Construct a segment entry in `UNINIT` state. Does not touch the pool
    /// or storage backend; that happens in [`Segment::open`].
    pub fn new(master_id: u64, segment_id: u64, segment_size: u64, pool: Arc<SegmentPool>, storage: Arc<dyn Storage>) -> Self {
        Self {
            master_id,
            segment_id,
            segment_size,
            pool,
            storage,
            state: Mutex::new(State::Uninit),
        }
    }

    pub fn state_label(&self) -> StateLabel {
        match &*self.state.lock() {
            State::Uninit => StateLabel::Uninit,
            State::Open { .. } => StateLabel::Open,
            State::Closed { .. } => StateLabel::Closed,
            State::Freed => StateLabel::Freed,
        }
    }

    /// `true` if this segment currently holds a pool buffer (staged or
    /// reloaded), used by the pool/registry accounting invariant in tests.
    pub fn has_buffer(&self) -> bool {
        matches!(
            &*self.state.lock(),
            State::Open { .. } | State::Closed { buffer: Some(_), .. }
        )
    }

    /// `UNINIT -> OPEN`: reserve a storage extent and a pool buffer.
    /// Idempotent if already `OPEN` (open question resolved per spec §9).
    pub async fn open(&self) -> Result<(), BackupError> {
        {
            let state = self.state.lock();
            match &*state {
                State::Open { .. } => return Ok(()),
                State::Closed { .. } => return Err(SegmentError::AlreadyClosed.into()),
                State::Freed => return Err(SegmentError::Freed.into()),
                State::Uninit => {}
            }
        }

        let handle = self.storage.allocate().await?;
        let buffer = match self.pool.acquire() {
            Ok(buffer) => buffer,
            Err(err) => {
                let _ = self.storage.free(handle).await;
                return Err(err.into());
            }
        };

        let mut state = self.state.lock();
        match &*state {
            State::Uninit => {
                *state = State::Open { buffer, handle };
                Ok(())
            }
            // Lost a race with a concurrent opener (idempotent open) or a
            // close/free that ran while we were allocating: give back what
            // we reserved and defer to whatever won.
            State::Open { .. } => {
                drop(state);
                self.pool.release(buffer);
                let _ = self.storage.free(handle).await;
                Ok(())
            }
            State::Closed { .. } => {
                drop(state);
                self.pool.release(buffer);
                let _ = self.storage.free(handle).await;
                Err(SegmentError::AlreadyClosed.into())
            }
            State::Freed => {
                drop(state);
                self.pool.release(buffer);
                let _ = self.storage.free(handle).await;
                Err(SegmentError::Freed.into())
            }
        }
    }

    /// Copy `data` into the staging buffer at `offset`. Fails unless the
    /// segment is `OPEN`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), SegmentError> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Open { buffer, .. } => {
                let len = data.len() as u64;
                let fits = offset.checked_add(len).map(|end| end <= self.segment_size).unwrap_or(false);
                if !fits {
                    return Err(SegmentError::OutOfRange {
                        offset,
                        len,
                        segment_size: self.segment_size,
                    });
                }
                let start = offset as usize;
                buffer.as_mut_slice()[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            State::Uninit => Err(SegmentError::NotOpen),
            State::Closed { .. } => Err(SegmentError::AlreadyClosed),
            State::Freed => Err(SegmentError::Freed),
        }
    }

    /// `OPEN -> CLOSED`: write the staged buffer through to storage and
    /// block until the durability barrier returns. No-op if already
    /// `CLOSED`. On I/O failure the segment remains `OPEN` so the master
    /// may retry.
    pub async fn close(&self) -> Result<(), BackupError> {
        let (handle, staged) = {
            let state = self.state.lock();
            match &*state {
                State::Closed { .. } => return Ok(()),
                State::Uninit => return Err(SegmentError::NotOpen.into()),
                State::Freed => return Err(SegmentError::Freed.into()),
                State::Open { buffer, handle } => (*handle, buffer.as_slice().to_vec()),
            }
        };

        self.storage.write(handle, &staged).await?;

        let mut state = self.state.lock();
        let prev = std::mem::replace(&mut *state, State::Freed);
        match prev {
            State::Open { buffer, handle } => {
                self.pool.release(buffer);
                *state = State::Closed {
                    buffer: None,
                    handle,
                    load: LoadStatus::Idle,
                };
            }
            // A concurrent `free` observed us mid-write and already won;
            // the write-through above completed harmlessly, but there is
            // nothing left to transition.
            other => *state = other,
        }
        Ok(())
    }

    /// Hint that a load should be kicked off: if the buffer was evicted
    /// and no load is already in flight, acquire a buffer and dispatch an
    /// async read. Does not itself wait for the read to finish.
    pub async fn start_loading(self: &Arc<Self>) -> Result<(), SegmentError> {
        let (handle, notify) = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Uninit => return Err(SegmentError::NotPersisted),
                State::Open { .. } => return Err(SegmentError::StillOpen),
                State::Freed => return Err(SegmentError::Freed),
                State::Closed { buffer, load, handle } => {
                    if buffer.is_some() || matches!(load, LoadStatus::InFlight(_)) {
                        return Ok(());
                    }
                    let notify = Arc::new(Notify::new());
                    *load = LoadStatus::InFlight(Arc::clone(&notify));
                    (*handle, notify)
                }
            }
        };

        let segment = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = match segment.pool.acquire() {
                Ok(buf) => buf,
                Err(err) => {
                    warn!(
                        "failed to acquire buffer to reload segment ({}, {}): {err}",
                        segment.master_id, segment.segment_id
                    );
                    mark_load_failed(&segment);
                    notify.notify_waiters();
                    return;
                }
            };

            let result = segment.storage.read(handle, buf.as_mut_slice()).await;
            let mut state = segment.state.lock();
            if let State::Closed { buffer, load, .. } = &mut *state {
                match result {
                    Ok(()) => {
                        *buffer = Some(buf);
                        *load = LoadStatus::Idle;
                    }
                    Err(err) => {
                        warn!(
                            "failed to reload segment ({}, {}): {err}",
                            segment.master_id, segment.segment_id
                        );
                        segment.pool.release(buf);
                        *load = LoadStatus::Failed;
                    }
                }
            } else {
                segment.pool.release(buf);
            }
            drop(state);
            notify.notify_waiters();
        });

        Ok(())
    }

    /// The synchronization point for a load: blocks until the buffer is
    /// available, kicking off a load itself if none is in flight yet.
    /// Returns a copy of the segment's bytes.
    pub async fn get_buffer(self: &Arc<Self>) -> Result<Vec<u8>, SegmentError> {
        loop {
            enum Next {
                Ready(Vec<u8>),
                Kick,
            }

            let next = {
                let state = self.state.lock();
                match &*state {
                    State::Uninit => return Err(SegmentError::NotPersisted),
                    State::Freed => return Err(SegmentError::Freed),
                    State::Open { buffer, .. } => Next::Ready(buffer.as_slice().to_vec()),
                    State::Closed { buffer: Some(buffer), .. } => Next::Ready(buffer.as_slice().to_vec()),
                    State::Closed {
                        buffer: None,
                        load: LoadStatus::Failed,
                        ..
                    } => return Err(SegmentError::LoadFailed),
                    State::Closed {
                        buffer: None,
                        load: LoadStatus::Idle,
                        ..
                    } => Next::Kick,
                    State::Closed {
                        buffer: None,
                        load: LoadStatus::InFlight(notify),
                        ..
                    } => {
                        // Enable the waiter while the state lock is still
                        // held: `enable()` registers this task with the
                        // `Notify` before we give the loader a chance to
                        // run. Doing this after dropping the lock would
                        // leave a window where the loader's
                        // `notify_waiters()` (which, unlike `notify_one`,
                        // stores no permit) fires before we ever register,
                        // and the wakeup is lost forever.
                        let notify = Arc::clone(notify);
                        let notified = notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();
                        drop(state);
                        notified.await;
                        continue;
                    }
                }
            };

            match next {
                Next::Ready(bytes) => return Ok(bytes),
                Next::Kick => self.start_loading().await?,
            }
        }
    }

    /// Transition to `FREED` from any prior state. The caller observes
    /// `FREED` immediately; releasing the pool buffer and storage extent
    /// happens right after, before this future resolves.
    pub async fn free(&self) -> Result<(), BackupError> {
        let prev = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, State::Freed)
        };

        match prev {
            State::Uninit | State::Freed => Ok(()),
            State::Open { buffer, handle } => {
                self.pool.release(buffer);
                self.storage.free(handle).await?;
                debug!("freed segment ({}, {}) from OPEN", self.master_id, self.segment_id);
                Ok(())
            }
            State::Closed { buffer, handle, .. } => {
                if let Some(buffer) = buffer {
                    self.pool.release(buffer);
                }
                self.storage.free(handle).await?;
                debug!("freed segment ({}, {}) from CLOSED", self.master_id, self.segment_id);
                Ok(())
            }
        }
    }
}

fn mark_load_failed(segment: &Segment) {
    let mut state = segment.state.lock();
    if let State::Closed { load, .. } = &mut *state {
        *load = LoadStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn fixture(segment_size: u64) -> (Arc<SegmentPool>, Arc<dyn Storage>) {
        let pool = Arc::new(SegmentPool::new(4, segment_size as usize, 512));
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new(4, segment_size as usize));
        (pool, storage)
    }

    #[tokio::test]
    async fn open_write_close_free() {
        let (pool, storage) = fixture(16);
        let segment = Arc::new(Segment::new(7, 3, 16, pool.clone(), storage.clone()));

        segment.open().await.unwrap();
        assert_eq!(segment.state_label(), StateLabel::Open);

        segment.write(0, b"HELLO").unwrap();
        segment.close().await.unwrap();
        assert_eq!(segment.state_label(), StateLabel::Closed);

        segment.free().await.unwrap();
        assert_eq!(segment.state_label(), StateLabel::Freed);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (pool, storage) = fixture(16);
        let segment = Arc::new(Segment::new(1, 1, 16, pool, storage));
        segment.open().await.unwrap();
        segment.open().await.unwrap();
        assert_eq!(segment.state_label(), StateLabel::Open);
    }

    #[tokio::test]
    async fn write_out_of_range_fails() {
        let (pool, storage) = fixture(8);
        let segment = Arc::new(Segment::new(1, 1, 8, pool, storage));
        segment.open().await.unwrap();
        assert!(segment.write(4, b"12345").is_err());
        assert!(segment.write(0, b"12345678").is_ok());
    }

    #[tokio::test]
    async fn write_before_open_fails_not_open() {
        let (pool, storage) = fixture(8);
        let segment = Arc::new(Segment::new(1, 1, 8, pool, storage));
        assert!(matches!(segment.write(0, b"x"), Err(SegmentError::NotOpen)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pool, storage) = fixture(8);
        let segment = Arc::new(Segment::new(1, 1, 8, pool, storage));
        segment.open().await.unwrap();
        segment.close().await.unwrap();
        segment.close().await.unwrap();
        assert_eq!(segment.state_label(), StateLabel::Closed);
    }

    #[tokio::test]
    async fn reload_after_eviction_round_trips_bytes() {
        let (pool, storage) = fixture(8);
        let segment = Arc::new(Segment::new(1, 1, 8, pool, storage));
        segment.open().await.unwrap();
        segment.write(0, b"ABCDEFGH").unwrap();
        segment.close().await.unwrap();
        assert!(!segment.has_buffer());

        segment.start_loading().await.unwrap();
        let bytes = segment.get_buffer().await.unwrap();
        assert_eq!(&bytes, b"ABCDEFGH");
    }

    /// Regression test for the `get_buffer` lost-wakeup race: on a real
    /// multi-thread runtime the reload can complete (and call
    /// `notify_waiters`) on another worker in the gap between a waiter
    /// observing `InFlight` and registering with the `Notify`. A
    /// current-thread runtime can't reproduce this since the reload task
    /// never gets a turn until the waiter has already awaited. This must
    /// complete well within the timeout on every run, not just eventually.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_buffer_does_not_lose_wakeup_under_multi_thread_runtime() {
        for _ in 0..200 {
            let (pool, storage) = fixture(8);
            let segment = Arc::new(Segment::new(1, 1, 8, pool, storage));
            segment.open().await.unwrap();
            segment.write(0, b"ABCDEFGH").unwrap();
            segment.close().await.unwrap();

            segment.start_loading().await.unwrap();

            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let segment = segment.clone();
                    tokio::spawn(async move { segment.get_buffer().await })
                })
                .collect();

            for waiter in waiters {
                let bytes = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
                    .await
                    .expect("get_buffer hung: lost wakeup")
                    .unwrap()
                    .unwrap();
                assert_eq!(&bytes, b"ABCDEFGH");
            }
        }
    }
}
