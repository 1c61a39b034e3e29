//! Thread-safe map `(masterId, segmentId) -> Segment`.
//!
//! Grounded on the commitlog's `Repo` trait, which plays the analogous role
//! of "the thing that knows about every segment on disk" — generalized
//! here from a single ordered sequence of segments to a concurrent map
//! keyed by the master/segment pair (spec §4.3, §9: "ordering is
//! incidental").

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BackupError;
use crate::pool::SegmentPool;
use crate::segment::Segment;
use crate::storage::Storage;

pub type SegmentKey = (u64, u64);

/// Map of every replica this backup currently knows about.
///
/// Structural changes (insert, remove) are serialized by a single mutex;
/// each [`Segment`] then serializes its *own* state transitions
/// independently, so concurrent ops on distinct keys only ever contend on
/// this map's (cheap) lock, never on each other's state machines.
#[derive(Default)]
pub struct Registry {
    segments: Mutex<BTreeMap<SegmentKey, Arc<Segment>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, master_id: u64, segment_id: u64) -> Option<Arc<Segment>> {
        self.segments.lock().get(&(master_id, segment_id)).cloned()
    }

    /// Return the existing entry for `(master_id, segment_id)`, or insert a
    /// fresh `UNINIT` one built from `pool`/`storage`/`segment_size`.
    pub fn insert_if_absent(
        &self,
        master_id: u64,
        segment_id: u64,
        segment_size: u64,
        pool: &Arc<SegmentPool>,
        storage: &Arc<dyn Storage>,
    ) -> Arc<Segment> {
        self.segments
            .lock()
            .entry((master_id, segment_id))
            .or_insert_with(|| Arc::new(Segment::new(master_id, segment_id, segment_size, pool.clone(), storage.clone())))
            .clone()
    }

    /// Remove the entry for `(master_id, segment_id)`, if present.
    pub fn remove(&self, master_id: u64, segment_id: u64) -> Option<Arc<Segment>> {
        self.segments.lock().remove(&(master_id, segment_id))
    }

    /// Snapshot of every segment currently registered to `master_id`.
    ///
    /// Taken entirely under the lock (spec §4.3's first option), so the
    /// caller iterates a stable list even if segments are concurrently
    /// freed or inserted elsewhere.
    pub fn snapshot_by_master(&self, master_id: u64) -> Vec<Arc<Segment>> {
        self.segments
            .lock()
            .range((master_id, u64::MIN)..=(master_id, u64::MAX))
            .map(|(_, segment)| segment.clone())
            .collect()
    }

    /// Snapshot of every segment currently registered, regardless of
    /// master. Used by shutdown draining (spec §5's "frees all segments").
    pub fn snapshot_all(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(masterId, segmentId) -> Segment` for an already-open or -closed
    /// segment, or `Unavailable` if the key is missing or was freed.
    pub fn require(&self, master_id: u64, segment_id: u64) -> Result<Arc<Segment>, BackupError> {
        self.find(master_id, segment_id)
            .ok_or(BackupError::Unavailable { master_id, segment_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn fixture() -> (Arc<SegmentPool>, Arc<dyn Storage>) {
        (Arc::new(SegmentPool::new(4, 16, 512)), Arc::new(MemoryStorage::new(4, 16)))
    }

    #[test]
    fn insert_is_idempotent_per_key() {
        let (pool, storage) = fixture();
        let registry = Registry::new();
        let a = registry.insert_if_absent(1, 1, 16, &pool, &storage);
        let b = registry.insert_if_absent(1, 1, 16, &pool, &storage);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_by_master_only_returns_matching_keys() {
        let (pool, storage) = fixture();
        let registry = Registry::new();
        registry.insert_if_absent(7, 1, 16, &pool, &storage);
        registry.insert_if_absent(7, 2, 16, &pool, &storage);
        registry.insert_if_absent(8, 1, 16, &pool, &storage);

        let snapshot = registry.snapshot_by_master(7);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.master_id == 7));
    }

    #[test]
    fn remove_drops_the_entry() {
        let (pool, storage) = fixture();
        let registry = Registry::new();
        registry.insert_if_absent(1, 1, 16, &pool, &storage);
        assert!(registry.remove(1, 1).is_some());
        assert!(registry.find(1, 1).is_none());
    }
}
