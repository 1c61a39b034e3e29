//! `BackupServer`: the façade that owns every component and exposes the
//! single [`BackupServer::dispatch`] entry point a transport would call
//! into. Grounded on the teacher's `Commitlog` struct in `commitlog.rs`,
//! which plays the same role of composing the repo, segment writer, and
//! options into one handle callers construct once and share behind an
//! `Arc`.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{Config, StorageBackend};
use crate::dispatch::{status_of, BackupRequest, BackupResponse, WriteFlags};
use crate::error::BackupError;
use crate::monitor::{FailureMonitor, LogHead, ReplicaManager, Tracker};
use crate::recovery::{LogDecoder, RecoveryReader};
use crate::registry::Registry;
use crate::pool::SegmentPool;
use crate::storage::{FileStorage, MemoryStorage, Storage};

/// Owns the registry, pool, storage backend, recovery reader, and failure
/// monitor for one backup process, and routes typed requests to them.
pub struct BackupServer<D: LogDecoder> {
    registry: Arc<Registry>,
    pool: Arc<SegmentPool>,
    storage: Arc<dyn Storage>,
    recovery: RecoveryReader<D>,
    segment_size: u64,
    monitor_shutdown: Box<dyn Fn() + Send + Sync>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<D: LogDecoder> BackupServer<D> {
    /// Build every component from `config` and spawn the failure monitor.
    /// `tracker`/`replica_manager`/`log` are the cluster-side collaborators
    /// the monitor drives (spec §4.6); a caller with no cluster to watch
    /// yet may pass a fresh [`Tracker`] that never receives events.
    pub fn new<R, L>(
        config: &Config,
        decoder: D,
        tracker: Arc<Tracker>,
        replica_manager: Arc<R>,
        log: Arc<L>,
    ) -> std::io::Result<Self>
    where
        R: ReplicaManager + 'static,
        L: LogHead + 'static,
    {
        let pool = Arc::new(SegmentPool::new(config.pool_capacity, config.segment_size as usize, config.pool_alignment));
        let storage: Arc<dyn Storage> = match config.storage_backend {
            StorageBackend::File => Arc::new(FileStorage::open(&config.storage_path, config.storage_capacity, config.segment_size)?),
            StorageBackend::Memory => Arc::new(MemoryStorage::new(config.storage_capacity as usize, config.segment_size as usize)),
        };
        let registry = Arc::new(Registry::new());
        let recovery = RecoveryReader::new(registry.clone(), decoder);

        let monitor = FailureMonitor::new(tracker, replica_manager, log);
        let handle = monitor.spawn();
        let monitor_for_shutdown = monitor.clone();

        Ok(Self {
            registry,
            pool,
            storage,
            recovery,
            segment_size: config.segment_size,
            monitor_shutdown: Box::new(move || monitor_for_shutdown.shutdown()),
            monitor_handle: Mutex::new(Some(handle)),
        })
    }

    /// Route one request through the in-process dispatch surface (spec
    /// §4.7). Never panics or terminates the server; every failure comes
    /// back as a [`BackupResponse::Error`] status.
    pub async fn dispatch(&self, request: BackupRequest) -> BackupResponse {
        match self.handle(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("request failed: {err}");
                BackupResponse::Error(status_of(&err))
            }
        }
    }

    async fn handle(&self, request: BackupRequest) -> Result<BackupResponse, BackupError> {
        match request {
            BackupRequest::OpenSegment { master_id, segment_id } => {
                let segment = self.registry.insert_if_absent(master_id, segment_id, self.segment_size, &self.pool, &self.storage);
                segment.open().await?;
                Ok(BackupResponse::Ok)
            }
            BackupRequest::WriteSegment {
                master_id,
                segment_id,
                offset,
                flags,
                data,
            } => {
                let segment = if flags.contains(WriteFlags::OPEN) {
                    let segment = self.registry.insert_if_absent(master_id, segment_id, self.segment_size, &self.pool, &self.storage);
                    segment.open().await?;
                    segment
                } else {
                    self.registry.require(master_id, segment_id)?
                };

                segment.write(offset, &data)?;

                if flags.contains(WriteFlags::CLOSE) {
                    segment.close().await?;
                }
                Ok(BackupResponse::Ok)
            }
            BackupRequest::CloseSegment { master_id, segment_id } => {
                let segment = self.registry.require(master_id, segment_id)?;
                segment.close().await?;
                Ok(BackupResponse::Ok)
            }
            BackupRequest::FreeSegment { master_id, segment_id } => {
                let segment = self.registry.require(master_id, segment_id)?;
                segment.free().await?;
                self.registry.remove(master_id, segment_id);
                Ok(BackupResponse::Ok)
            }
            BackupRequest::StartReadingData { master_id, tablets } => {
                let ids = self.recovery.start_reading_data(master_id, tablets).await;
                Ok(BackupResponse::SegmentIds(ids))
            }
            BackupRequest::GetRecoveryData {
                master_id,
                segment_id,
                partition_index,
            } => {
                let payload = self.recovery.get_recovery_data(master_id, segment_id, partition_index).await?;
                Ok(BackupResponse::RecoveryData(payload))
            }
        }
    }

    /// Halt the failure monitor, free every registered segment (releasing
    /// its pool buffer and storage extent), and return once all of that
    /// has settled. There is no write queue to drain beyond what `close`
    /// already makes durable synchronously, so "drains in-flight writes"
    /// (spec §5) reduces to freeing whatever is still `OPEN`.
    pub async fn shutdown(&self) {
        (self.monitor_shutdown)();
        let handle = self.monitor_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("failure monitor task panicked during shutdown: {err}");
            }
        }

        for segment in self.registry.snapshot_all() {
            if let Err(err) = segment.free().await {
                warn!("failed to free segment ({}, {}) during shutdown: {err}", segment.master_id, segment.segment_id);
            }
        }
    }

    /// Number of segments currently registered, for diagnostics.
    pub fn segment_count(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ChangeKind;
    use crate::wire::{LogEntry, Partition, Tablet, TabletConfig};

    #[derive(Clone, Copy)]
    struct NoopEntry;

    impl LogEntry for NoopEntry {
        fn entry_type(&self) -> u8 {
            0
        }
        fn tablet_key(&self) -> Option<(u64, u64)> {
            None
        }
        fn encode_payload(&self, _out: &mut Vec<u8>) {}
    }

    struct NoopDecoder;

    impl LogDecoder for NoopDecoder {
        type Entry = NoopEntry;
        fn decode_entries(&self, _buf: &[u8]) -> Vec<NoopEntry> {
            Vec::new()
        }
    }

    struct NoopReplicaManager;

    impl ReplicaManager for NoopReplicaManager {
        fn handle_backup_failure(&self, _server_id: u64) -> Option<u64> {
            None
        }
        fn changed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            Box::pin(std::future::pending::<()>())
        }
        fn proceed(&self) {}
    }

    struct NoopLogHead;

    impl LogHead for NoopLogHead {
        fn allocate_head_if_still_on(&self, _segment_id: u64) {}
    }

    fn test_server() -> BackupServer<NoopDecoder> {
        let config = Config {
            storage_backend: StorageBackend::Memory,
            segment_size: 16,
            pool_capacity: 4,
            storage_capacity: 4,
            ..Config::default()
        };
        BackupServer::new(&config, NoopDecoder, Tracker::new(), Arc::new(NoopReplicaManager), Arc::new(NoopLogHead)).unwrap()
    }

    #[tokio::test]
    async fn open_write_close_free_roundtrip_through_dispatch() {
        let server = test_server();

        let response = server.dispatch(BackupRequest::OpenSegment { master_id: 1, segment_id: 1 }).await;
        assert!(matches!(response, BackupResponse::Ok));

        let response = server
            .dispatch(BackupRequest::WriteSegment {
                master_id: 1,
                segment_id: 1,
                offset: 0,
                flags: WriteFlags::empty(),
                data: b"0123456789ABCDEF".to_vec(),
            })
            .await;
        assert!(matches!(response, BackupResponse::Ok));

        let response = server.dispatch(BackupRequest::CloseSegment { master_id: 1, segment_id: 1 }).await;
        assert!(matches!(response, BackupResponse::Ok));

        let response = server.dispatch(BackupRequest::FreeSegment { master_id: 1, segment_id: 1 }).await;
        assert!(matches!(response, BackupResponse::Ok));
        assert_eq!(server.segment_count(), 0);
    }

    #[tokio::test]
    async fn write_with_open_and_close_flags_does_both_in_one_call() {
        let server = test_server();
        let response = server
            .dispatch(BackupRequest::WriteSegment {
                master_id: 2,
                segment_id: 5,
                offset: 0,
                flags: WriteFlags::OPEN | WriteFlags::CLOSE,
                data: b"HELLOWORLD123456".to_vec(),
            })
            .await;
        assert!(matches!(response, BackupResponse::Ok));

        let payload = server
            .dispatch(BackupRequest::WriteSegment {
                master_id: 2,
                segment_id: 5,
                offset: 0,
                flags: WriteFlags::empty(),
                data: b"x".to_vec(),
            })
            .await;
        assert!(matches!(payload, BackupResponse::Error(_)));
    }

    #[tokio::test]
    async fn write_to_unknown_segment_without_open_flag_errors() {
        let server = test_server();
        let response = server
            .dispatch(BackupRequest::WriteSegment {
                master_id: 9,
                segment_id: 9,
                offset: 0,
                flags: WriteFlags::empty(),
                data: vec![1],
            })
            .await;
        assert!(matches!(response, BackupResponse::Error(_)));
    }

    #[tokio::test]
    async fn recovery_round_trip_through_dispatch() {
        let server = test_server();
        server.dispatch(BackupRequest::OpenSegment { master_id: 3, segment_id: 1 }).await;
        server
            .dispatch(BackupRequest::WriteSegment {
                master_id: 3,
                segment_id: 1,
                offset: 0,
                flags: WriteFlags::CLOSE,
                data: b"0123456789ABCDEF".to_vec(),
            })
            .await;

        let tablets = TabletConfig(vec![Partition(vec![Tablet {
            table_id: 1,
            first_key_hash: 0,
            last_key_hash: u64::MAX,
        }])]);
        let response = server.dispatch(BackupRequest::StartReadingData { master_id: 3, tablets }).await;
        assert!(matches!(response, BackupResponse::SegmentIds(ids) if ids == vec![1]));

        let response = server
            .dispatch(BackupRequest::GetRecoveryData {
                master_id: 3,
                segment_id: 1,
                partition_index: 0,
            })
            .await;
        assert!(matches!(response, BackupResponse::RecoveryData(_)));
    }

    #[tokio::test]
    async fn shutdown_frees_every_segment_and_halts_monitor() {
        let server = test_server();
        server.dispatch(BackupRequest::OpenSegment { master_id: 1, segment_id: 1 }).await;
        server.dispatch(BackupRequest::OpenSegment { master_id: 1, segment_id: 2 }).await;
        assert_eq!(server.segment_count(), 2);

        server.shutdown().await;
        // Segments remain registered (shutdown frees, it does not evict
        // from the map) but now report FREED.
        assert_eq!(server.segment_count(), 2);
    }

    #[test]
    fn change_kind_crashed_variant_is_constructible() {
        let _ = ChangeKind::Crashed(1);
    }
}
