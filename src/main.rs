//! Backup server CLI entry point. Parses configuration, builds a
//! [`BackupServer`], and blocks until a shutdown signal arrives — the
//! `anyhow`-at-the-binary, `thiserror`-in-the-library split the wider
//! workspace uses (spec §7).

use std::sync::Arc;

use anyhow::Context;
use backup_server::config::Config;
use backup_server::monitor::{LogHead, ReplicaManager, Tracker};
use backup_server::server::BackupServer;
use backup_server::wire::LogEntry;
use clap::Parser;
use log::info;

/// Treats an entire segment buffer as one opaque, tablet-independent entry.
///
/// The real log-entry wire format is an external collaborator (spec §1);
/// this is the placeholder a production deployment replaces with a decoder
/// for its actual format.
struct OpaqueEntry(Vec<u8>);

impl LogEntry for OpaqueEntry {
    fn entry_type(&self) -> u8 {
        0
    }
    fn tablet_key(&self) -> Option<(u64, u64)> {
        None
    }
    fn encode_payload(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

struct PassthroughDecoder;

impl backup_server::recovery::LogDecoder for PassthroughDecoder {
    type Entry = OpaqueEntry;
    fn decode_entries(&self, buf: &[u8]) -> Vec<OpaqueEntry> {
        vec![OpaqueEntry(buf.to_vec())]
    }
}

/// Stand-in for the cluster's master-side replica manager, until a
/// deployment wires in the real one (spec §1: external collaborator).
struct UnintegratedReplicaManager;

impl ReplicaManager for UnintegratedReplicaManager {
    fn handle_backup_failure(&self, _server_id: u64) -> Option<u64> {
        None
    }
    fn changed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(std::future::pending::<()>())
    }
    fn proceed(&self) {}
}

struct UnintegratedLogHead;

impl LogHead for UnintegratedLogHead {
    fn allocate_head_if_still_on(&self, _segment_id: u64) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();
    info!(
        "starting backup server: segment_size={} pool_capacity={} backend={:?}",
        config.segment_size, config.pool_capacity, config.storage_backend
    );

    let tracker = Tracker::new();
    let server = BackupServer::new(
        &config,
        PassthroughDecoder,
        tracker,
        Arc::new(UnintegratedReplicaManager),
        Arc::new(UnintegratedLogHead),
    )
    .context("failed to initialize backup server")?;

    info!("backup server ready; coordinator={} bind={}", config.coordinator_locator, config.bind_locator);

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining");
    server.shutdown().await;
    info!("shutdown complete");

    Ok(())
}
