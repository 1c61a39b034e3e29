//! Runtime configuration. Grounded on the teacher's [`Options`]-style
//! struct in `lib.rs` (a plain struct with a `Default` impl and doc-comment
//! defaults), extended with a `clap::Parser` derive the way
//! `spacetimedb-standalone`/`spacetimedb-cli` expose server configuration as
//! CLI flags.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which [`crate::storage::Storage`] implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// A fixed-size flat file on disk (spec §4.4's `FileStorage`).
    File,
    /// An in-process stand-in; segments do not survive a restart. Intended
    /// for local testing, not production deployments.
    Memory,
}

/// Backup server configuration (spec §6's "Environment / configuration"
/// bullet): segment size, pool capacity, storage backend selection, and the
/// two network locators the RPC transport (external, out of scope) would
/// bind and register.
#[derive(Debug, Clone, Parser)]
#[command(name = "backup-server", about = "Backup server for a distributed in-memory storage cluster")]
pub struct Config {
    /// Size in bytes of a single log segment replica.
    ///
    /// Default: 8 MiB.
    #[arg(long, default_value_t = Config::default_segment_size())]
    pub segment_size: u64,

    /// Number of segment-sized buffers the aligned pool preallocates.
    ///
    /// Default: 64, i.e. at most 64 segments may be staged or reloaded
    /// concurrently regardless of how many are registered.
    #[arg(long, default_value_t = Config::default_pool_capacity())]
    pub pool_capacity: usize,

    /// Byte alignment for pooled buffers, matching the storage backend's
    /// block size.
    ///
    /// Default: 4096.
    #[arg(long, default_value_t = Config::default_pool_alignment())]
    pub pool_alignment: usize,

    /// Which storage backend to construct.
    ///
    /// Default: file.
    #[arg(long, value_enum, default_value_t = StorageBackend::File)]
    pub storage_backend: StorageBackend,

    /// Path to the backing file when `storage_backend` is `file`.
    ///
    /// Default: `./backup-server.data`.
    #[arg(long, default_value = "./backup-server.data")]
    pub storage_path: PathBuf,

    /// Maximum number of extents the storage backend preallocates. Must be
    /// at least `pool_capacity` so every pooled buffer can be persisted
    /// concurrently.
    ///
    /// Default: 64.
    #[arg(long, default_value_t = Config::default_storage_capacity())]
    pub storage_capacity: u64,

    /// Address of the cluster coordinator this server registers with
    /// (external collaborator; connection itself is out of scope).
    ///
    /// Default: `127.0.0.1:7000`.
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub coordinator_locator: String,

    /// Local address the RPC transport (external, out of scope) would bind
    /// to serve this backup's dispatch surface.
    ///
    /// Default: `0.0.0.0:7001`.
    #[arg(long, default_value = "0.0.0.0:7001")]
    pub bind_locator: String,
}

impl Config {
    const fn default_segment_size() -> u64 {
        8 * 1024 * 1024
    }

    const fn default_pool_capacity() -> usize {
        64
    }

    const fn default_pool_alignment() -> usize {
        4096
    }

    const fn default_storage_capacity() -> u64 {
        Self::default_pool_capacity() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size: Self::default_segment_size(),
            pool_capacity: Self::default_pool_capacity(),
            pool_alignment: Self::default_pool_alignment(),
            storage_backend: StorageBackend::File,
            storage_path: PathBuf::from("./backup-server.data"),
            storage_capacity: Self::default_storage_capacity(),
            coordinator_locator: "127.0.0.1:7000".to_string(),
            bind_locator: "0.0.0.0:7001".to_string(),
        }
    }
}
