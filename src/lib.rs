//! Segment lifecycle engine and recovery data pipeline for a backup server
//! in a distributed in-memory storage cluster: aligned buffer pool, segment
//! state machine, segment registry, storage adapter, recovery reader,
//! failure monitor, and the in-process dispatch surface a transport hands
//! typed requests to.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod segment;
pub mod server;
pub mod storage;
pub mod wire;

pub use crate::config::Config;
pub use crate::error::BackupError;
pub use crate::server::BackupServer;
