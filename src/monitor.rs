//! Background task that observes cluster membership changes and drives the
//! master-side replica manager's crash response and log-head rollover.
//!
//! Grounded on the concurrency shape spec §9 prescribes for this component
//! ("condition-variable + mutex... any equivalent primitive... suffices"):
//! here a [`tokio::sync::Notify`] per producer (`Tracker`, shutdown) stands
//! in for the condition variable, composed with `tokio::select!` instead of
//! a single shared condvar predicate loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One cluster-membership event, as the coordinator client (external,
/// spec §1) would deliver it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added(u64),
    Crashed(u64),
    Removed(u64),
}

/// Queue of pending membership changes plus the wakeup the monitor waits
/// on. Owned by the [`FailureMonitor`]; the cluster coordinator client
/// holds a plain `Arc<Tracker>` to push onto it (spec §9: a back-reference
/// "used only for lookup, never for ownership" — here realized as callers
/// sharing ownership of the tracker rather than the tracker reaching back
/// into the monitor).
pub struct Tracker {
    pending: Mutex<VecDeque<ChangeKind>>,
    notify: Notify,
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Enqueue a membership change and wake the monitor.
    pub fn push(&self, change: ChangeKind) {
        self.pending.lock().push_back(change);
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await
    }

    fn drain(&self) -> VecDeque<ChangeKind> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Master-side replica manager (spec §1: external collaborator). The
/// monitor never holds the manager's own data mutex while calling into
/// [`LogHead`] — `handle_backup_failure` is a quick, synchronous lookup,
/// matching the rationale in spec §4.6 that the manager can't safely drive
/// rollover itself while it holds that lock for writes.
pub trait ReplicaManager: Send + Sync {
    /// Respond to `server_id` having crashed. Returns the segment id of the
    /// crashed replica if it was the current log head's replica.
    fn handle_backup_failure(&self, server_id: u64) -> Option<u64>;

    /// Resolves when the manager transitions from idle to having queued
    /// re-replication work, so the monitor can wake and drive it even
    /// without a fresh membership change.
    fn changed(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;

    /// Let queued re-replications advance.
    fn proceed(&self);
}

/// Master-side log head (spec §1: external collaborator).
pub trait LogHead: Send + Sync {
    /// Roll the log head over if it is still backed by `segment_id`.
    fn allocate_head_if_still_on(&self, segment_id: u64);
}

/// Drives replica re-replication and log-head rollover off cluster
/// membership changes. Runs as a single dedicated background task; never
/// touches the backup's own [`crate::registry::Registry`] (spec §2).
pub struct FailureMonitor<R, L> {
    tracker: Arc<Tracker>,
    replica_manager: Arc<R>,
    log: Arc<L>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl<R, L> FailureMonitor<R, L>
where
    R: ReplicaManager + 'static,
    L: LogHead + 'static,
{
    pub fn new(tracker: Arc<Tracker>, replica_manager: Arc<R>, log: Arc<L>) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            replica_manager,
            log,
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the monitor loop as its own task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Request the loop stop after its current wait.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn run(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.tracker.notified() => {}
                _ = self.replica_manager.changed() => {}
                _ = self.shutdown.notified() => break,
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            for change in self.tracker.drain() {
                if let ChangeKind::Crashed(server_id) = change {
                    if let Some(segment_id) = self.replica_manager.handle_backup_failure(server_id) {
                        info!("server {server_id} crashed; rolling log head off segment {segment_id}");
                        self.log.allocate_head_if_still_on(segment_id);
                    }
                } else {
                    warn!("ignoring non-crash membership change {change:?}");
                }
            }

            self.replica_manager.proceed();
        }
    }
}
