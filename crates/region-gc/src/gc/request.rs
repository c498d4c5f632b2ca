//! Collection requests and the collector daemon.
//!
//! Asynchronous requests are coalesced: while a cycle is queued, further
//! async requests only upgrade its type. Synchronous requests block their
//! caller until a cycle that started after the request has finished.

use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::HeapError;
use crate::metrics::GcMetrics;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GcReason {
    /// Explicit request from the embedder.
    User = 0,
    /// Heap usage crossed the trigger ratio.
    Heuristic = 1,
    /// An allocation failed and retries after a synchronous collection.
    OutOfMemory = 2,
    /// Periodic collection with no allocation pressure.
    Backup = 3,
}

impl GcReason {
    /// Decodes a raw reason.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::User),
            1 => Some(Self::Heuristic),
            2 => Some(Self::OutOfMemory),
            3 => Some(Self::Backup),
            _ => None,
        }
    }

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Heuristic => "heuristic",
            Self::OutOfMemory => "oom",
            Self::Backup => "backup",
        }
    }
}

/// Which part of the heap a cycle collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum GcType {
    /// Young space only; old space is a root set via its cards.
    Young = 0,
    /// Every region.
    Full = 1,
}

impl GcType {
    /// Decodes a raw type.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Young),
            1 => Some(Self::Full),
            _ => None,
        }
    }

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Young => "young",
            Self::Full => "full",
        }
    }

    /// Whether old space is collected.
    #[must_use]
    pub const fn is_full(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// A request to run one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    /// Why the cycle is wanted.
    pub reason: GcReason,
    /// What the cycle collects.
    pub gc_type: GcType,
}

impl GcRequest {
    /// Creates a request.
    #[must_use]
    pub const fn new(reason: GcReason, gc_type: GcType) -> Self {
        Self { reason, gc_type }
    }

    /// Decodes a request received over an untyped boundary.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidRequest`] if either value is unknown.
    pub fn from_raw(reason: u32, gc_type: u32) -> Result<Self, HeapError> {
        match (GcReason::from_u32(reason), GcType::from_u32(gc_type)) {
            (Some(reason), Some(gc_type)) => Ok(Self { reason, gc_type }),
            _ => {
                tracing::warn!(reason, gc_type, "ignoring invalid gc request");
                Err(HeapError::InvalidRequest { reason, gc_type })
            }
        }
    }

    /// Folds `other` into a queued request: the wider type wins, the first
    /// reason is kept.
    #[must_use]
    pub fn coalesce(self, other: Self) -> Self {
        Self {
            reason: self.reason,
            gc_type: self.gc_type.max(other.gc_type),
        }
    }
}

/// Runs collections on behalf of the daemon.
pub(crate) trait CycleRunner: Send + Sync + 'static {
    fn run_cycle(&self, request: GcRequest) -> GcMetrics;
}

enum DaemonMessage {
    Collect {
        request: GcRequest,
        reply: Option<Sender<GcMetrics>>,
    },
    Shutdown,
}

/// Handle to the collector daemon thread.
pub(crate) struct CollectorDaemon {
    sender: Sender<DaemonMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CollectorDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorDaemon")
            .field("running", &self.handle.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl CollectorDaemon {
    /// Spawns the daemon thread.
    pub(crate) fn spawn(runner: std::sync::Arc<dyn CycleRunner>) -> Result<Self, HeapError> {
        let (sender, receiver) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("region-gc-collector".into())
            .spawn(move || {
                crate::region::throttle::mark_gc_thread();
                daemon_loop(runner.as_ref(), &receiver);
            })
            .map_err(HeapError::Spawn)?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues a cycle without waiting for it.
    pub(crate) fn request_async(&self, request: GcRequest) -> Result<(), HeapError> {
        self.sender
            .send(DaemonMessage::Collect { request, reply: None })
            .map_err(|_| HeapError::CollectorStopped)
    }

    /// Queues a cycle and blocks until it finishes.
    pub(crate) fn request_sync(&self, request: GcRequest) -> Result<GcMetrics, HeapError> {
        let (reply, done) = channel::bounded(1);
        self.sender
            .send(DaemonMessage::Collect {
                request,
                reply: Some(reply),
            })
            .map_err(|_| HeapError::CollectorStopped)?;
        done.recv().map_err(|_| HeapError::CollectorStopped)
    }

    /// A sender usable from the allocation trigger.
    pub(crate) fn async_trigger(&self) -> impl Fn(GcRequest) + Send + Sync + 'static {
        let sender = self.sender.clone();
        move |request| {
            // A stopped daemon just drops the request.
            let _ = sender.send(DaemonMessage::Collect { request, reply: None });
        }
    }

    /// Stops the daemon after its current cycle and joins it.
    pub(crate) fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.send(DaemonMessage::Shutdown);
        if handle.join().is_err() {
            tracing::error!("collector daemon panicked");
        }
    }
}

fn daemon_loop(runner: &dyn CycleRunner, receiver: &Receiver<DaemonMessage>) {
    tracing::debug!("collector daemon started");
    while let Ok(message) = receiver.recv() {
        let DaemonMessage::Collect { request, reply } = message else {
            break;
        };
        let mut request = request;
        let mut replies: Vec<Sender<GcMetrics>> = reply.into_iter().collect();
        let mut shutdown = false;

        // Everything already queued is served by this cycle.
        while let Ok(next) = receiver.try_recv() {
            match next {
                DaemonMessage::Collect { request: other, reply } => {
                    request = request.coalesce(other);
                    replies.extend(reply);
                }
                DaemonMessage::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
        }

        let metrics = runner.run_cycle(request);
        for reply in replies {
            let _ = reply.send(metrics.clone());
        }
        if shutdown {
            break;
        }
    }
    tracing::debug!("collector daemon stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_from_raw() {
        let request = GcRequest::from_raw(1, 1).unwrap();
        assert_eq!(request.reason, GcReason::Heuristic);
        assert_eq!(request.gc_type, GcType::Full);

        assert!(matches!(
            GcRequest::from_raw(7, 0),
            Err(HeapError::InvalidRequest { reason: 7, gc_type: 0 })
        ));
        assert!(GcRequest::from_raw(0, 2).is_err());
    }

    #[test]
    fn test_coalesce_full_wins() {
        let young = GcRequest::new(GcReason::Heuristic, GcType::Young);
        let full = GcRequest::new(GcReason::User, GcType::Full);
        let merged = young.coalesce(full);
        assert_eq!(merged.gc_type, GcType::Full);
        assert_eq!(merged.reason, GcReason::Heuristic);
        assert_eq!(full.coalesce(young).gc_type, GcType::Full);
    }

    struct CountingRunner(AtomicUsize);

    impl CycleRunner for CountingRunner {
        fn run_cycle(&self, request: GcRequest) -> GcMetrics {
            self.0.fetch_add(1, Ordering::SeqCst);
            GcMetrics {
                gc_type: Some(request.gc_type),
                ..GcMetrics::default()
            }
        }
    }

    #[test]
    fn test_daemon_sync_and_shutdown() {
        let runner = Arc::new(CountingRunner(AtomicUsize::new(0)));
        let daemon = CollectorDaemon::spawn(runner.clone()).unwrap();

        let metrics = daemon
            .request_sync(GcRequest::new(GcReason::User, GcType::Full))
            .unwrap();
        assert_eq!(metrics.gc_type, Some(GcType::Full));
        assert!(runner.0.load(Ordering::SeqCst) >= 1);

        daemon.shutdown();
        assert!(matches!(
            daemon.request_sync(GcRequest::new(GcReason::User, GcType::Young)),
            Err(HeapError::CollectorStopped)
        ));
    }
}
