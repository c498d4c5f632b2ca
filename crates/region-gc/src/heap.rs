//! The heap service.
//!
//! [`Heap::new`] reserves the address range, builds the region manager, the
//! mutator coordinator and the collector, and optionally starts the collector
//! daemon. Dropping the heap stops the daemon and releases the range. Every
//! mutator borrows the heap, so none can outlive it.

use std::sync::Arc;

use crate::config::HeapConfig;
use crate::error::{HeapError, VerifyError};
use crate::gc::collector::{Collector, CycleContext};
use crate::gc::phase::GcPhase;
use crate::gc::request::{CollectorDaemon, CycleRunner, GcReason, GcRequest, GcType};
use crate::gc::verify::VerifyReport;
use crate::metrics::{GcMetrics, HeapStats};
use crate::model::{ObjectModel, RootProvider};
use crate::mutator::{Mutator, MutatorManager};
use crate::object::ObjectRef;
use crate::region::RegionManager;

/// State shared with the collector daemon.
pub(crate) struct HeapInner {
    pub(crate) config: HeapConfig,
    pub(crate) regions: Arc<RegionManager>,
    pub(crate) mutators: MutatorManager,
    pub(crate) collector: Collector,
    pub(crate) model: Arc<dyn ObjectModel>,
    pub(crate) roots: Arc<dyn RootProvider>,
}

impl HeapInner {
    fn context(&self) -> CycleContext<'_> {
        CycleContext {
            regions: &self.regions,
            mutators: &self.mutators,
            model: self.model.as_ref(),
            roots: self.roots.as_ref(),
        }
    }
}

impl CycleRunner for HeapInner {
    fn run_cycle(&self, request: GcRequest) -> GcMetrics {
        self.collector.collect(&self.context(), request)
    }
}

/// A garbage-collected heap.
///
/// Methods that run or wait for a cycle (`request_gc` with
/// `asynchronous = false`, `verify`, `visit_objects`) must not be called from
/// a thread whose [`Mutator`] is outside a safe region; use
/// [`Mutator::request_gc`] or [`Mutator::safe_region`] there.
pub struct Heap {
    inner: Arc<HeapInner>,
    daemon: Option<CollectorDaemon>,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("regions", &self.inner.regions)
            .field("mutators", &self.inner.mutators)
            .field("collector", &self.inner.collector)
            .field("daemon", &self.daemon)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Builds a heap.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] for an invalid configuration,
    /// [`HeapError::Reserve`] if the range cannot be reserved and
    /// [`HeapError::Spawn`] if the daemon thread cannot start.
    pub fn new(
        config: HeapConfig,
        model: Arc<dyn ObjectModel>,
        roots: Arc<dyn RootProvider>,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let regions = Arc::new(RegionManager::new(&config)?);
        let inner = Arc::new(HeapInner {
            mutators: MutatorManager::new(config.stw_soft_timeout, config.stw_hard_retries),
            collector: Collector::new(&config),
            regions,
            model,
            roots,
            config,
        });

        let daemon = if inner.config.collector_thread {
            let runner: Arc<dyn CycleRunner> = inner.clone();
            let daemon = CollectorDaemon::spawn(runner)?;
            let trigger = daemon.async_trigger();
            inner
                .regions
                .set_gc_trigger(move || trigger(GcRequest::new(GcReason::Heuristic, GcType::Young)));
            Some(daemon)
        } else {
            None
        };

        tracing::info!(
            unit_size = inner.config.unit_size,
            units = inner.config.unit_count(),
            workers = inner.config.effective_workers(),
            collector_thread = daemon.is_some(),
            "heap created"
        );
        Ok(Self { inner, daemon })
    }

    pub(crate) fn inner(&self) -> &HeapInner {
        &self.inner
    }

    /// Attaches the calling thread as a mutator.
    ///
    /// Blocks while the world is stopped.
    pub fn attach(&self) -> Mutator<'_> {
        Mutator::new(self)
    }

    /// The configuration the heap was built with.
    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.inner.config
    }

    /// The region manager.
    #[must_use]
    pub fn regions(&self) -> &RegionManager {
        &self.inner.regions
    }

    /// The mutator coordinator.
    #[must_use]
    pub fn mutators(&self) -> &MutatorManager {
        &self.inner.mutators
    }

    /// The published collector phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        self.inner.mutators.phase()
    }

    // ============ Collection ============

    /// Requests a collection.
    ///
    /// Asynchronous requests are queued on the daemon and return `None`;
    /// without a daemon they are dropped. Synchronous requests return the
    /// metrics of the cycle that served them, running it on the caller when
    /// there is no daemon.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::CollectorStopped`] if the daemon is gone.
    pub fn request_gc(
        &self,
        reason: GcReason,
        asynchronous: bool,
        gc_type: GcType,
    ) -> Result<Option<GcMetrics>, HeapError> {
        let request = GcRequest::new(reason, gc_type);
        if !asynchronous {
            return self.collect_sync(request).map(Some);
        }
        match &self.daemon {
            Some(daemon) => daemon.request_async(request)?,
            None => tracing::debug!(
                reason = reason.name(),
                gc_type = gc_type.name(),
                "no collector thread, async gc request dropped"
            ),
        }
        Ok(None)
    }

    /// [`request_gc`](Self::request_gc) with an untyped reason and type.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidRequest`] for unknown values; the request
    /// is dropped.
    pub fn request_gc_raw(&self, reason: u32, asynchronous: bool, gc_type: u32) -> Result<Option<GcMetrics>, HeapError> {
        let request = GcRequest::from_raw(reason, gc_type)?;
        self.request_gc(request.reason, asynchronous, request.gc_type)
    }

    pub(crate) fn collect_sync(&self, request: GcRequest) -> Result<GcMetrics, HeapError> {
        match &self.daemon {
            Some(daemon) => daemon.request_sync(request),
            None => Ok(self.inner.run_cycle(request)),
        }
    }

    /// Holds off the next cycle until the returned guard is dropped.
    ///
    /// A cycle already past enumeration is not affected. Requesting a
    /// synchronous collection while holding the guard deadlocks.
    pub fn enter_gc_critical_section(&self) -> GcCriticalSection<'_> {
        self.inner.collector.enter_critical_section();
        GcCriticalSection { heap: self }
    }

    /// Verifies the heap with the world stopped.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify(&self) -> Result<VerifyReport, VerifyError> {
        self.inner.collector.verify(&self.inner.context())
    }

    /// Calls `f` for every object with the world stopped, between cycles.
    pub fn visit_objects(&self, f: impl FnMut(ObjectRef)) {
        self.inner.collector.visit_objects(&self.inner.context(), f);
    }

    // ============ Statistics ============

    /// Bytes allocated since the heap was created.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.inner.regions.allocated_bytes()
    }

    /// Bytes in use right after the last cycle.
    #[must_use]
    pub fn live_bytes_after_gc(&self) -> usize {
        self.inner.regions.live_bytes_after_gc()
    }

    /// Fraction of the last cycle's from-space that was garbage.
    #[must_use]
    pub fn garbage_ratio(&self) -> f64 {
        self.last_gc_metrics().map_or(0.0, |m| m.garbage_ratio)
    }

    /// Completed collections.
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.inner.collector.stats().total_collections()
    }

    /// Metrics of the last completed cycle.
    #[must_use]
    pub fn last_gc_metrics(&self) -> Option<GcMetrics> {
        self.inner.collector.stats().last()
    }

    /// Units held by regions.
    #[must_use]
    pub fn used_units(&self) -> usize {
        self.inner.regions.used_units()
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> &HeapStats {
        self.inner.collector.stats()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Some(daemon) = &self.daemon {
            daemon.shutdown();
        }
        tracing::debug!(collections = self.total_collections(), "heap dropped");
    }
}

/// Guard returned by [`Heap::enter_gc_critical_section`].
#[must_use = "the critical section ends when the guard is dropped"]
pub struct GcCriticalSection<'heap> {
    heap: &'heap Heap,
}

impl std::fmt::Debug for GcCriticalSection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcCriticalSection").finish_non_exhaustive()
    }
}

impl GcCriticalSection<'_> {
    /// Ends the critical section.
    pub fn exit_gc_critical_section(self) {}
}

impl Drop for GcCriticalSection<'_> {
    fn drop(&mut self) {
        self.heap.inner.collector.exit_critical_section();
    }
}
