//! The collector engine.
//!
//! One call to [`Collector::collect`] runs a whole cycle:
//!
//! ```text
//! Idle ─STW─▶ Enum ─▶ Mark ─STW─▶ PostMark ─▶ PreCopy ─▶ Copy ─flip─▶ Fix ─▶ Idle
//! ```
//!
//! Roots are enumerated once in the first pause and preforwarded once in the
//! second. PostMark and PreCopy share that second pause. Fix is entered
//! through a flip in which every mutator retires its copy buffer.
//!
//! # Lock Ordering
//!
//! The cycle lock (level 1) is held for the whole cycle; everything else is
//! acquired below it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::config::HeapConfig;
use crate::error::{fatal, VerifyError};
use crate::metrics::{GcMetrics, HeapStats};
use crate::model::{ObjectModel, RootProvider};
use crate::mutator::{MutatorLocal, MutatorManager};
use crate::object::{ObjectRef, RefField};
use crate::region::{CopyBuffer, RegionId, RegionManager, RegionType};
use crate::tracing::{log_cycle_end, log_phase_end, log_phase_start, next_gc_id, trace_gc_cycle, trace_phase, GcId};

use super::fix::Fixer;
use super::forward::ForwardingTable;
use super::marker::Marker;
use super::phase::GcPhase;
use super::request::{GcReason, GcRequest, GcType};
use super::sync::{LockGuard, LockOrder};
use super::verify::{verify_heap, VerifyReport};

/// Everything a cycle works on besides the collector's own state.
#[derive(Clone, Copy)]
pub struct CycleContext<'a> {
    /// The heap's regions.
    pub regions: &'a Arc<RegionManager>,
    /// The attached mutators.
    pub mutators: &'a MutatorManager,
    /// Object layout.
    pub model: &'a dyn ObjectModel,
    /// Roots outside the heap.
    pub roots: &'a dyn RootProvider,
}

impl std::fmt::Debug for CycleContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleContext")
            .field("regions", &self.regions)
            .field("mutators", &self.mutators)
            .finish_non_exhaustive()
    }
}

/// Collector state that lives across cycles.
pub struct Collector {
    cycle: Mutex<()>,
    critical: Mutex<usize>,
    critical_cond: Condvar,
    satb: SegQueue<ObjectRef>,
    forwarding: ForwardingTable,
    stats: HeapStats,
    workers: usize,
    full_gc_old_ratio: f64,
    verify: bool,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("workers", &self.workers)
            .field("critical_sections", &*self.critical.lock())
            .field("collections", &self.stats.total_collections())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a collector configured by `config`.
    #[must_use]
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            cycle: Mutex::new(()),
            critical: Mutex::new(0),
            critical_cond: Condvar::new(),
            satb: SegQueue::new(),
            forwarding: ForwardingTable::new(),
            stats: HeapStats::new(),
            workers: config.effective_workers(),
            full_gc_old_ratio: config.full_gc_old_ratio,
            verify: config.verify,
        }
    }

    /// Cumulative statistics.
    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// The forwarding table used by the running cycle.
    #[must_use]
    pub const fn forwarding(&self) -> &ForwardingTable {
        &self.forwarding
    }

    /// Receives SATB entries flushed by mutators.
    pub(crate) fn push_satb(&self, entries: impl IntoIterator<Item = ObjectRef>) {
        for obj in entries {
            self.satb.push(obj);
        }
    }

    // ============ Critical sections ============

    /// Delays the start of the next cycle until the matching exit.
    pub fn enter_critical_section(&self) {
        *self.critical.lock() += 1;
    }

    /// Ends a critical section.
    pub fn exit_critical_section(&self) {
        let mut count = self.critical.lock();
        if *count == 0 {
            tracing::warn!("unbalanced gc critical section exit");
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.critical_cond.notify_all();
        }
    }

    /// Open critical sections.
    #[must_use]
    pub fn critical_sections(&self) -> usize {
        *self.critical.lock()
    }

    fn wait_for_critical_sections(&self) {
        let mut count = self.critical.lock();
        if *count > 0 {
            tracing::debug!(open = *count, "cycle waiting for critical sections");
        }
        while *count > 0 {
            self.critical_cond.wait(&mut count);
        }
    }

    // ============ Cycle ============

    /// Heuristic young requests become full once old space is large enough.
    #[allow(clippy::cast_precision_loss)]
    fn effective_request(&self, regions: &RegionManager, request: GcRequest) -> GcRequest {
        if request.reason != GcReason::Heuristic || request.gc_type.is_full() {
            return request;
        }
        let total = regions.table().unit_count() as f64;
        if regions.old_space_units() as f64 > total * self.full_gc_old_ratio {
            tracing::debug!(old_units = regions.old_space_units(), "upgrading heuristic gc to full");
            return GcRequest::new(request.reason, GcType::Full);
        }
        request
    }

    /// Runs one complete cycle and returns its metrics.
    ///
    /// Waits for open critical sections first. Must not be called by an
    /// attached mutator outside a safe region.
    pub fn collect(&self, cx: &CycleContext<'_>, request: GcRequest) -> GcMetrics {
        let _order = LockGuard::new(LockOrder::CollectorCycle);
        let _cycle = self.cycle.lock();
        self.wait_for_critical_sections();

        let request = self.effective_request(cx.regions, request);
        let full = request.gc_type.is_full();
        let gc_id = next_gc_id();
        let _span = trace_gc_cycle(gc_id, request.reason, request.gc_type);
        let started = Instant::now();
        let mut metrics = GcMetrics {
            gc_id: Some(gc_id),
            reason: Some(request.reason),
            gc_type: Some(request.gc_type),
            ..GcMetrics::default()
        };

        self.forwarding.reset();
        while self.satb.pop().is_some() {}
        cx.regions.set_collecting(true);

        let marker = Marker::new(cx.regions, cx.model, &self.satb, full);
        self.enumerate(cx, &marker, gc_id, &mut metrics);

        let timer = PhaseTimer::start(gc_id, GcPhase::Mark, cx.regions);
        marker.drain_parallel(self.workers);
        timer.finish(&mut metrics);

        let mut buffer = CopyBuffer::new();
        let classify = self.final_mark_and_preforward(cx, &marker, &mut buffer, gc_id, &mut metrics);

        let timer = PhaseTimer::start(gc_id, GcPhase::Copy, cx.regions);
        self.evacuate(cx, &mut buffer);
        timer.finish(&mut metrics);

        let timer = PhaseTimer::start(gc_id, GcPhase::Fix, cx.regions);
        let regions = Arc::clone(cx.regions);
        cx.mutators.flip(
            GcPhase::Fix,
            Arc::new(move |local: &mut MutatorLocal| {
                ForwardingTable::retire(&regions, &mut local.copy);
            }),
        );
        let fixer = Fixer::new(cx.regions, cx.model, &self.forwarding, full);
        fixer.fix_all(self.workers);
        cx.roots.visit_roots(&mut |field| fixer.fix_root(field));
        cx.roots.visit_weak_roots(&mut |field| fixer.fix_root(field));
        let sweep = cx.regions.sweep_non_moving(cx.model, full);
        cx.regions.reassemble_from_space();
        let reclaimed = cx.regions.reclaim_garbage_regions();
        if self.verify {
            let stw = cx.mutators.stop_the_world();
            if let Err(err) = verify_heap(cx.regions, cx.model) {
                fatal(&format!("heap verification failed after fix: {err}"));
            }
            metrics.pause += stw.elapsed();
        }
        cx.regions.finish_cycle();
        cx.mutators.transition_all_to_phase(GcPhase::Idle);
        cx.regions.set_collecting(false);
        timer.finish(&mut metrics);

        let mark = marker.stats();
        let fix = fixer.stats();
        metrics.duration = started.elapsed();
        metrics.objects_marked = mark.objects_marked;
        metrics.bytes_marked = mark.bytes_marked;
        metrics.objects_copied = self.forwarding.objects_copied();
        metrics.bytes_copied = self.forwarding.bytes_copied();
        metrics.weak_cleared = mark.weak_cleared + fix.weak_cleared;
        metrics.regions_evacuated = classify.evacuated;
        metrics.regions_exempted = classify.exempted;
        metrics.regions_reclaimed = reclaimed;
        metrics.bytes_swept = sweep.dead_bytes;
        metrics.live_bytes = cx.regions.live_bytes_after_gc();
        metrics.garbage_ratio = garbage_ratio(classify.candidate_bytes, classify.live_bytes);
        self.stats.record(&mut metrics);

        log_cycle_end(gc_id, reclaimed, metrics.live_bytes, duration_us(metrics.pause));
        tracing::info!(
            gc_id = gc_id.0,
            gc_type = request.gc_type.name(),
            reason = request.reason.name(),
            duration_us = duration_us(metrics.duration),
            pause_us = duration_us(metrics.pause),
            objects_copied = metrics.objects_copied,
            regions_reclaimed = reclaimed,
            "gc cycle complete"
        );
        metrics
    }

    /// First pause: assembles from-space and marks the roots.
    fn enumerate(&self, cx: &CycleContext<'_>, marker: &Marker<'_>, gc_id: GcId, metrics: &mut GcMetrics) {
        let timer = PhaseTimer::start(gc_id, GcPhase::Enum, cx.regions);
        let stw = cx.mutators.stop_the_world();
        stw.set_phase(GcPhase::Enum);
        cx.regions.assemble_garbage_candidates(marker.is_full());
        cx.regions.set_trace_lines();
        cx.roots.visit_roots(&mut |field| marker.mark_root(field));
        marker.scan_remembered_cards();
        stw.set_phase(GcPhase::Mark);
        metrics.pause += stw.elapsed();
        drop(stw);
        timer.finish(metrics);
    }

    /// Second pause: finishes marking, clears dead weak references, sorts
    /// from-space and moves the roots' targets out of it.
    fn final_mark_and_preforward(
        &self,
        cx: &CycleContext<'_>,
        marker: &Marker<'_>,
        buffer: &mut CopyBuffer,
        gc_id: GcId,
        metrics: &mut GcMetrics,
    ) -> crate::region::ClassifyStats {
        let stw = cx.mutators.stop_the_world();

        let timer = PhaseTimer::start(gc_id, GcPhase::PostMark, cx.regions);
        stw.set_phase(GcPhase::PostMark);
        stw.for_each_local(|_, local| self.push_satb(local.satb.drain(..)));
        marker.drain();
        marker.process_weak_references();
        cx.roots.visit_weak_roots(&mut |field| marker.process_weak_root(field));
        timer.finish(metrics);

        let timer = PhaseTimer::start(gc_id, GcPhase::PreCopy, cx.regions);
        stw.set_phase(GcPhase::PreCopy);
        let classify = cx.regions.classify_from_space(marker.is_full());
        cx.regions.set_copy_lines();
        let mut preforward = |field: &RefField| self.preforward_root(cx, buffer, field);
        cx.roots.visit_roots(&mut preforward);
        cx.roots.visit_weak_roots(&mut preforward);
        stw.set_phase(GcPhase::Copy);
        metrics.pause += stw.elapsed();
        drop(stw);
        timer.finish(metrics);
        classify
    }

    fn preforward_root(&self, cx: &CycleContext<'_>, buffer: &mut CopyBuffer, field: &RefField) {
        let value = field.load();
        let Some(target) = value.target() else {
            return;
        };
        let Some(region) = cx.regions.table().region_of_object(target) else {
            return;
        };
        if region.region_type() != RegionType::From || !region.is_live(target) {
            return;
        }
        let copy = self.forwarding.forward(cx.regions, cx.model, buffer, target);
        // The world is stopped, so nothing else writes the root.
        let outcome = field.update(value, value.with_target(copy));
        debug_assert!(outcome.is_settled(), "root changed during a pause: {outcome:?}");
    }

    /// Copies every live object of the evacuated regions.
    fn evacuate(&self, cx: &CycleContext<'_>, buffer: &mut CopyBuffer) {
        let pending: SegQueue<RegionId> = SegQueue::new();
        for id in cx.regions.regions(RegionType::From) {
            pending.push(id);
        }
        let copy_region = |id: RegionId, buffer: &mut CopyBuffer| {
            let region = cx.regions.region(id);
            region.visit_live_objects_until_false(cx.model, |obj| {
                self.forwarding.forward(cx.regions, cx.model, buffer, obj);
                true
            });
        };

        if self.workers <= 1 {
            while let Some(id) = pending.pop() {
                copy_region(id, &mut *buffer);
            }
        } else {
            let result = crossbeam::scope(|scope| {
                for _ in 0..self.workers {
                    scope.spawn(|_| {
                        crate::region::throttle::mark_gc_thread();
                        let mut local = CopyBuffer::new();
                        while let Some(id) = pending.pop() {
                            copy_region(id, &mut local);
                        }
                        ForwardingTable::retire(cx.regions, &mut local);
                    });
                }
            });
            if result.is_err() {
                fatal("copy worker panicked");
            }
        }
        ForwardingTable::retire(cx.regions, buffer);
        tracing::debug!(
            objects = self.forwarding.objects_copied(),
            bytes = self.forwarding.bytes_copied(),
            "evacuation complete"
        );
    }

    // ============ Heap-wide walks ============

    /// Verifies the heap with the world stopped, between cycles.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn verify(&self, cx: &CycleContext<'_>) -> Result<VerifyReport, VerifyError> {
        let _order = LockGuard::new(LockOrder::CollectorCycle);
        let _cycle = self.cycle.lock();
        let _stw = cx.mutators.stop_the_world();
        verify_heap(cx.regions, cx.model)
    }

    /// Calls `f` for every object in the heap with the world stopped,
    /// between cycles.
    pub fn visit_objects(&self, cx: &CycleContext<'_>, mut f: impl FnMut(ObjectRef)) {
        let _order = LockGuard::new(LockOrder::CollectorCycle);
        let _cycle = self.cycle.lock();
        let _stw = cx.mutators.stop_the_world();
        for id in cx.regions.live_regions() {
            cx.regions.region(id).visit_all_objects(cx.model, &mut f);
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn garbage_ratio(candidate_bytes: usize, live_bytes: usize) -> f64 {
    if candidate_bytes == 0 {
        return 0.0;
    }
    1.0 - (live_bytes.min(candidate_bytes) as f64 / candidate_bytes as f64)
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Span, debug events and metrics bucket of one phase.
struct PhaseTimer {
    phase: GcPhase,
    started: Instant,
    _span: tracing::span::EnteredSpan,
}

impl PhaseTimer {
    fn start(gc_id: GcId, phase: GcPhase, regions: &RegionManager) -> Self {
        let span = trace_phase(gc_id, phase);
        log_phase_start(phase, regions.used_units());
        Self {
            phase,
            started: Instant::now(),
            _span: span,
        }
    }

    fn finish(self, metrics: &mut GcMetrics) {
        let elapsed = self.started.elapsed();
        log_phase_end(self.phase, duration_us(elapsed));
        metrics.record_phase(self.phase, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::RefValue;
    use crate::testing::{RootSet, SimpleObjectModel};

    struct Fixture {
        regions: Arc<RegionManager>,
        mutators: MutatorManager,
        model: SimpleObjectModel,
        roots: RootSet,
        collector: Collector,
    }

    impl Fixture {
        fn new() -> Self {
            let config = HeapConfig::default()
                .with_unit_size(4096)
                .with_heap_size(128 * 4096)
                .with_gc_workers(2)
                .with_verify(true);
            Self {
                regions: Arc::new(RegionManager::new(&config).unwrap()),
                mutators: MutatorManager::new(Duration::from_secs(5), 6),
                model: SimpleObjectModel::new(),
                roots: RootSet::new(),
                collector: Collector::new(&config),
            }
        }

        fn cx(&self) -> CycleContext<'_> {
            CycleContext {
                regions: &self.regions,
                mutators: &self.mutators,
                model: &self.model,
                roots: &self.roots,
            }
        }

        fn alloc(&self, region: RegionId, refs: usize) -> ObjectRef {
            let header = self.model.header(refs, 8);
            let size = self.model.size_of(header);
            let address = self.regions.region(region).alloc(size).unwrap();
            unsafe { crate::object::initialize_object(address, size, header) }
        }
    }

    #[test]
    fn test_young_cycle_copies_reachable_objects() {
        let fx = Fixture::new();
        let region = fx.regions.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let head = fx.alloc(region, 1);
        let tail = fx.alloc(region, 0);
        let _garbage = fx.alloc(region, 0);
        unsafe { head.field(8) }
            .compare_exchange(RefValue::NULL, RefValue::strong(tail))
            .unwrap();
        let root = fx.roots.add(Some(head));

        let metrics = fx.collector.collect(&fx.cx(), GcRequest::new(GcReason::User, GcType::Young));

        let new_head = fx.roots.get(root).unwrap();
        assert_ne!(new_head, head);
        let head_region = fx.regions.table().region_of_object(new_head).unwrap();
        assert_eq!(head_region.region_type(), RegionType::To);
        let new_tail = unsafe { new_head.field(8) }.load().target().unwrap();
        assert_ne!(new_tail, tail);
        assert_eq!(metrics.objects_copied, 2);
        assert_eq!(metrics.objects_marked, 2);
        assert_eq!(metrics.total_collections, 1);
        assert!(metrics.garbage_ratio > 0.0);
        assert_eq!(fx.mutators.phase(), GcPhase::Idle);
        assert!(!fx.regions.is_collecting());
        assert!(fx.collector.verify(&fx.cx()).is_ok());
    }

    #[test]
    fn test_second_young_cycle_promotes_survivors() {
        let fx = Fixture::new();
        let region = fx.regions.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let obj = fx.alloc(region, 0);
        let root = fx.roots.add(Some(obj));
        let request = GcRequest::new(GcReason::User, GcType::Young);

        fx.collector.collect(&fx.cx(), request);
        fx.collector.collect(&fx.cx(), request);

        let survivor = fx.roots.get(root).unwrap();
        let region = fx.regions.table().region_of_object(survivor).unwrap();
        assert_eq!(region.region_type(), RegionType::Old);
        assert_eq!(fx.collector.stats().young_collections(), 2);
    }

    #[test]
    fn test_weak_root_to_garbage_is_cleared() {
        let fx = Fixture::new();
        let region = fx.regions.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let obj = fx.alloc(region, 0);
        let weak = fx.roots.add_weak(Some(obj));

        let metrics = fx.collector.collect(&fx.cx(), GcRequest::new(GcReason::User, GcType::Full));
        assert_eq!(fx.roots.get(weak), None);
        assert_eq!(metrics.weak_cleared, 1);
        assert_eq!(metrics.objects_copied, 0);
    }

    #[test]
    fn test_heuristic_upgrade() {
        let fx = Fixture::new();
        let request = GcRequest::new(GcReason::Heuristic, GcType::Young);
        assert_eq!(fx.collector.effective_request(&fx.regions, request).gc_type, GcType::Young);
        for _ in 0..70 {
            fx.regions.take_region(1, RegionType::Old, false, false).unwrap();
        }
        assert_eq!(fx.collector.effective_request(&fx.regions, request).gc_type, GcType::Full);
        let user = GcRequest::new(GcReason::User, GcType::Young);
        assert_eq!(fx.collector.effective_request(&fx.regions, user), user);
    }

    #[test]
    fn test_critical_section_delays_cycle() {
        let fx = Fixture::new();
        fx.collector.enter_critical_section();
        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                fx.collector.collect(&fx.cx(), GcRequest::new(GcReason::User, GcType::Young));
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(30));
            assert!(!done.load(std::sync::atomic::Ordering::SeqCst));
            fx.collector.exit_critical_section();
        });
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(fx.collector.critical_sections(), 0);
    }
}
