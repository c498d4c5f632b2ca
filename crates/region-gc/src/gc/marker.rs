//! Parallel marking.
//!
//! Marking runs under a snapshot-at-the-beginning discipline: objects at or
//! above a region's trace line are implicitly live and never traced, and
//! references overwritten by mutators during marking arrive through the SATB
//! queue. Each worker owns a [`StealQueue`]; a shared [`SegQueue`] absorbs
//! overflow and seeds the workers with roots.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;

use crate::model::ObjectModel;
use crate::object::{ObjectRef, RefField, RefValue};
use crate::region::{RegionDesc, RegionManager, RegionType};

use super::worklist::StealQueue;

/// Capacity of each worker's local deque.
pub const MARK_QUEUE_SIZE: usize = 4096;

type MarkQueue = StealQueue<ObjectRef, MARK_QUEUE_SIZE>;

/// Counters of one marking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Objects newly marked.
    pub objects_marked: usize,
    /// Bytes of the newly marked objects.
    pub bytes_marked: usize,
    /// Old-space objects scanned because they sit on a marked card.
    pub card_roots: usize,
    /// Weak references cleared.
    pub weak_cleared: usize,
}

/// Marking state of one cycle.
pub struct Marker<'a> {
    manager: &'a RegionManager,
    model: &'a dyn ObjectModel,
    satb: &'a SegQueue<ObjectRef>,
    full: bool,
    work: SegQueue<ObjectRef>,
    weak_holders: SegQueue<ObjectRef>,
    objects_marked: AtomicUsize,
    bytes_marked: AtomicUsize,
    card_roots: AtomicUsize,
    weak_cleared: AtomicUsize,
}

impl std::fmt::Debug for Marker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("full", &self.full)
            .field("pending", &self.work.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<'a> Marker<'a> {
    /// Creates the marker of a young (`full == false`) or full cycle.
    ///
    /// `satb` is the queue mutators flush their pre-write barrier buffers to.
    pub fn new(
        manager: &'a RegionManager,
        model: &'a dyn ObjectModel,
        satb: &'a SegQueue<ObjectRef>,
        full: bool,
    ) -> Self {
        Self {
            manager,
            model,
            satb,
            full,
            work: SegQueue::new(),
            weak_holders: SegQueue::new(),
            objects_marked: AtomicUsize::new(0),
            bytes_marked: AtomicUsize::new(0),
            card_roots: AtomicUsize::new(0),
            weak_cleared: AtomicUsize::new(0),
        }
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> MarkStats {
        MarkStats {
            objects_marked: self.objects_marked.load(Ordering::Relaxed),
            bytes_marked: self.bytes_marked.load(Ordering::Relaxed),
            card_roots: self.card_roots.load(Ordering::Relaxed),
            weak_cleared: self.weak_cleared.load(Ordering::Relaxed),
        }
    }

    /// Whether old space is collected too.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.full
    }

    /// Whether this cycle traces and reclaims objects in `region`.
    #[must_use]
    pub fn is_collected(&self, region: &RegionDesc) -> bool {
        let region_type = region.region_type();
        if self.full {
            !region_type.is_dead()
        } else {
            region_type.is_young_space()
        }
    }

    /// Marks `obj`, returning `true` if this call marked it and the caller
    /// must trace it.
    ///
    /// Objects outside the collected space and objects allocated after the
    /// trace line are never marked.
    pub fn try_mark(&self, obj: ObjectRef) -> bool {
        let Some(region) = self.manager.table().region_of_object(obj) else {
            return false;
        };
        if !self.is_collected(region) || region.is_new_object(obj) {
            return false;
        }
        if region.mark(obj) {
            return false;
        }
        let size = self.model.object_size(obj);
        region.add_live_bytes(size);
        self.objects_marked.fetch_add(1, Ordering::Relaxed);
        self.bytes_marked.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Whether `obj` is unreachable in this cycle.
    #[must_use]
    pub fn is_dead(&self, obj: ObjectRef) -> bool {
        let Some(region) = self.manager.table().region_of_object(obj) else {
            return false;
        };
        self.is_collected(region) && !region.is_live(obj)
    }

    /// Marks the target of a root slot.
    pub fn mark_root(&self, field: &RefField) {
        if let Some(target) = field.load().target() {
            if self.try_mark(target) {
                self.work.push(target);
            }
        }
    }

    /// Traces the fields of a marked object, handing newly marked children to
    /// `push`. Holders of weak fields are queued for weak processing.
    pub fn trace_object(&self, obj: ObjectRef, push: &mut dyn FnMut(ObjectRef)) {
        let mut has_weak = false;
        self.model.for_each_reference(obj, &mut |field| {
            let value = field.load();
            let Some(target) = value.target() else {
                return;
            };
            if value.is_weak() {
                has_weak = true;
            } else if self.try_mark(target) {
                push(target);
            }
        });
        if has_weak {
            let queued = self
                .manager
                .table()
                .region_of_object(obj)
                .is_none_or(|region| region.enqueue(obj));
            if !queued {
                self.weak_holders.push(obj);
            }
        }
    }

    /// Traces old-space objects that sit on marked cards, treating them as
    /// roots. Young cycles only; cards stay marked.
    pub fn scan_remembered_cards(&self) {
        if self.full {
            return;
        }
        for region_type in [RegionType::Old, RegionType::OldLarge, RegionType::OldPinned] {
            self.manager.for_each_region(region_type, |id| {
                let region = self.manager.region(id);
                let cards = region.marked_cards();
                if cards.is_empty() {
                    return;
                }
                region.visit_all_objects(self.model, |obj| {
                    let size = self.model.object_size(obj);
                    if region.spans_card(obj.address(), size, &cards) {
                        self.card_roots.fetch_add(1, Ordering::Relaxed);
                        self.trace_object(obj, &mut |child| self.work.push(child));
                    }
                });
            });
        }
        tracing::trace!(card_roots = self.card_roots.load(Ordering::Relaxed), "remembered cards scanned");
    }

    fn take_satb(&self) -> Option<ObjectRef> {
        while let Some(obj) = self.satb.pop() {
            if self.try_mark(obj) {
                return Some(obj);
            }
        }
        None
    }

    /// Drains all marking work on the calling thread.
    pub fn drain(&self) {
        loop {
            while let Some(obj) = self.work.pop() {
                self.trace_object(obj, &mut |child| self.work.push(child));
            }
            match self.take_satb() {
                Some(obj) => self.work.push(obj),
                None => break,
            }
        }
    }

    /// Drains all marking work on `workers` threads.
    ///
    /// Returns once every queue is empty and every worker is idle. Mutators
    /// may still add SATB entries afterwards; the final-mark pause drains
    /// those.
    pub fn drain_parallel(&self, workers: usize) {
        if workers <= 1 {
            self.drain();
            return;
        }
        let queues: Vec<MarkQueue> = (0..workers).map(|_| MarkQueue::new()).collect();
        let idle = AtomicUsize::new(0);
        let result = crossbeam::scope(|scope| {
            for index in 0..workers {
                let queues = &queues;
                let idle = &idle;
                scope.spawn(move |_| {
                    crate::region::throttle::mark_gc_thread();
                    self.worker_loop(index, queues, idle);
                });
            }
        });
        if result.is_err() {
            crate::error::fatal("marking worker panicked");
        }
    }

    fn worker_loop(&self, index: usize, queues: &[MarkQueue], idle: &AtomicUsize) {
        let local = &queues[index];
        let mut push = |child: ObjectRef| {
            if !local.push(child) {
                self.work.push(child);
            }
        };
        loop {
            if let Some(obj) = self.find_work(index, queues) {
                self.trace_object(obj, &mut push);
                continue;
            }

            // Counted idle workers hold no work; when all are idle nobody
            // can produce more.
            idle.fetch_add(1, Ordering::AcqRel);
            let backoff = Backoff::new();
            loop {
                if idle.load(Ordering::Acquire) == queues.len() {
                    return;
                }
                if self.has_visible_work(queues) {
                    idle.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                backoff.snooze();
            }
        }
    }

    fn find_work(&self, index: usize, queues: &[MarkQueue]) -> Option<ObjectRef> {
        if let Some(obj) = queues[index].pop() {
            return Some(obj);
        }
        if let Some(obj) = self.work.pop() {
            return Some(obj);
        }
        if let Some(obj) = self.take_satb() {
            return Some(obj);
        }
        let n = queues.len();
        (1..n).find_map(|offset| queues[(index + offset) % n].steal())
    }

    fn has_visible_work(&self, queues: &[MarkQueue]) -> bool {
        !self.work.is_empty() || !self.satb.is_empty() || queues.iter().any(|q| !q.is_empty())
    }

    /// Clears weak fields of queued holders whose targets died.
    ///
    /// Runs once marking is complete.
    pub fn process_weak_references(&self) {
        while let Some(holder) = self.weak_holders.pop() {
            self.model.for_each_reference(holder, &mut |field| {
                self.clear_if_dead(field, true);
            });
        }
    }

    /// Clears a weak root whose target died.
    pub fn process_weak_root(&self, field: &RefField) {
        self.clear_if_dead(field, false);
    }

    fn clear_if_dead(&self, field: &RefField, weak_only: bool) {
        let value = field.load();
        let Some(target) = value.target() else {
            return;
        };
        if weak_only && !value.is_weak() {
            return;
        }
        if self.is_dead(target) && field.update(value, RefValue::NULL).is_settled() {
            self.weak_cleared.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::testing::SimpleObjectModel;

    fn manager() -> RegionManager {
        RegionManager::new(&HeapConfig::default().with_unit_size(4096).with_heap_size(64 * 4096)).unwrap()
    }

    #[test]
    fn test_trace_chain() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let satb = SegQueue::new();

        let id = manager.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let region = manager.region(id);
        let header = model.header(1, 0);
        let size = model.size_of(header);
        let objs: Vec<ObjectRef> = (0..4)
            .map(|_| unsafe { crate::object::initialize_object(region.alloc(size).unwrap(), size, header) })
            .collect();
        for pair in objs.windows(2) {
            unsafe { pair[0].field(8) }.compare_exchange(RefValue::NULL, RefValue::strong(pair[1])).unwrap();
        }
        region.set_trace_line(region.alloc_ptr());

        let marker = Marker::new(&manager, &model, &satb, false);
        let root = RefField::new(RefValue::strong(objs[0]));
        marker.mark_root(&root);
        marker.drain_parallel(2);

        assert!(objs.iter().all(|&o| region.is_marked(o)));
        assert_eq!(marker.stats().objects_marked, 4);
        assert_eq!(region.live_bytes(), 4 * size);
    }

    #[test]
    fn test_old_space_not_marked_in_young_cycle() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let satb = SegQueue::new();
        let id = manager.take_region(1, RegionType::Old, true, false).unwrap();
        let region = manager.region(id);
        let header = model.header(0, 8);
        let size = model.size_of(header);
        let obj = unsafe { crate::object::initialize_object(region.alloc(size).unwrap(), size, header) };
        region.set_trace_line(region.alloc_ptr());

        let young = Marker::new(&manager, &model, &satb, false);
        assert!(!young.try_mark(obj));
        assert!(!young.is_dead(obj));

        let full = Marker::new(&manager, &model, &satb, true);
        assert!(full.is_dead(obj));
        assert!(full.try_mark(obj));
        assert!(!full.try_mark(obj));
    }

    #[test]
    fn test_weak_field_cleared_when_target_dies() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let satb = SegQueue::new();
        let id = manager.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let region = manager.region(id);
        let header = model.header(2, 0);
        let size = model.size_of(header);
        let alloc = || unsafe { crate::object::initialize_object(region.alloc(size).unwrap(), size, header) };
        let holder = alloc();
        let kept = alloc();
        let dropped = alloc();
        unsafe {
            holder.field(8).compare_exchange(RefValue::NULL, RefValue::weak(kept)).unwrap();
            holder.field(16).compare_exchange(RefValue::NULL, RefValue::weak(dropped)).unwrap();
        }
        region.set_trace_line(region.alloc_ptr());

        let marker = Marker::new(&manager, &model, &satb, false);
        marker.mark_root(&RefField::new(RefValue::strong(holder)));
        marker.mark_root(&RefField::new(RefValue::strong(kept)));
        marker.drain();
        marker.process_weak_references();

        unsafe {
            assert_eq!(holder.field(8).load(), RefValue::weak(kept));
            assert!(holder.field(16).load().is_null());
        }
        assert_eq!(marker.stats().weak_cleared, 1);
        assert!(region.is_enqueued(holder));
    }

    #[test]
    fn test_satb_entries_are_marked() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let satb = SegQueue::new();
        let id = manager.take_region(1, RegionType::RecentFull, true, false).unwrap();
        let region = manager.region(id);
        let header = model.header(0, 0);
        let size = model.size_of(header);
        let obj = unsafe { crate::object::initialize_object(region.alloc(size).unwrap(), size, header) };
        region.set_trace_line(region.alloc_ptr());

        satb.push(obj);
        let marker = Marker::new(&manager, &model, &satb, false);
        marker.drain();
        assert!(region.is_marked(obj));
        assert!(satb.is_empty());
    }
}
