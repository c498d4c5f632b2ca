//! Reference fixing.
//!
//! After evacuation every surviving region is walked below its copy line and
//! each field still naming a from-space object is rewritten to the copy.
//! Fields in old-space regions are reached through their cards in a young
//! cycle; the walk re-marks every card that still holds a young reference.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::model::ObjectModel;
use crate::object::{ObjectRef, RefField, RefValue, UpdateOutcome};
use crate::region::{RegionDesc, RegionId, RegionManager, RegionType};

use super::forward::ForwardingTable;

/// Counters of one fix pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixStats {
    /// Regions walked.
    pub regions: usize,
    /// Fields rewritten to a copy.
    pub fields_fixed: usize,
    /// Weak fields cleared because their target was not copied.
    pub weak_cleared: usize,
    /// Dead objects in thread-local regions turned into fillers.
    pub objects_filled: usize,
}

/// Fix-phase driver of one cycle.
pub struct Fixer<'a> {
    manager: &'a RegionManager,
    model: &'a dyn ObjectModel,
    forwarding: &'a ForwardingTable,
    full: bool,
    regions: AtomicUsize,
    fields_fixed: AtomicUsize,
    weak_cleared: AtomicUsize,
    objects_filled: AtomicUsize,
}

impl std::fmt::Debug for Fixer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fixer")
            .field("full", &self.full)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<'a> Fixer<'a> {
    /// Creates the fixer of a young or full cycle.
    pub const fn new(
        manager: &'a RegionManager,
        model: &'a dyn ObjectModel,
        forwarding: &'a ForwardingTable,
        full: bool,
    ) -> Self {
        Self {
            manager,
            model,
            forwarding,
            full,
            regions: AtomicUsize::new(0),
            fields_fixed: AtomicUsize::new(0),
            weak_cleared: AtomicUsize::new(0),
            objects_filled: AtomicUsize::new(0),
        }
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> FixStats {
        FixStats {
            regions: self.regions.load(Ordering::Relaxed),
            fields_fixed: self.fields_fixed.load(Ordering::Relaxed),
            weak_cleared: self.weak_cleared.load(Ordering::Relaxed),
            objects_filled: self.objects_filled.load(Ordering::Relaxed),
        }
    }

    /// Fixes every surviving region on `workers` threads.
    pub fn fix_all(&self, workers: usize) {
        let pending: SegQueue<RegionId> = SegQueue::new();
        for id in self.manager.live_regions() {
            pending.push(id);
        }
        if workers <= 1 {
            while let Some(id) = pending.pop() {
                self.fix_region(id);
            }
            return;
        }
        let result = crossbeam::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    crate::region::throttle::mark_gc_thread();
                    while let Some(id) = pending.pop() {
                        self.fix_region(id);
                    }
                });
            }
        });
        if result.is_err() {
            crate::error::fatal("fix worker panicked");
        }
    }

    /// Fixes one region.
    pub fn fix_region(&self, id: RegionId) {
        let region = self.manager.region(id);
        let region_type = region.region_type();
        if matches!(region_type, RegionType::From | RegionType::Garbage | RegionType::Free) {
            return;
        }
        self.regions.fetch_add(1, Ordering::Relaxed);

        if !self.full && region_type.is_old_space() && !region.is_fresh() {
            self.fix_cards(region);
            return;
        }

        let fill_dead = matches!(region_type, RegionType::ThreadLocal | RegionType::RecentFull);
        region.visit_objects_below(region.copy_line(), self.model, |obj| {
            if region.is_live(obj) {
                self.fix_object(region, obj);
            } else if fill_dead {
                let size = self.model.object_size(obj);
                // SAFETY: unmarked objects below the trace line are
                // unreachable; the owner only bumps above the cursor.
                unsafe { crate::object::write_filler(obj.address(), size) };
                self.objects_filled.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    fn fix_cards(&self, region: &RegionDesc) {
        let cards = region.take_marked_cards();
        if cards.is_empty() {
            return;
        }
        // Card clears happen before the field loads below, so a concurrent
        // barrier either sees its card survive or has its store re-examined.
        fence(Ordering::SeqCst);
        region.visit_all_objects(self.model, |obj| {
            let size = self.model.object_size(obj);
            if region.spans_card(obj.address(), size, &cards) {
                self.fix_object(region, obj);
            }
        });
    }

    /// Fixes every field of `obj`, which lives in `holder`.
    pub fn fix_object(&self, holder: &RegionDesc, obj: ObjectRef) {
        self.model.for_each_reference(obj, &mut |field| self.fix_field(holder, field));
    }

    /// Fixes a root slot. Roots have no cards.
    pub fn fix_root(&self, field: &RefField) {
        let value = field.load();
        let Some(target) = value.target() else {
            return;
        };
        let in_from_space = self
            .manager
            .table()
            .region_of_object(target)
            .is_some_and(|region| region.region_type() == RegionType::From);
        if !in_from_space {
            return;
        }
        let new = self
            .forwarding
            .get_forwarding_pointer(target)
            .map_or(RefValue::NULL, |copy| value.with_target(copy));
        if new.is_null() && !value.is_weak() {
            return;
        }
        match field.update(value, new) {
            UpdateOutcome::Updated if new.is_null() => {
                self.weak_cleared.fetch_add(1, Ordering::Relaxed);
            }
            UpdateOutcome::Updated => {
                self.fields_fixed.fetch_add(1, Ordering::Relaxed);
            }
            UpdateOutcome::AlreadyUpdated | UpdateOutcome::Raced(_) => {}
        }
    }

    fn fix_field(&self, holder: &RegionDesc, field: &RefField) {
        let value = field.load();
        let Some(target) = value.target() else {
            return;
        };
        let table = self.manager.table();
        let Some(mut target_region) = table.region_of_object(target) else {
            return;
        };

        if target_region.region_type() == RegionType::From {
            let Some(copy) = self.forwarding.get_forwarding_pointer(target) else {
                if value.is_weak() && field.update(value, RefValue::NULL).is_settled() {
                    self.weak_cleared.fetch_add(1, Ordering::Relaxed);
                }
                return;
            };
            match field.update(value, value.with_target(copy)) {
                UpdateOutcome::Updated => {
                    self.fields_fixed.fetch_add(1, Ordering::Relaxed);
                }
                UpdateOutcome::AlreadyUpdated => {}
                // A mutator stored a resolved value; its barrier owns the card.
                UpdateOutcome::Raced(_) => return,
            }
            let Some(copy_region) = table.region_of_object(copy) else {
                return;
            };
            target_region = copy_region;
        }

        if holder.region_type().needs_remembered_set() && target_region.region_type().is_young_space() {
            holder.mark_card(field.address());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::region::CopyBuffer;
    use crate::testing::SimpleObjectModel;

    fn manager() -> RegionManager {
        RegionManager::new(&HeapConfig::default().with_unit_size(4096).with_heap_size(64 * 4096)).unwrap()
    }

    fn alloc(manager: &RegionManager, id: RegionId, model: &SimpleObjectModel, refs: usize) -> ObjectRef {
        let header = model.header(refs, 0);
        let size = model.size_of(header);
        let region = manager.region(id);
        unsafe { crate::object::initialize_object(region.alloc(size).unwrap(), size, header) }
    }

    #[test]
    fn test_fix_rewrites_forwarded_targets() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let forwarding = ForwardingTable::new();

        let from = manager.take_region(1, RegionType::From, true, false).unwrap();
        let target = alloc(&manager, from, &model, 0);
        let dead = alloc(&manager, from, &model, 0);

        let young = manager.take_region(1, RegionType::RecentPinned, true, false).unwrap();
        let holder = alloc(&manager, young, &model, 2);
        unsafe {
            holder.field(8).compare_exchange(RefValue::NULL, RefValue::strong(target)).unwrap();
            holder.field(16).compare_exchange(RefValue::NULL, RefValue::weak(dead)).unwrap();
        }
        manager.set_copy_lines();

        let mut buffer = CopyBuffer::new();
        let copy = forwarding.forward(&manager, &model, &mut buffer, target);
        ForwardingTable::retire(&manager, &mut buffer);

        let fixer = Fixer::new(&manager, &model, &forwarding, false);
        fixer.fix_all(2);

        unsafe {
            assert_eq!(holder.field(8).load(), RefValue::strong(copy));
            assert!(holder.field(16).load().is_null());
        }
        let stats = fixer.stats();
        assert_eq!(stats.fields_fixed, 1);
        assert_eq!(stats.weak_cleared, 1);
        // Young pinned holders remember young targets.
        let region = manager.region(young);
        assert!(region.is_card_marked(holder.address() + 8));
    }

    #[test]
    fn test_old_regions_fixed_through_cards() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let forwarding = ForwardingTable::new();

        let from = manager.take_region(1, RegionType::From, true, false).unwrap();
        let target = alloc(&manager, from, &model, 0);

        let old = manager.take_region(1, RegionType::Old, true, false).unwrap();
        let carded = alloc(&manager, old, &model, 1);
        let uncarded_filler = alloc(&manager, old, &model, 62);
        let stale = alloc(&manager, old, &model, 1);
        unsafe {
            carded.field(8).compare_exchange(RefValue::NULL, RefValue::strong(target)).unwrap();
            stale.field(8).compare_exchange(RefValue::NULL, RefValue::strong(target)).unwrap();
        }
        let region = manager.region(old);
        assert!(uncarded_filler.address() > carded.address());
        region.mark_card(carded.address() + 8);
        manager.set_trace_lines();
        manager.set_copy_lines();

        let mut buffer = CopyBuffer::new();
        let copy = forwarding.forward(&manager, &model, &mut buffer, target);
        ForwardingTable::retire(&manager, &mut buffer);

        Fixer::new(&manager, &model, &forwarding, false).fix_all(1);

        unsafe {
            assert_eq!(carded.field(8).load(), RefValue::strong(copy));
            // Not on a marked card, so the young cycle leaves it alone.
            assert_eq!(stale.field(8).load(), RefValue::strong(target));
        }
        assert!(region.is_card_marked(carded.address() + 8));
    }

    #[test]
    fn test_dead_thread_local_objects_become_fillers() {
        let manager = manager();
        let model = SimpleObjectModel::new();
        let forwarding = ForwardingTable::new();

        let tl = manager.take_thread_local_region(false).unwrap();
        let live = alloc(&manager, tl, &model, 0);
        let dead = alloc(&manager, tl, &model, 0);
        manager.set_trace_lines();
        let region = manager.region(tl);
        region.mark(live);
        manager.set_copy_lines();

        let fixer = Fixer::new(&manager, &model, &forwarding, false);
        fixer.fix_all(1);

        assert_eq!(fixer.stats().objects_filled, 1);
        assert!(unsafe { dead.state() }.load().is_filler());
        assert!(!unsafe { live.state() }.load().is_filler());
    }
}
