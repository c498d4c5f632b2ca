//! The region manager.
//!
//! Owns the region table, one [`RegionList`] per region type, the free-unit
//! sets and the shared pinned space. Every region a mutator or the collector
//! works with is handed out and taken back here.
//!
//! # Unit accounting
//!
//! Outside an in-progress [`take_region`](RegionManager::take_region) or
//! [`reclaim_region`](RegionManager::reclaim_region), every unit is either
//! part of exactly one listed region, part of a dirty or released free run,
//! or above the inactive-zone watermark:
//!
//! ```text
//! listed + dirty + released + inactive == total
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::model::ObjectModel;
use crate::object::{self, ObjectHeader, ObjectRef, MIN_OBJECT_SIZE};
use crate::region::desc::{object_extent, RegionDesc, RegionFlags, RegionId, RegionType, UnitRole};
use crate::region::free_units::FreeUnits;
use crate::region::list::RegionList;
use crate::region::table::RegionTable;
use crate::region::throttle::{is_gc_thread, AllocationThrottle};

type GcTrigger = Box<dyn Fn() + Send + Sync>;

/// Snapshot of where every unit currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitAccounting {
    /// Units held by listed regions.
    pub listed: usize,
    /// Units in dirty free runs.
    pub dirty: usize,
    /// Units in released free runs.
    pub released: usize,
    /// Units above the inactive-zone watermark.
    pub inactive: usize,
    /// Units in the heap.
    pub total: usize,
}

impl UnitAccounting {
    /// Whether every unit is accounted for exactly once.
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.listed + self.dirty + self.released + self.inactive == self.total
    }
}

/// Outcome of sorting the from-space after marking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    /// Regions whose live objects will be copied.
    pub evacuated: usize,
    /// Regions kept in place.
    pub exempted: usize,
    /// Regions with nothing live, moved straight to garbage.
    pub garbage: usize,
    /// Bytes allocated in all collected candidate regions.
    pub candidate_bytes: usize,
    /// Bytes marked live in all collected candidate regions.
    pub live_bytes: usize,
}

/// Outcome of sweeping non-moving regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Regions walked.
    pub regions: usize,
    /// Dead objects turned into fillers.
    pub dead_objects: usize,
    /// Bytes covered by new fillers.
    pub dead_bytes: usize,
    /// Regions with no live object left, moved to garbage.
    pub emptied: usize,
}

#[derive(Debug, Clone, Copy)]
struct FreeSlot {
    start: usize,
    size: usize,
}

/// The shared young pinned region plus the free slots swept out of pinned
/// regions.
#[derive(Debug)]
struct PinnedSpace {
    current: AtomicU32,
    refill: Mutex<()>,
    free_slots: Mutex<Vec<FreeSlot>>,
}

/// Allocates and reclaims regions.
pub struct RegionManager {
    table: RegionTable,
    lists: [RegionList; 12],
    free: Mutex<FreeUnits>,
    pinned: PinnedSpace,
    throttle: AllocationThrottle,
    large_object_threshold: usize,
    huge_page_release_units: u32,
    garbage_cache_units: usize,
    exempt_live_ratio: f64,
    trigger_units: usize,
    collecting: AtomicBool,
    trigger: OnceLock<GcTrigger>,
    trigger_armed: AtomicBool,
    allocated_bytes: AtomicUsize,
    live_after_gc: AtomicUsize,
}

impl std::fmt::Debug for RegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionManager")
            .field("table", &self.table)
            .field("accounting", &self.unit_accounting())
            .field("collecting", &self.is_collecting())
            .finish_non_exhaustive()
    }
}

impl RegionManager {
    /// Reserves the heap described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] for an invalid configuration and
    /// [`HeapError::Reserve`] if the address range cannot be reserved.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let unit_count = config.unit_count();
        let table = RegionTable::reserve(config.unit_size, unit_count)?;
        let total = u32::try_from(unit_count)
            .map_err(|_| HeapError::InvalidConfig(format!("{unit_count} units exceed the region table")))?;
        let capacity = unit_count * config.unit_size;
        Ok(Self {
            table,
            lists: RegionType::LISTED.map(RegionList::new),
            free: Mutex::new(FreeUnits::new(total)),
            pinned: PinnedSpace {
                current: AtomicU32::new(RegionId::NONE.0),
                refill: Mutex::new(()),
                free_slots: Mutex::new(Vec::new()),
            },
            throttle: AllocationThrottle::new(config.throttle, config.throttle_max_sleep, capacity),
            large_object_threshold: config.large_object_threshold,
            huge_page_release_units: u32::try_from(config.huge_page_release_units).unwrap_or(u32::MAX),
            garbage_cache_units: config.garbage_cache_units,
            exempt_live_ratio: config.exempt_live_ratio,
            trigger_units: (unit_count as f64 * config.gc_trigger_ratio) as usize,
            collecting: AtomicBool::new(false),
            trigger: OnceLock::new(),
            trigger_armed: AtomicBool::new(true),
            allocated_bytes: AtomicUsize::new(0),
            live_after_gc: AtomicUsize::new(0),
        })
    }

    // ============ Accessors ============

    /// The unit descriptor arena.
    #[must_use]
    pub const fn table(&self) -> &RegionTable {
        &self.table
    }

    /// The list holding regions of `region_type`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds for [`RegionType::Free`], which has no list.
    #[must_use]
    pub fn list(&self, region_type: RegionType) -> &RegionList {
        debug_assert!(region_type != RegionType::Free, "free units are not listed");
        &self.lists[(region_type as usize).saturating_sub(1)]
    }

    /// The descriptor of region `id`.
    #[must_use]
    pub fn region(&self, id: RegionId) -> &RegionDesc {
        self.table.region(id)
    }

    /// Bytes per unit.
    #[must_use]
    pub const fn unit_size(&self) -> usize {
        self.table.unit_size()
    }

    /// Objects above this size get their own region.
    #[must_use]
    pub const fn large_object_threshold(&self) -> usize {
        self.large_object_threshold
    }

    /// Units needed to hold `bytes`.
    #[must_use]
    pub fn units_for(&self, bytes: usize) -> u32 {
        u32::try_from(bytes.div_ceil(self.unit_size()).max(1)).unwrap_or(u32::MAX)
    }

    /// Installs the callback fired when usage crosses the trigger ratio.
    pub fn set_gc_trigger(&self, trigger: impl Fn() + Send + Sync + 'static) {
        if self.trigger.set(Box::new(trigger)).is_err() {
            tracing::warn!("gc trigger already installed");
        }
    }

    /// Allows the usage trigger to fire again.
    pub fn rearm_trigger(&self) {
        self.trigger_armed.store(true, Ordering::Release);
    }

    /// Whether a collection cycle is running.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    pub(crate) fn set_collecting(&self, collecting: bool) {
        self.collecting.store(collecting, Ordering::Release);
    }

    /// Bytes handed out to objects since the heap was created.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes in use right after the last cycle.
    #[must_use]
    pub fn live_bytes_after_gc(&self) -> usize {
        self.live_after_gc.load(Ordering::Relaxed)
    }

    /// Units held by listed regions.
    #[must_use]
    pub fn used_units(&self) -> usize {
        self.lists.iter().map(RegionList::unit_count).sum()
    }

    /// Units held by old-space regions.
    #[must_use]
    pub fn old_space_units(&self) -> usize {
        [RegionType::Old, RegionType::OldLarge, RegionType::OldPinned]
            .into_iter()
            .map(|ty| self.list(ty).unit_count())
            .sum()
    }

    /// Locks every list and the free sets, in lock order, and counts units.
    pub fn unit_accounting(&self) -> UnitAccounting {
        let locks: Vec<_> = self.lists.iter().map(RegionList::lock).collect();
        let listed = locks.iter().map(|lock| lock.units()).sum();
        let _order = LockGuard::new(LockOrder::FreeUnits);
        let free = self.free.lock();
        UnitAccounting {
            listed,
            dirty: free.dirty_units(),
            released: free.released_units(),
            inactive: free.inactive_units(),
            total: self.table.unit_count(),
        }
    }

    // ============ Taking regions ============

    /// Takes a region of `units` units and files it under `region_type`.
    ///
    /// Tries a cached garbage region of exactly `units` units first, then the
    /// best-fitting free span. Spans coalesce dirty and released runs with
    /// the inactive zone, so the zone only grows when nothing smaller fits.
    /// Returns `None` when the heap is exhausted. With `allow_trigger_gc`, crossing the usage trigger
    /// fires the installed GC trigger once per cycle.
    pub fn take_region(
        &self,
        units: u32,
        region_type: RegionType,
        want_zeroed: bool,
        allow_trigger_gc: bool,
    ) -> Option<RegionId> {
        if allow_trigger_gc {
            self.maybe_trigger_gc(units as usize);
        }
        let role = if region_type == RegionType::RecentLarge {
            UnitRole::Large
        } else {
            UnitRole::Small
        };

        let garbage = self.list(RegionType::Garbage);
        if let Some(id) = garbage.take_if(&self.table, |id| self.table.region(id).unit_count() == units) {
            tracing::trace!(region = id.0, units, "reusing garbage region");
            if want_zeroed {
                // SAFETY: garbage regions hold no live objects and the region
                // is off every list.
                unsafe { self.table.zero_units(id.index(), units as usize) };
            }
            return Some(self.install_region(id, units, role, region_type));
        }

        let taken = {
            let _order = LockGuard::new(LockOrder::FreeUnits);
            self.free.lock().take(units)?
        };
        if want_zeroed && !taken.source.is_zeroed() {
            for &(start, len) in &taken.dirty {
                // SAFETY: the run was just removed from the free sets.
                unsafe { self.table.zero_units(start as usize, len as usize) };
            }
        }
        let start = taken.start;
        let id = RegionId(start);
        for i in 1..units {
            self.table.unit((start + i) as usize).make_subordinate(id);
        }
        tracing::trace!(
            region = start,
            units,
            source = ?taken.source,
            region_type = region_type.name(),
            "region taken"
        );
        Some(self.install_region(id, units, role, region_type))
    }

    fn install_region(&self, id: RegionId, units: u32, role: UnitRole, region_type: RegionType) -> RegionId {
        // SAFETY: the units belong to no list and no other thread references
        // them.
        unsafe { self.table.region(id).initialize(units, role, region_type) };
        self.list(region_type).prepend(&self.table, id);
        id
    }

    fn maybe_trigger_gc(&self, units: usize) {
        if self.used_units() + units <= self.trigger_units {
            return;
        }
        let Some(trigger) = self.trigger.get() else {
            return;
        };
        if self.trigger_armed.swap(false, Ordering::AcqRel) {
            tracing::debug!(used_units = self.used_units(), "usage trigger fired");
            trigger();
        }
    }

    /// Takes a region for a mutator's allocation buffer.
    pub fn take_thread_local_region(&self, allow_trigger_gc: bool) -> Option<RegionId> {
        self.take_region(1, RegionType::ThreadLocal, false, allow_trigger_gc)
    }

    /// Takes a region for a copy buffer. Collector-owned, so never triggers.
    pub fn take_copy_region(&self, region_type: RegionType) -> Option<RegionId> {
        self.take_region(1, region_type, false, false)
    }

    /// Sleep owed by the calling thread before it takes another region.
    ///
    /// Zero unless a cycle is running and the caller is not a collector thread.
    #[must_use]
    pub fn request_for_region(&self) -> Duration {
        if !self.is_collecting() || is_gc_thread() {
            return Duration::ZERO;
        }
        self.throttle.delay(self.live_bytes_after_gc())
    }

    /// Moves a retired allocation or copy region to `to`.
    pub fn retire_region(&self, id: RegionId, to: RegionType) {
        tracing::trace!(
            region = id.0,
            used = self.table.region(id).allocated_size(),
            to = to.name(),
            "region retired"
        );
        self.move_region(id, to);
    }

    /// Moves `id` from its current list to the list of `to`.
    pub fn move_region(&self, id: RegionId, to: RegionType) {
        let from = self.table.region(id).region_type();
        if from == to {
            return;
        }
        if !self.list(from).delete(&self.table, id) {
            tracing::warn!(region = id.0, from = from.name(), "region missing from its list");
        }
        self.list(to).prepend(&self.table, id);
    }

    // ============ Large & pinned allocation ============

    /// Allocates a region holding one object of `size` bytes and writes
    /// `header` into it.
    pub fn allocate_large(&self, size: usize, header: ObjectHeader, allow_trigger_gc: bool) -> Option<ObjectRef> {
        let units = self.units_for(size);
        let id = self.take_region(units, RegionType::RecentLarge, false, allow_trigger_gc)?;
        let address = self.table.region(id).alloc(size)?;
        self.record_allocation(size);
        // SAFETY: the region was just created for this object.
        Some(unsafe { object::initialize_object(address, size, header) })
    }

    /// Allocates a non-moving object: a free slot first, then the shared
    /// pinned region, refilling it when full.
    pub fn allocate_pinned(&self, size: usize, header: ObjectHeader, allow_trigger_gc: bool) -> Option<ObjectRef> {
        if let Some(obj) = self.allocate_pinned_from_free_list(size, header) {
            return Some(obj);
        }
        loop {
            let current = self.pinned.current.load(Ordering::Acquire);
            if current != RegionId::NONE.0 {
                if let Some(address) = self.table.region(RegionId(current)).alloc(size) {
                    self.record_allocation(size);
                    // SAFETY: the bump reserved the range for this object.
                    return Some(unsafe { object::initialize_object(address, size, header) });
                }
            }

            let _order = LockGuard::new(LockOrder::PinnedRefill);
            let _refill = self.pinned.refill.lock();
            if self.pinned.current.load(Ordering::Acquire) != current {
                continue;
            }
            if current != RegionId::NONE.0 {
                self.seal_region(RegionId(current));
            }
            let id = self.take_region(self.units_for(size), RegionType::RecentPinned, false, allow_trigger_gc)?;
            self.pinned.current.store(id.0, Ordering::Release);
        }
    }

    /// Carves an object out of a dead slot of a pinned region.
    ///
    /// The new object's header is published before the slot's remainder
    /// filler shrinks, so concurrent region walks never see a gap. While a
    /// cycle is running the object is marked live on allocation.
    pub fn allocate_pinned_from_free_list(&self, size: usize, header: ObjectHeader) -> Option<ObjectRef> {
        let _order = LockGuard::new(LockOrder::PinnedFreeSlots);
        let mut slots = self.pinned.free_slots.lock();
        let index = slots.iter().position(|slot| slot.size >= size)?;
        let slot = slots[index];
        let remainder = slot.size - size;
        let address = slot.start + remainder;
        // SAFETY: the slot is dead space owned by the free list.
        let obj = unsafe { object::initialize_object(address, size, header) };
        if remainder == 0 {
            slots.swap_remove(index);
        } else {
            debug_assert!(remainder >= MIN_OBJECT_SIZE);
            // SAFETY: the remainder is still dead space.
            unsafe { object::write_filler(slot.start, remainder) };
            slots[index].size = remainder;
        }
        // Marked before the slot lock drops: a sweep that already pruned
        // this list may walk the region next and must see the object live.
        if self.is_collecting() {
            if let Some(region) = self.table.region_of(address) {
                if !region.mark(obj) {
                    region.add_live_bytes(size);
                }
            }
        }
        drop(slots);
        self.record_allocation(size);
        Some(obj)
    }

    /// Number of free pinned slots.
    #[must_use]
    pub fn pinned_free_slots(&self) -> usize {
        self.pinned.free_slots.lock().len()
    }

    /// Fills the rest of a shared region so no further bump can succeed.
    fn seal_region(&self, id: RegionId) {
        let region = self.table.region(id);
        loop {
            let free = region.free_bytes();
            if free == 0 {
                return;
            }
            if let Some(address) = region.alloc(free) {
                // SAFETY: the bump reserved the tail for us.
                unsafe { object::write_filler(address, free) };
                return;
            }
        }
    }

    // ============ Raw pointers ============

    /// Pins the region holding `obj` against evacuation.
    pub fn acquire_raw_pointer(&self, obj: ObjectRef) {
        if let Some(region) = self.table.region_of_object(obj) {
            region.inc_raw_pointer_count();
        }
    }

    /// Releases a pin taken by [`acquire_raw_pointer`](Self::acquire_raw_pointer).
    pub fn release_raw_pointer(&self, obj: ObjectRef) {
        if let Some(region) = self.table.region_of_object(obj) {
            region.dec_raw_pointer_count();
        }
    }

    // ============ Reclamation ============

    /// Unlists `id` and returns its units to the free sets.
    ///
    /// Regions spanning at least `huge_page_release_units` units have their
    /// pages decommitted first.
    pub fn reclaim_region(&self, id: RegionId) {
        let region = self.table.region(id);
        let region_type = region.region_type();
        if region_type != RegionType::Free && !self.list(region_type).delete(&self.table, id) {
            tracing::warn!(region = id.0, region_type = region_type.name(), "reclaiming an unlisted region");
        }
        self.release_units(id);
    }

    fn release_units(&self, id: RegionId) {
        let region = self.table.region(id);
        let units = region.unit_count();
        let start = id.index();
        // SAFETY: the region is off every list and holds no live objects.
        let released =
            units >= self.huge_page_release_units && unsafe { self.table.decommit_units(start, units as usize) };
        let role = if released { UnitRole::Released } else { UnitRole::Free };

        let _order = LockGuard::new(LockOrder::FreeUnits);
        let mut free = self.free.lock();
        for i in 0..units as usize {
            // SAFETY: as above; no thread can reach these descriptors until
            // the run is back in the free sets.
            unsafe { self.table.unit(start + i).reset(role) };
        }
        if released {
            free.add_released(id.0, units);
        } else {
            free.add_dirty(id.0, units);
        }
        tracing::trace!(region = id.0, units, released, "region reclaimed");
    }

    /// Trims the garbage list to `garbage_cache_units`, returning the rest of
    /// its regions to the free sets. Returns the number of regions released.
    pub fn reclaim_garbage_regions(&self) -> usize {
        let garbage = self.list(RegionType::Garbage);
        let mut reclaimed = 0;
        while garbage.unit_count() > self.garbage_cache_units {
            let Some(id) = garbage.pop_front(&self.table) else {
                break;
            };
            self.release_units(id);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            tracing::debug!(reclaimed, cached_units = garbage.unit_count(), "garbage regions released");
        }
        reclaimed
    }

    // ============ Cycle transitions ============

    /// Builds this cycle's from-space.
    ///
    /// To-space survivors and retired allocation regions always join it;
    /// unpinned raw-pointer regions rejoin it; a full collection adds old
    /// regions. Regions whose objects already survived a cycle are flagged
    /// so their copies are promoted.
    pub fn assemble_garbage_candidates(&self, full: bool) {
        let from = self.list(RegionType::From);
        self.for_each_region(RegionType::To, |id| {
            self.table.region(id).set_flag(RegionFlags::SURVIVOR);
        });
        from.merge(&self.table, self.list(RegionType::To));
        from.merge(&self.table, self.list(RegionType::RecentFull));

        let raw = self.list(RegionType::RawPointer);
        while let Some(id) = raw.take_if(&self.table, |id| self.table.region(id).raw_pointer_count() == 0) {
            self.table.region(id).set_flag(RegionFlags::SURVIVOR);
            from.prepend(&self.table, id);
        }

        if full {
            self.for_each_region(RegionType::Old, |id| {
                self.table.region(id).set_flag(RegionFlags::SURVIVOR);
            });
            from.merge(&self.table, self.list(RegionType::Old));
        }
        tracing::debug!(
            regions = from.region_count(),
            units = from.unit_count(),
            full,
            "garbage candidates assembled"
        );
    }

    /// Records the allocation cursor of every region as its trace line.
    pub fn set_trace_lines(&self) {
        for ty in RegionType::LISTED {
            self.for_each_region(ty, |id| {
                let region = self.table.region(id);
                region.set_trace_line(region.alloc_ptr());
            });
        }
    }

    /// Records the allocation cursor of every region as its copy line.
    pub fn set_copy_lines(&self) {
        for ty in RegionType::LISTED {
            self.for_each_region(ty, |id| {
                let region = self.table.region(id);
                region.set_copy_line(region.alloc_ptr());
            });
        }
    }

    /// Sorts the from-space after marking.
    ///
    /// Empty regions go to garbage; regions pinned by raw pointers or at
    /// least `exempt_live_ratio` live are exempted from copying. Unmarked
    /// young large objects, and in a full collection unmarked old ones,
    /// become garbage.
    #[allow(clippy::cast_precision_loss)]
    pub fn classify_from_space(&self, full: bool) -> ClassifyStats {
        let mut stats = ClassifyStats::default();
        for id in self.list(RegionType::From).snapshot(&self.table) {
            let region = self.table.region(id);
            let live = region.live_bytes();
            stats.candidate_bytes += region.allocated_size();
            stats.live_bytes += live;
            if region.raw_pointer_count() > 0 {
                self.move_region(id, RegionType::ExemptedFrom);
                stats.exempted += 1;
            } else if live == 0 {
                self.move_region(id, RegionType::Garbage);
                stats.garbage += 1;
            } else if live as f64 >= region.capacity() as f64 * self.exempt_live_ratio {
                self.move_region(id, RegionType::ExemptedFrom);
                stats.exempted += 1;
            } else {
                stats.evacuated += 1;
            }
        }

        let mut large_types = vec![RegionType::RecentLarge];
        if full {
            large_types.push(RegionType::OldLarge);
        }
        for ty in large_types {
            for id in self.list(ty).snapshot(&self.table) {
                let region = self.table.region(id);
                if region.is_fresh() {
                    continue;
                }
                stats.candidate_bytes += region.allocated_size();
                let Some(obj) = ObjectRef::from_address(region.start()) else {
                    continue;
                };
                if region.is_marked(obj) || region.raw_pointer_count() > 0 {
                    stats.live_bytes += region.allocated_size();
                } else {
                    self.move_region(id, RegionType::Garbage);
                    stats.garbage += 1;
                }
            }
        }
        tracing::debug!(?stats, "from-space classified");
        stats
    }

    /// Turns dead objects of the non-moving collected regions into fillers.
    ///
    /// Walks exempted, raw-pointer and non-fresh young pinned regions, plus
    /// old pinned regions in a full collection. Dead runs in pinned regions
    /// refill the pinned free list; regions left without live objects go to
    /// garbage.
    pub fn sweep_non_moving(&self, model: &dyn ObjectModel, full: bool) -> SweepStats {
        let mut swept_types = vec![
            RegionType::ExemptedFrom,
            RegionType::RawPointer,
            RegionType::RecentPinned,
        ];
        if full {
            swept_types.push(RegionType::OldPinned);
        }
        {
            let _order = LockGuard::new(LockOrder::PinnedFreeSlots);
            self.pinned.free_slots.lock().retain(|slot| {
                self.table
                    .region_of(slot.start)
                    .is_some_and(|r| !swept_types.contains(&r.region_type()))
            });
        }

        let mut stats = SweepStats::default();
        for ty in swept_types {
            for id in self.list(ty).snapshot(&self.table) {
                let region = self.table.region(id);
                if region.is_fresh() {
                    continue;
                }
                stats.regions += 1;
                let is_current = self.pinned.current.load(Ordering::Acquire) == id.0;
                let pinned = matches!(ty, RegionType::RecentPinned | RegionType::OldPinned);
                let any_live = self.sweep_region(region, model, pinned, is_current, &mut stats);
                if !any_live && !is_current && region.raw_pointer_count() == 0 {
                    self.move_region(id, RegionType::Garbage);
                    stats.emptied += 1;
                }
            }
        }
        if stats.emptied > 0 {
            let _order = LockGuard::new(LockOrder::PinnedFreeSlots);
            self.pinned.free_slots.lock().retain(|slot| {
                self.table
                    .region_of(slot.start)
                    .is_some_and(|r| r.region_type() != RegionType::Garbage)
            });
        }
        tracing::debug!(?stats, "non-moving regions swept");
        stats
    }

    fn sweep_region(
        &self,
        region: &RegionDesc,
        model: &dyn ObjectModel,
        pinned: bool,
        is_current: bool,
        stats: &mut SweepStats,
    ) -> bool {
        let limit = if is_current {
            region.copy_line()
        } else {
            region.alloc_ptr()
        };
        let mut any_live = false;
        let mut run_start: Option<usize> = None;
        let mut slots = Vec::new();
        let mut flush = |run_start: &mut Option<usize>, end: usize, stats: &mut SweepStats| {
            if let Some(start) = run_start.take() {
                // SAFETY: the run holds only dead objects and fillers.
                unsafe { object::write_filler(start, end - start) };
                stats.dead_bytes += end - start;
                if pinned {
                    slots.push(FreeSlot {
                        start,
                        size: end - start,
                    });
                }
            }
        };

        let mut cursor = region.start();
        while cursor < limit {
            let Some(obj) = ObjectRef::from_address(cursor) else {
                break;
            };
            let (size, filler) = object_extent(model, obj);
            if size == 0 || cursor + size > region.end() {
                crate::error::fatal(&format!("object {cursor:#x} has invalid size {size} during sweep"));
            }
            if filler || !region.is_live(obj) {
                run_start.get_or_insert(cursor);
                stats.dead_objects += usize::from(!filler);
            } else {
                any_live = true;
                flush(&mut run_start, cursor, stats);
            }
            cursor += size;
        }
        flush(&mut run_start, cursor, stats);

        if !slots.is_empty() {
            let _order = LockGuard::new(LockOrder::PinnedFreeSlots);
            self.pinned.free_slots.lock().extend(slots);
        }
        any_live || is_current
    }

    /// Retires the cycle's region sets after Fix.
    ///
    /// The evacuated from-space becomes garbage; exempted regions join old
    /// space (or the raw-pointer list while pinned); surviving young large
    /// and pinned regions are promoted in place.
    pub fn reassemble_from_space(&self) {
        let garbage = self.list(RegionType::Garbage);
        garbage.merge(&self.table, self.list(RegionType::From));

        for id in self.list(RegionType::ExemptedFrom).drain(&self.table) {
            let region = self.table.region(id);
            let to = if region.raw_pointer_count() > 0 {
                RegionType::RawPointer
            } else {
                RegionType::Old
            };
            self.list(to).prepend(&self.table, id);
        }

        let current_pinned = self.pinned.current.load(Ordering::Acquire);
        let promote = |from: RegionType, to: RegionType| {
            while let Some(id) = self.list(from).take_if(&self.table, |id| {
                !self.table.region(id).is_fresh() && id.0 != current_pinned
            }) {
                self.list(to).prepend(&self.table, id);
            }
        };
        promote(RegionType::RecentLarge, RegionType::OldLarge);
        promote(RegionType::RecentPinned, RegionType::OldPinned);
    }

    /// Clears marks, live bytes and watermarks after a cycle and records the
    /// bytes still in use.
    pub fn finish_cycle(&self) {
        let mut in_use = 0;
        for ty in RegionType::LISTED {
            self.for_each_region(ty, |id| {
                let region = self.table.region(id);
                region.clear_cycle_state();
                region.clear_flag(RegionFlags::SURVIVOR);
                region.set_trace_line(region.start());
                region.set_copy_line(region.start());
                if ty != RegionType::Garbage {
                    in_use += region.allocated_size();
                }
            });
        }
        self.live_after_gc.store(in_use, Ordering::Relaxed);
        self.rearm_trigger();
    }

    // ============ Iteration ============

    /// Calls `f` with every region of `region_type` while its list is locked.
    pub fn for_each_region(&self, region_type: RegionType, f: impl FnMut(RegionId)) {
        self.list(region_type).lock().for_each(&self.table, f);
    }

    /// Ids of every region of `region_type`.
    #[must_use]
    pub fn regions(&self, region_type: RegionType) -> Vec<RegionId> {
        self.list(region_type).snapshot(&self.table)
    }

    /// Ids of every listed region that may hold objects.
    #[must_use]
    pub fn live_regions(&self) -> Vec<RegionId> {
        RegionType::LISTED
            .into_iter()
            .filter(|ty| *ty != RegionType::Garbage)
            .flat_map(|ty| self.regions(ty))
            .collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimpleObjectModel;

    fn manager(units: usize) -> RegionManager {
        let config = HeapConfig::default()
            .with_unit_size(256)
            .with_heap_size(256 * units)
            .with_collector_thread(false)
            .with_huge_page_release_units(64);
        RegionManager::new(&config).unwrap()
    }

    #[test]
    fn test_take_region_fresh_heap() {
        let mgr = manager(1000);
        let id = mgr.take_region(4, RegionType::ThreadLocal, false, false).unwrap();
        let region = mgr.region(id);
        assert_eq!(region.unit_count(), 4);
        assert_eq!(region.alloc_ptr(), region.start());
        region.alloc_exclusive(100).unwrap();
        assert_eq!(region.allocated_size(), 100);

        let acc = mgr.unit_accounting();
        assert_eq!(acc.listed, 4);
        assert_eq!(acc.inactive, 996);
        assert!(acc.is_balanced());
    }

    #[test]
    fn test_subordinates_point_at_head() {
        let mgr = manager(16);
        let id = mgr.take_region(3, RegionType::Old, false, false).unwrap();
        let inside = mgr.region(id).start() + 2 * 256 + 8;
        assert_eq!(mgr.table().region_of(inside).map(RegionDesc::id), Some(id));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mgr = manager(4);
        assert!(mgr.take_region(3, RegionType::Old, false, false).is_some());
        assert!(mgr.take_region(2, RegionType::Old, false, false).is_none());
        assert!(mgr.take_region(1, RegionType::Old, false, false).is_some());
        assert!(mgr.take_region(1, RegionType::Old, false, false).is_none());
    }

    #[test]
    fn test_garbage_exact_fit_reused_first() {
        let mgr = manager(32);
        let a = mgr.take_region(2, RegionType::RecentFull, false, false).unwrap();
        let b = mgr.take_region(3, RegionType::RecentFull, false, false).unwrap();
        mgr.move_region(a, RegionType::Garbage);
        mgr.move_region(b, RegionType::Garbage);

        let c = mgr.take_region(3, RegionType::ThreadLocal, true, false).unwrap();
        assert_eq!(c, b);
        assert_eq!(mgr.region(c).region_type(), RegionType::ThreadLocal);
        assert_eq!(mgr.list(RegionType::Garbage).unit_count(), 2);
        assert!(mgr.unit_accounting().is_balanced());
    }

    #[test]
    fn test_reclaimed_runs_coalesce_across_sources() {
        let mgr = manager(66);
        let small = mgr.take_region(2, RegionType::Old, false, false).unwrap();
        let huge = mgr.take_region(64, RegionType::Old, false, false).unwrap();
        mgr.reclaim_region(small);
        mgr.reclaim_region(huge);

        let acc = mgr.unit_accounting();
        assert_eq!(acc.dirty, 2);
        assert_eq!(acc.released + acc.inactive, 64);
        assert!(acc.is_balanced());
        assert_eq!(mgr.table().unit(huge.index()).role(), UnitRole::Released);

        let large = mgr.take_region(66, RegionType::RecentLarge, true, false).unwrap();
        assert_eq!(large, small);
        assert_eq!(mgr.region(large).unit_count(), 66);
        let acc = mgr.unit_accounting();
        assert_eq!(acc.listed, 66);
        assert!(acc.is_balanced());
    }

    #[test]
    fn test_dirty_run_extends_into_inactive_zone() {
        let mgr = manager(16);
        mgr.take_region(2, RegionType::Old, false, false).unwrap();
        let tail = mgr.take_region(2, RegionType::Old, false, false).unwrap();
        mgr.reclaim_region(tail);

        let grown = mgr.take_region(10, RegionType::Old, true, false).unwrap();
        assert_eq!(grown, tail);
        assert_eq!(mgr.unit_accounting().inactive, 4);
        assert!(mgr.take_region(5, RegionType::Old, false, false).is_none());
    }

    #[test]
    fn test_reclaim_garbage_respects_cache() {
        let mgr = manager(64);
        let taken: Vec<_> = (0..20)
            .map(|_| mgr.take_region(1, RegionType::RecentFull, false, false).unwrap())
            .collect();
        for id in taken {
            mgr.move_region(id, RegionType::Garbage);
        }
        assert_eq!(mgr.reclaim_garbage_regions(), 4);
        assert_eq!(mgr.list(RegionType::Garbage).unit_count(), 16);
        assert!(mgr.unit_accounting().is_balanced());
    }

    #[test]
    fn test_assemble_and_reassemble() {
        let mgr = manager(64);
        let to = mgr.take_region(1, RegionType::To, false, false).unwrap();
        let recent = mgr.take_region(1, RegionType::RecentFull, false, false).unwrap();
        let old = mgr.take_region(1, RegionType::Old, false, false).unwrap();

        mgr.assemble_garbage_candidates(false);
        assert_eq!(mgr.region(to).region_type(), RegionType::From);
        assert_eq!(mgr.region(recent).region_type(), RegionType::From);
        assert!(mgr.region(to).has_flag(RegionFlags::SURVIVOR));
        assert!(!mgr.region(recent).has_flag(RegionFlags::SURVIVOR));
        assert_eq!(mgr.region(old).region_type(), RegionType::Old);

        mgr.reassemble_from_space();
        assert_eq!(mgr.region(to).region_type(), RegionType::Garbage);
        assert_eq!(mgr.list(RegionType::From).region_count(), 0);
    }

    #[test]
    fn test_full_assembly_includes_old() {
        let mgr = manager(16);
        let old = mgr.take_region(1, RegionType::Old, false, false).unwrap();
        mgr.assemble_garbage_candidates(true);
        assert_eq!(mgr.region(old).region_type(), RegionType::From);
        assert!(mgr.region(old).has_flag(RegionFlags::SURVIVOR));
    }

    #[test]
    fn test_classify_from_space() {
        let mgr = manager(16);
        let empty = mgr.take_region(1, RegionType::RecentFull, false, false).unwrap();
        let dense = mgr.take_region(1, RegionType::RecentFull, false, false).unwrap();
        let sparse = mgr.take_region(1, RegionType::RecentFull, false, false).unwrap();
        let pinned = mgr.take_region(1, RegionType::RecentFull, false, false).unwrap();
        mgr.region(dense).add_live_bytes(240);
        mgr.region(sparse).add_live_bytes(16);
        mgr.region(pinned).inc_raw_pointer_count();

        mgr.assemble_garbage_candidates(false);
        let stats = mgr.classify_from_space(false);
        assert_eq!(stats.garbage, 1);
        assert_eq!(stats.exempted, 2);
        assert_eq!(stats.evacuated, 1);
        assert_eq!(mgr.region(empty).region_type(), RegionType::Garbage);
        assert_eq!(mgr.region(dense).region_type(), RegionType::ExemptedFrom);
        assert_eq!(mgr.region(sparse).region_type(), RegionType::From);

        mgr.reassemble_from_space();
        assert_eq!(mgr.region(dense).region_type(), RegionType::Old);
        assert_eq!(mgr.region(pinned).region_type(), RegionType::RawPointer);
        mgr.region(pinned).dec_raw_pointer_count();
    }

    #[test]
    fn test_trigger_fires_once_per_cycle() {
        let config = HeapConfig::default()
            .with_unit_size(256)
            .with_heap_size(256 * 10)
            .with_gc_trigger_ratio(0.5);
        let mgr = RegionManager::new(&config).unwrap();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mgr.set_gc_trigger(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..8 {
            mgr.take_region(1, RegionType::ThreadLocal, false, true);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        mgr.rearm_trigger();
        mgr.take_region(1, RegionType::ThreadLocal, false, true);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_throttle_only_while_collecting() {
        let mgr = manager(16);
        mgr.live_after_gc.store(256 * 15, Ordering::Relaxed);
        assert_eq!(mgr.request_for_region(), Duration::ZERO);
        mgr.set_collecting(true);
        assert!(mgr.request_for_region() > Duration::ZERO);
    }

    #[test]
    fn test_pinned_free_list_reuse() {
        let mgr = manager(16);
        let model = SimpleObjectModel::new();
        let header = model.header(0, 24);
        let a = mgr.allocate_pinned(32, header, false).unwrap();
        let b = mgr.allocate_pinned(32, header, false).unwrap();
        let c = mgr.allocate_pinned(32, header, false).unwrap();
        let region = mgr.table().region_of_object(a).unwrap().id();

        // Seal the region so it no longer counts as the bump target.
        mgr.pinned.current.store(RegionId::NONE.0, Ordering::Release);
        mgr.seal_region(region);
        mgr.region(region).set_trace_line(mgr.region(region).alloc_ptr());
        mgr.region(region).mark(a);
        mgr.region(region).mark(c);

        let stats = mgr.sweep_non_moving(&model, false);
        assert_eq!(stats.dead_objects, 1);
        assert_eq!(mgr.pinned_free_slots(), 2);
        assert_eq!(mgr.region(region).region_type(), RegionType::RecentPinned);

        let reused = mgr.allocate_pinned_from_free_list(32, header).unwrap();
        assert_eq!(reused, b);
    }

    #[test]
    fn test_pinned_free_list_allocation_survives_racing_sweep() {
        let config = HeapConfig::default()
            .with_unit_size(4096)
            .with_heap_size(4096 * 16)
            .with_collector_thread(false);
        let mgr = RegionManager::new(&config).unwrap();
        let model = SimpleObjectModel::new();
        let header = model.header(0, 24);
        let anchor = mgr.allocate_pinned(32, header, false).unwrap();
        for _ in 1..4096 / 32 {
            mgr.allocate_pinned(32, header, false).unwrap();
        }
        let region = mgr.table().region_of_object(anchor).unwrap();
        assert_eq!(region.free_bytes(), 0);
        mgr.pinned.current.store(RegionId::NONE.0, Ordering::Release);
        mgr.set_collecting(true);

        for _ in 0..200 {
            region.clear_cycle_state();
            region.mark(anchor);
            region.set_trace_line(region.alloc_ptr());
            mgr.sweep_non_moving(&model, false);
            assert_eq!(mgr.pinned_free_slots(), 1);

            let allocated = std::thread::scope(|s| {
                let allocator = s.spawn(|| {
                    let mut objects = Vec::new();
                    while let Some(obj) = mgr.allocate_pinned_from_free_list(32, header) {
                        objects.push(obj);
                    }
                    objects
                });
                mgr.sweep_non_moving(&model, false);
                allocator.join().unwrap()
            });

            let slots = mgr.pinned.free_slots.lock().clone();
            for obj in allocated {
                assert!(region.is_marked(obj), "{obj:?} allocated during the cycle is unmarked");
                assert!(!object_extent(&model, obj).1, "{obj:?} was swept into a filler");
                let overlaps = slots
                    .iter()
                    .any(|slot| obj.address() < slot.start + slot.size && slot.start < obj.address() + 32);
                assert!(!overlaps, "{obj:?} is also on the free list");
            }
            assert_eq!(region.region_type(), RegionType::RecentPinned);
        }
    }
}
