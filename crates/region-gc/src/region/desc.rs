//! Region descriptors.
//!
//! One [`RegionDesc`] exists per heap unit. The descriptor of a region's
//! first unit carries the region's metadata; the remaining units of a
//! multi-unit region are [`UnitRole::Subordinate`] and record the index of
//! that head unit.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use crossbeam::utils::Backoff;

use crate::error::fatal;
use crate::model::ObjectModel;
use crate::object::{ForwardState, ObjectRef, OBJECT_ALIGNMENT};
use crate::region::bitmap::{LazyBitmap, CARD_SIZE};

/// Index of a region's head unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    /// Sentinel for "no region" in list links.
    pub const NONE: Self = Self(u32::MAX);

    /// The unit index as `usize`.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a unit is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitRole {
    /// Part of a dirty free run.
    Free = 0,
    /// Part of a free run whose pages went back to the OS.
    Released = 1,
    /// Non-head unit of a multi-unit region.
    Subordinate = 2,
    /// Head of a region holding many small objects.
    Small = 3,
    /// Head of a region holding exactly one large object.
    Large = 4,
}

impl UnitRole {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Released,
            2 => Self::Subordinate,
            3 => Self::Small,
            4 => Self::Large,
            _ => Self::Free,
        }
    }
}

/// Region classes. Each non-free class has its own [`RegionList`](super::RegionList).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionType {
    /// Not a region.
    Free = 0,
    /// Owned by one mutator's allocation buffer.
    ThreadLocal,
    /// A retired thread-local region waiting for the next cycle.
    RecentFull,
    /// Evacuation candidate of the running cycle.
    From,
    /// Candidate kept in place because it is dense or raw-pointer pinned.
    ExemptedFrom,
    /// Survivor copies of young objects.
    To,
    /// Promoted objects.
    Old,
    /// Young large object.
    RecentLarge,
    /// Large object that survived a cycle.
    OldLarge,
    /// Young pinned objects.
    RecentPinned,
    /// Pinned objects that survived a cycle.
    OldPinned,
    /// Region holding objects with outstanding raw pointers.
    RawPointer,
    /// Dead region waiting to be reused or released.
    Garbage,
}

impl RegionType {
    /// Every list-backed type, in list-lock order.
    pub const LISTED: [Self; 12] = [
        Self::ThreadLocal,
        Self::RecentFull,
        Self::From,
        Self::ExemptedFrom,
        Self::To,
        Self::Old,
        Self::RecentLarge,
        Self::OldLarge,
        Self::RecentPinned,
        Self::OldPinned,
        Self::RawPointer,
        Self::Garbage,
    ];

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ThreadLocal,
            2 => Self::RecentFull,
            3 => Self::From,
            4 => Self::ExemptedFrom,
            5 => Self::To,
            6 => Self::Old,
            7 => Self::RecentLarge,
            8 => Self::OldLarge,
            9 => Self::RecentPinned,
            10 => Self::OldPinned,
            11 => Self::RawPointer,
            12 => Self::Garbage,
            _ => Self::Free,
        }
    }

    /// Whether objects here survive young collections untraced.
    #[must_use]
    pub const fn is_old_space(self) -> bool {
        matches!(self, Self::Old | Self::OldLarge | Self::OldPinned)
    }

    /// Whether the region holds no live objects.
    #[must_use]
    pub const fn is_dead(self) -> bool {
        matches!(self, Self::Free | Self::Garbage)
    }

    /// Whether stores into objects here must mark a card when the target
    /// is young: the region is old space or is promoted to it at cycle end.
    #[must_use]
    pub const fn needs_remembered_set(self) -> bool {
        matches!(
            self,
            Self::Old
                | Self::OldLarge
                | Self::OldPinned
                | Self::ExemptedFrom
                | Self::RecentLarge
                | Self::RecentPinned
        )
    }

    /// Whether a young collection may reclaim objects here.
    #[must_use]
    pub const fn is_young_space(self) -> bool {
        !self.is_old_space() && !self.is_dead()
    }

    /// Lower-case name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::ThreadLocal => "thread-local",
            Self::RecentFull => "recent-full",
            Self::From => "from",
            Self::ExemptedFrom => "exempted-from",
            Self::To => "to",
            Self::Old => "old",
            Self::RecentLarge => "recent-large",
            Self::OldLarge => "old-large",
            Self::RecentPinned => "recent-pinned",
            Self::OldPinned => "old-pinned",
            Self::RawPointer => "raw-pointer",
            Self::Garbage => "garbage",
        }
    }
}

bitflags! {
    /// Per-region state bits.
    #[derive(Default)]
    pub struct RegionFlags: u16 {
        /// The single object of a large region is marked.
        const MARKED = 1 << 0;
        /// The region was queued for processing in the running phase.
        const ENQUEUED = 1 << 1;
        /// The single object of a large region was resurrected.
        const RESURRECTED = 1 << 2;
        /// All references in the region were fixed this cycle.
        const FIXED = 1 << 3;
        /// Objects here already survived a cycle; copies go to old space.
        const SURVIVOR = 1 << 4;
    }
}

/// Metadata of one heap unit, and of a region when the unit is its head.
///
/// All fields are atomics: allocation, marking and fixing touch them from
/// many threads. `prev`/`next` are only changed while holding the lock of
/// the list the region is on.
#[derive(Debug)]
pub struct RegionDesc {
    index: u32,
    unit_shift: u32,
    start: usize,
    role: AtomicU8,
    region_type: AtomicU8,
    flags: AtomicU16,
    unit_count: AtomicU32,
    owner: AtomicU32,
    alloc_ptr: AtomicUsize,
    trace_line: AtomicUsize,
    copy_line: AtomicUsize,
    live_bytes: AtomicUsize,
    raw_pointer_count: AtomicU32,
    pub(super) prev: AtomicU32,
    pub(super) next: AtomicU32,
    mark_bitmap: LazyBitmap,
    resurrect_bitmap: LazyBitmap,
    enqueue_bitmap: LazyBitmap,
    cards: LazyBitmap,
}

impl RegionDesc {
    pub(crate) const fn new(index: u32, start: usize, unit_shift: u32) -> Self {
        Self {
            index,
            unit_shift,
            start,
            role: AtomicU8::new(UnitRole::Free as u8),
            region_type: AtomicU8::new(RegionType::Free as u8),
            flags: AtomicU16::new(0),
            unit_count: AtomicU32::new(0),
            owner: AtomicU32::new(u32::MAX),
            alloc_ptr: AtomicUsize::new(start),
            trace_line: AtomicUsize::new(start),
            copy_line: AtomicUsize::new(start),
            live_bytes: AtomicUsize::new(0),
            raw_pointer_count: AtomicU32::new(0),
            prev: AtomicU32::new(u32::MAX),
            next: AtomicU32::new(u32::MAX),
            mark_bitmap: LazyBitmap::new(),
            resurrect_bitmap: LazyBitmap::new(),
            enqueue_bitmap: LazyBitmap::new(),
            cards: LazyBitmap::new(),
        }
    }

    // ============ Identity & geometry ============

    /// This unit's id.
    #[must_use]
    pub const fn id(&self) -> RegionId {
        RegionId(self.index)
    }

    /// First byte of the region.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte of the region.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.capacity()
    }

    /// Bytes spanned by all units of the region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.unit_count() as usize) << self.unit_shift
    }

    /// Whether `addr` lies inside the region.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Number of units in the region.
    #[must_use]
    pub fn unit_count(&self) -> u32 {
        self.unit_count.load(Ordering::Acquire)
    }

    /// The unit's role.
    #[must_use]
    pub fn role(&self) -> UnitRole {
        UnitRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub(crate) fn set_role(&self, role: UnitRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    /// The head unit index recorded in a subordinate unit.
    #[must_use]
    pub fn owner(&self) -> RegionId {
        RegionId(self.owner.load(Ordering::Acquire))
    }

    pub(crate) fn make_subordinate(&self, owner: RegionId) {
        self.owner.store(owner.0, Ordering::Release);
        self.set_role(UnitRole::Subordinate);
    }

    /// Whether the region holds a single large object.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.role() == UnitRole::Large
    }

    /// The region's class.
    #[must_use]
    pub fn region_type(&self) -> RegionType {
        RegionType::from_u8(self.region_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_region_type(&self, region_type: RegionType) {
        self.region_type.store(region_type as u8, Ordering::Release);
    }

    /// Prepares this unit as the head of a fresh region.
    ///
    /// # Safety
    ///
    /// The unit must be free or garbage: no other thread may hold a reference
    /// into its bitmaps.
    pub(crate) unsafe fn initialize(&self, units: u32, role: UnitRole, region_type: RegionType) {
        self.unit_count.store(units, Ordering::Relaxed);
        self.owner.store(self.index, Ordering::Relaxed);
        self.alloc_ptr.store(self.start, Ordering::Relaxed);
        self.trace_line.store(self.start, Ordering::Relaxed);
        self.copy_line.store(self.start, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.raw_pointer_count.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.prev.store(u32::MAX, Ordering::Relaxed);
        self.next.store(u32::MAX, Ordering::Relaxed);
        // SAFETY: guaranteed by the caller.
        unsafe { self.release_bitmaps() };
        self.region_type.store(region_type as u8, Ordering::Relaxed);
        self.role.store(role as u8, Ordering::Release);
    }

    /// Returns this unit to a free run.
    ///
    /// # Safety
    ///
    /// Same contract as [`initialize`](Self::initialize).
    pub(crate) unsafe fn reset(&self, role: UnitRole) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.release_bitmaps() };
        self.unit_count.store(0, Ordering::Relaxed);
        self.owner.store(u32::MAX, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.alloc_ptr.store(self.start, Ordering::Relaxed);
        self.region_type.store(RegionType::Free as u8, Ordering::Relaxed);
        self.role.store(role as u8, Ordering::Release);
    }

    unsafe fn release_bitmaps(&self) {
        // SAFETY: the caller guarantees no outstanding bitmap references.
        unsafe {
            self.mark_bitmap.release_unshared();
            self.resurrect_bitmap.release_unshared();
            self.enqueue_bitmap.release_unshared();
            self.cards.release_unshared();
        }
    }

    // ============ Allocation cursor ============

    /// Current allocation cursor.
    #[must_use]
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr.load(Ordering::Acquire)
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.alloc_ptr() - self.start
    }

    /// Bytes still available for bump allocation.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.end().saturating_sub(self.alloc_ptr())
    }

    /// Bump-allocates `size` bytes on a shared region.
    ///
    /// Large and pinned regions are bumped by several threads at once, so
    /// the cursor advances by compare-and-swap.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        let end = self.end();
        let mut current = self.alloc_ptr.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size).filter(|n| *n <= end)?;
            match self.alloc_ptr.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Bump-allocates `size` bytes on a region owned by the calling thread.
    pub fn alloc_exclusive(&self, size: usize) -> Option<usize> {
        let current = self.alloc_ptr.load(Ordering::Relaxed);
        let next = current.checked_add(size).filter(|n| *n <= self.end())?;
        self.alloc_ptr.store(next, Ordering::Release);
        Some(current)
    }

    // ============ Watermarks ============

    /// Objects at or above this address were allocated after enumeration.
    #[must_use]
    pub fn trace_line(&self) -> usize {
        self.trace_line.load(Ordering::Acquire)
    }

    pub(crate) fn set_trace_line(&self, line: usize) {
        self.trace_line.store(line, Ordering::Release);
    }

    /// The Fix phase only walks objects below this address.
    #[must_use]
    pub fn copy_line(&self) -> usize {
        self.copy_line.load(Ordering::Acquire)
    }

    pub(crate) fn set_copy_line(&self, line: usize) {
        self.copy_line.store(line, Ordering::Release);
    }

    /// Whether `obj` was allocated after the cycle's enumeration.
    #[must_use]
    pub fn is_new_object(&self, obj: ObjectRef) -> bool {
        obj.address() >= self.trace_line()
    }

    /// Whether the region was created after the cycle's enumeration.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.trace_line() == self.start
    }

    // ============ Counters ============

    /// Live bytes found by the current cycle's marking.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Release);
    }

    /// Outstanding raw pointers into the region.
    #[must_use]
    pub fn raw_pointer_count(&self) -> u32 {
        self.raw_pointer_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_raw_pointer_count(&self) {
        self.raw_pointer_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_raw_pointer_count(&self) {
        let prev = self.raw_pointer_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            fatal("raw pointer released more often than acquired");
        }
    }

    // ============ Flags ============

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets `flag`, returning whether it was already set.
    pub fn set_flag(&self, flag: RegionFlags) -> bool {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Clears `flag`.
    pub fn clear_flag(&self, flag: RegionFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Whether `flag` is set.
    #[must_use]
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().contains(flag)
    }

    // ============ Object bitmaps ============

    fn word_index(&self, obj: ObjectRef) -> usize {
        (obj.address() - self.start) / OBJECT_ALIGNMENT
    }

    fn bitmap_bits(&self) -> usize {
        self.capacity() / OBJECT_ALIGNMENT
    }

    /// Marks `obj`, returning whether it was already marked.
    ///
    /// Large regions use the region-level [`RegionFlags::MARKED`] bit.
    pub fn mark(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.set_flag(RegionFlags::MARKED);
        }
        let index = self.word_index(obj);
        self.mark_bitmap.get_or_allocate(self.bitmap_bits()).set(index)
    }

    /// Whether `obj` is marked.
    #[must_use]
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.has_flag(RegionFlags::MARKED);
        }
        self.mark_bitmap.test(self.word_index(obj))
    }

    /// Whether `obj` is reachable in the current cycle: allocated after
    /// enumeration, or marked.
    #[must_use]
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        self.is_new_object(obj) || self.is_marked(obj)
    }

    /// Records that `obj` was revived after being found unreachable.
    pub fn resurrect(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.set_flag(RegionFlags::RESURRECTED);
        }
        let index = self.word_index(obj);
        self.resurrect_bitmap.get_or_allocate(self.bitmap_bits()).set(index)
    }

    /// Whether `obj` was resurrected this cycle.
    #[must_use]
    pub fn is_resurrected(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.has_flag(RegionFlags::RESURRECTED);
        }
        self.resurrect_bitmap.test(self.word_index(obj))
    }

    /// Records that `obj` was queued for post-mark processing.
    pub fn enqueue(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.set_flag(RegionFlags::ENQUEUED);
        }
        let index = self.word_index(obj);
        self.enqueue_bitmap.get_or_allocate(self.bitmap_bits()).set(index)
    }

    /// Whether `obj` was queued for post-mark processing.
    #[must_use]
    pub fn is_enqueued(&self, obj: ObjectRef) -> bool {
        if self.is_large() {
            return self.has_flag(RegionFlags::ENQUEUED);
        }
        self.enqueue_bitmap.test(self.word_index(obj))
    }

    /// Clears all per-cycle object state.
    pub(crate) fn clear_cycle_state(&self) {
        self.mark_bitmap.clear();
        self.resurrect_bitmap.clear();
        self.enqueue_bitmap.clear();
        self.clear_flag(
            RegionFlags::MARKED
                | RegionFlags::RESURRECTED
                | RegionFlags::ENQUEUED
                | RegionFlags::FIXED,
        );
        self.reset_live_bytes();
    }

    // ============ Remembered set ============

    fn card_index(&self, addr: usize) -> usize {
        (addr - self.start) / CARD_SIZE
    }

    /// Marks the card covering `addr`.
    pub fn mark_card(&self, addr: usize) {
        let bits = self.capacity().div_ceil(CARD_SIZE);
        let index = self.card_index(addr);
        let cards = self.cards.get_or_allocate(bits);
        if !cards.test(index) {
            cards.set(index);
        }
    }

    /// Whether the card covering `addr` is marked.
    #[must_use]
    pub fn is_card_marked(&self, addr: usize) -> bool {
        self.cards.test(self.card_index(addr))
    }

    /// Clears the card covering `addr`, returning whether it was marked.
    pub(crate) fn clear_card(&self, addr: usize) -> bool {
        let index = self.card_index(addr);
        self.cards.get().is_some_and(|c| c.unset(index))
    }

    /// Whether any card is marked.
    #[must_use]
    pub fn has_marked_cards(&self) -> bool {
        self.cards.get().is_some_and(|c| c.count() > 0)
    }

    /// Clears every card.
    pub(crate) fn clear_cards(&self) {
        self.cards.clear();
    }

    /// Indices of the marked cards, ascending.
    #[must_use]
    pub fn marked_cards(&self) -> Vec<usize> {
        let mut cards = Vec::new();
        if let Some(bitmap) = self.cards.get() {
            bitmap.for_each_set(|index| cards.push(index));
        }
        cards
    }

    /// Snapshots the marked cards and clears them.
    pub(crate) fn take_marked_cards(&self) -> Vec<usize> {
        let cards = self.marked_cards();
        if let Some(bitmap) = self.cards.get() {
            for &index in &cards {
                bitmap.unset(index);
            }
        }
        cards
    }

    /// Whether `[addr, addr + size)` overlaps one of `cards` (sorted).
    #[must_use]
    pub fn spans_card(&self, addr: usize, size: usize, cards: &[usize]) -> bool {
        let first = self.card_index(addr);
        let last = self.card_index(addr + size.max(1) - 1);
        let at = cards.partition_point(|&c| c < first);
        cards.get(at).is_some_and(|&c| c <= last)
    }

    // ============ Object walks ============

    /// Calls `f` for every non-filler object in `[start, limit)`.
    pub fn visit_objects_below(&self, limit: usize, model: &dyn ObjectModel, mut f: impl FnMut(ObjectRef)) {
        self.walk(limit, model, |obj| {
            f(obj);
            true
        });
    }

    /// Calls `f` for every non-filler object below the allocation cursor.
    pub fn visit_all_objects(&self, model: &dyn ObjectModel, f: impl FnMut(ObjectRef)) {
        self.visit_objects_below(self.alloc_ptr(), model, f);
    }

    /// Calls `f` for every live object until it returns `false`.
    ///
    /// Returns `false` if the walk was cut short.
    pub fn visit_live_objects_until_false(
        &self,
        model: &dyn ObjectModel,
        mut f: impl FnMut(ObjectRef) -> bool,
    ) -> bool {
        self.walk(self.alloc_ptr(), model, |obj| !self.is_live(obj) || f(obj))
    }

    fn walk(&self, limit: usize, model: &dyn ObjectModel, mut f: impl FnMut(ObjectRef) -> bool) -> bool {
        let limit = limit.min(self.end());
        let mut cursor = self.start;
        while cursor < limit {
            let Some(obj) = ObjectRef::from_address(cursor) else {
                return true;
            };
            let (size, filler) = object_extent(model, obj);
            if size == 0 || cursor + size > self.end() {
                fatal(&format!(
                    "object {cursor:#x} in {} region {} has invalid size {size}",
                    self.region_type().name(),
                    self.index
                ));
            }
            if !filler && !f(obj) {
                return false;
            }
            cursor += size;
        }
        true
    }
}

/// Size of the object at `obj` and whether it is a filler.
///
/// Objects caught mid-forward are waited on; forwarded objects report the
/// size of their copy.
pub(crate) fn object_extent(model: &dyn ObjectModel, obj: ObjectRef) -> (usize, bool) {
    let backoff = Backoff::new();
    loop {
        // SAFETY: region walks only visit addresses below the cursor, which
        // hold initialized objects.
        let word = unsafe { obj.state() }.load();
        match word.forward_state() {
            ForwardState::Normal if word.is_filler() => {
                return (usize::try_from(word.payload()).unwrap_or(0), true);
            }
            ForwardState::Normal | ForwardState::ToVersion => return (model.object_size(obj), false),
            ForwardState::Forwarded => {
                let copy = ObjectRef::from_address(usize::try_from(word.payload()).unwrap_or(0))
                    .unwrap_or_else(|| fatal("forwarded object without a copy"));
                return (model.object_size(copy), false);
            }
            ForwardState::Forwarding => backoff.snooze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(units: u32, role: UnitRole) -> (Vec<u64>, RegionDesc) {
        let backing = vec![0u64; (units as usize) * 256 / 8];
        let start = backing.as_ptr() as usize;
        let desc = RegionDesc::new(0, start, 8);
        unsafe { desc.initialize(units, role, RegionType::RecentFull) };
        (backing, desc)
    }

    #[test]
    fn test_initialize_geometry() {
        let (_mem, desc) = region(4, UnitRole::Small);
        assert_eq!(desc.unit_count(), 4);
        assert_eq!(desc.capacity(), 1024);
        assert_eq!(desc.alloc_ptr(), desc.start());
        assert_eq!(desc.trace_line(), desc.start());
        assert!(desc.is_fresh());
        assert_eq!(desc.region_type(), RegionType::RecentFull);
    }

    #[test]
    fn test_alloc_until_full() {
        let (_mem, desc) = region(1, UnitRole::Small);
        assert_eq!(desc.alloc(100), Some(desc.start()));
        assert_eq!(desc.allocated_size(), 100);
        assert_eq!(desc.alloc_exclusive(156), Some(desc.start() + 100));
        assert_eq!(desc.free_bytes(), 0);
        assert_eq!(desc.alloc(8), None);
    }

    #[test]
    fn test_small_mark_uses_bitmap() {
        let (_mem, desc) = region(1, UnitRole::Small);
        let a = ObjectRef::from_address(desc.start() + 16).unwrap();
        let b = ObjectRef::from_address(desc.start() + 24).unwrap();
        assert!(!desc.mark(a));
        assert!(desc.mark(a));
        assert!(desc.is_marked(a));
        assert!(!desc.is_marked(b));
        assert!(!desc.has_flag(RegionFlags::MARKED));
    }

    #[test]
    fn test_large_mark_uses_flag() {
        let (_mem, desc) = region(2, UnitRole::Large);
        let obj = ObjectRef::from_address(desc.start()).unwrap();
        assert!(!desc.is_marked(obj));
        assert!(!desc.mark(obj));
        assert!(desc.mark(obj));
        assert!(desc.has_flag(RegionFlags::MARKED));

        desc.clear_cycle_state();
        assert!(!desc.is_marked(obj));
    }

    #[test]
    fn test_liveness_respects_trace_line() {
        let (_mem, desc) = region(1, UnitRole::Small);
        desc.alloc(64);
        desc.set_trace_line(desc.alloc_ptr());
        let old = ObjectRef::from_address(desc.start()).unwrap();
        let new = ObjectRef::from_address(desc.start() + 64).unwrap();
        assert!(!desc.is_live(old));
        assert!(desc.is_live(new));
        desc.mark(old);
        assert!(desc.is_live(old));
    }

    #[test]
    fn test_cards() {
        let (_mem, desc) = region(4, UnitRole::Small);
        assert!(!desc.has_marked_cards());
        desc.mark_card(desc.start() + 600);
        assert!(desc.is_card_marked(desc.start() + 512));
        assert!(!desc.is_card_marked(desc.start()));
        assert!(desc.has_marked_cards());
        assert!(desc.clear_card(desc.start() + 1000));
        assert!(!desc.has_marked_cards());
    }

    #[test]
    fn test_card_snapshot() {
        let (_mem, desc) = region(8, UnitRole::Small);
        desc.mark_card(desc.start() + 1100);
        desc.mark_card(desc.start() + 8);
        assert_eq!(desc.marked_cards(), vec![0, 2]);
        assert!(desc.spans_card(desc.start() + 1000, 100, &[2]));
        assert!(!desc.spans_card(desc.start() + 520, 100, &[0, 2]));

        assert_eq!(desc.take_marked_cards(), vec![0, 2]);
        assert!(!desc.has_marked_cards());
    }

    #[test]
    fn test_resurrect_and_enqueue() {
        let (_mem, desc) = region(1, UnitRole::Small);
        let obj = ObjectRef::from_address(desc.start() + 8).unwrap();
        assert!(!desc.resurrect(obj));
        assert!(desc.is_resurrected(obj));
        assert!(!desc.enqueue(obj));
        assert!(desc.is_enqueued(obj));
        desc.clear_cycle_state();
        assert!(!desc.is_resurrected(obj));
        assert!(!desc.is_enqueued(obj));
    }

    #[test]
    fn test_type_classes() {
        assert!(RegionType::Old.is_old_space());
        assert!(RegionType::OldLarge.is_old_space());
        assert!(!RegionType::To.is_old_space());
        assert!(RegionType::Garbage.is_dead());
        assert!(RegionType::RecentLarge.needs_remembered_set());
        assert!(!RegionType::To.needs_remembered_set());
        assert!(RegionType::To.is_young_space());
        assert!(!RegionType::Garbage.is_young_space());
        assert_eq!(RegionType::LISTED.len(), 12);
        for ty in RegionType::LISTED {
            assert_eq!(RegionType::from_u8(ty as u8), ty);
        }
    }
}
