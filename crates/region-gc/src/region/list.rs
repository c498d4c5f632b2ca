//! Intrusive region lists.
//!
//! Links live in the descriptors themselves (`prev`/`next` unit indices).
//! Each list is guarded by its own mutex, and a region's links are only
//! touched while the lock of the list holding it is held.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::gc::sync::{LockGuard, LockOrder};
use crate::region::desc::{RegionId, RegionType};
use crate::region::table::RegionTable;

const NIL: u32 = u32::MAX;

#[derive(Debug)]
struct ListInner {
    head: u32,
    tail: u32,
    regions: usize,
    units: usize,
}

/// A doubly-linked list of regions of one [`RegionType`].
#[derive(Debug)]
pub struct RegionList {
    region_type: RegionType,
    inner: Mutex<ListInner>,
    regions: AtomicUsize,
    units: AtomicUsize,
}

/// A held list lock.
pub struct ListLock<'a> {
    list: &'a RegionList,
    inner: MutexGuard<'a, ListInner>,
    _order: LockGuard,
}

impl RegionList {
    /// An empty list whose members are tagged `region_type`.
    #[must_use]
    pub const fn new(region_type: RegionType) -> Self {
        Self {
            region_type,
            inner: Mutex::new(ListInner {
                head: NIL,
                tail: NIL,
                regions: 0,
                units: 0,
            }),
            regions: AtomicUsize::new(0),
            units: AtomicUsize::new(0),
        }
    }

    /// The type tag of this list's members.
    #[must_use]
    pub const fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Number of regions, read without locking.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.load(Ordering::Acquire)
    }

    /// Number of units, read without locking.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.load(Ordering::Acquire)
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region_count() == 0
    }

    /// Locks the list.
    pub fn lock(&self) -> ListLock<'_> {
        let order = LockGuard::new(LockOrder::RegionList);
        ListLock {
            list: self,
            inner: self.inner.lock(),
            _order: order,
        }
    }

    /// Adds `id` at the head, retagging it with this list's type.
    pub fn prepend(&self, table: &RegionTable, id: RegionId) {
        self.lock().prepend(table, id);
    }

    /// Removes `id`. Returns `false` if it is not on this list.
    pub fn delete(&self, table: &RegionTable, id: RegionId) -> bool {
        self.lock().delete(table, id)
    }

    /// Removes and returns the head region.
    pub fn pop_front(&self, table: &RegionTable) -> Option<RegionId> {
        self.lock().pop_front(table)
    }

    /// Removes and returns the first region matching `pred`.
    pub fn take_if(&self, table: &RegionTable, pred: impl FnMut(RegionId) -> bool) -> Option<RegionId> {
        self.lock().take_if(table, pred)
    }

    /// Splices all regions of `other` onto the head of this list, retagging
    /// each spliced region.
    pub fn merge(&self, table: &RegionTable, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Lists are locked in type order so concurrent merges and accounting
        // snapshots cannot deadlock.
        let (mut src, mut dst) = if (other.region_type as u8) < (self.region_type as u8) {
            let src = other.lock();
            (src, self.lock())
        } else {
            let dst = self.lock();
            (other.lock(), dst)
        };
        dst.merge_from(table, &mut src);
    }

    /// Ids of all regions, head first.
    pub fn snapshot(&self, table: &RegionTable) -> Vec<RegionId> {
        let lock = self.lock();
        let mut ids = Vec::with_capacity(lock.inner.regions);
        lock.for_each(table, |id| ids.push(id));
        ids
    }

    /// Removes and returns every region.
    pub fn drain(&self, table: &RegionTable) -> Vec<RegionId> {
        let mut lock = self.lock();
        let mut ids = Vec::with_capacity(lock.inner.regions);
        while let Some(id) = lock.pop_front(table) {
            ids.push(id);
        }
        ids
    }
}

impl ListLock<'_> {
    fn publish_counts(&self) {
        self.list.regions.store(self.inner.regions, Ordering::Release);
        self.list.units.store(self.inner.units, Ordering::Release);
    }

    /// Units on the list.
    #[must_use]
    pub fn units(&self) -> usize {
        self.inner.units
    }

    /// Adds `id` at the head.
    pub fn prepend(&mut self, table: &RegionTable, id: RegionId) {
        let region = table.region(id);
        region.set_region_type(self.list.region_type);
        region.prev.store(NIL, Ordering::Relaxed);
        region.next.store(self.inner.head, Ordering::Relaxed);
        if self.inner.head == NIL {
            self.inner.tail = id.0;
        } else {
            table.region(RegionId(self.inner.head)).prev.store(id.0, Ordering::Relaxed);
        }
        self.inner.head = id.0;
        self.inner.regions += 1;
        self.inner.units += region.unit_count() as usize;
        self.publish_counts();
    }

    /// Unlinks `id`. Returns `false` if it is not on this list.
    pub fn delete(&mut self, table: &RegionTable, id: RegionId) -> bool {
        let region = table.region(id);
        if region.region_type() != self.list.region_type || !self.contains(table, id) {
            return false;
        }
        let prev = region.prev.load(Ordering::Relaxed);
        let next = region.next.load(Ordering::Relaxed);
        if prev == NIL {
            self.inner.head = next;
        } else {
            table.region(RegionId(prev)).next.store(next, Ordering::Relaxed);
        }
        if next == NIL {
            self.inner.tail = prev;
        } else {
            table.region(RegionId(next)).prev.store(prev, Ordering::Relaxed);
        }
        region.prev.store(NIL, Ordering::Relaxed);
        region.next.store(NIL, Ordering::Relaxed);
        self.inner.regions -= 1;
        self.inner.units -= region.unit_count() as usize;
        self.publish_counts();
        true
    }

    fn contains(&self, table: &RegionTable, id: RegionId) -> bool {
        let region = table.region(id);
        let prev = region.prev.load(Ordering::Relaxed);
        if prev == NIL {
            return self.inner.head == id.0;
        }
        table.region(RegionId(prev)).next.load(Ordering::Relaxed) == id.0
    }

    /// Removes and returns the head region.
    pub fn pop_front(&mut self, table: &RegionTable) -> Option<RegionId> {
        let head = self.inner.head;
        if head == NIL {
            return None;
        }
        let id = RegionId(head);
        self.delete(table, id);
        Some(id)
    }

    /// Removes and returns the first region matching `pred`.
    pub fn take_if(&mut self, table: &RegionTable, mut pred: impl FnMut(RegionId) -> bool) -> Option<RegionId> {
        let mut cursor = self.inner.head;
        while cursor != NIL {
            let id = RegionId(cursor);
            if pred(id) {
                self.delete(table, id);
                return Some(id);
            }
            cursor = table.region(id).next.load(Ordering::Relaxed);
        }
        None
    }

    /// Calls `f` with every region id, head first.
    pub fn for_each(&self, table: &RegionTable, mut f: impl FnMut(RegionId)) {
        let mut cursor = self.inner.head;
        while cursor != NIL {
            let id = RegionId(cursor);
            let next = table.region(id).next.load(Ordering::Relaxed);
            f(id);
            cursor = next;
        }
    }

    fn merge_from(&mut self, table: &RegionTable, src: &mut ListLock<'_>) {
        if src.inner.head == NIL {
            return;
        }
        let region_type = self.list.region_type;
        src.for_each(table, |id| table.region(id).set_region_type(region_type));

        let src_tail = src.inner.tail;
        table.region(RegionId(src_tail)).next.store(self.inner.head, Ordering::Relaxed);
        if self.inner.head == NIL {
            self.inner.tail = src_tail;
        } else {
            table.region(RegionId(self.inner.head)).prev.store(src_tail, Ordering::Relaxed);
        }
        self.inner.head = src.inner.head;
        self.inner.regions += src.inner.regions;
        self.inner.units += src.inner.units;

        src.inner.head = NIL;
        src.inner.tail = NIL;
        src.inner.regions = 0;
        src.inner.units = 0;
        src.publish_counts();
        self.publish_counts();
    }
}
