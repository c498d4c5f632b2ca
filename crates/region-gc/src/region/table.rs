//! The reserved heap range and its unit descriptor arena.

use sys_alloc::{Mmap, MmapOptions};

use crate::error::HeapError;
use crate::object::ObjectRef;
use crate::region::desc::{RegionDesc, RegionId, UnitRole};

/// Maps an address to its unit index: `(address - base) / unit_size`.
///
/// Returns `None` for addresses outside `[base, base + unit_count << shift)`.
#[must_use]
pub const fn unit_index_of(base: usize, unit_shift: u32, unit_count: usize, address: usize) -> Option<usize> {
    if address < base {
        return None;
    }
    let index = (address - base) >> unit_shift;
    if index < unit_count {
        Some(index)
    } else {
        None
    }
}

/// The heap's reserved memory plus one [`RegionDesc`] per unit.
pub struct RegionTable {
    mmap: Mmap,
    base: usize,
    unit_shift: u32,
    units: Box<[RegionDesc]>,
}

impl std::fmt::Debug for RegionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionTable")
            .field("base", &format_args!("{:#x}", self.base))
            .field("unit_size", &self.unit_size())
            .field("unit_count", &self.units.len())
            .finish_non_exhaustive()
    }
}

impl RegionTable {
    /// Reserves `unit_count` units of `unit_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Reserve`] if the OS refuses the mapping.
    pub fn reserve(unit_size: usize, unit_count: usize) -> Result<Self, HeapError> {
        debug_assert!(unit_size.is_power_of_two());
        let unit_shift = unit_size.trailing_zeros();
        let mmap = MmapOptions::new()
            .len(unit_size * unit_count)
            .no_reserve(true)
            .map_anon()
            .map_err(HeapError::Reserve)?;
        let base = mmap.ptr() as usize;
        let units = (0..unit_count)
            .map(|i| {
                let index = u32::try_from(i).unwrap_or(u32::MAX);
                RegionDesc::new(index, base + (i << unit_shift), unit_shift)
            })
            .collect();
        tracing::debug!(base, unit_size, unit_count, "heap reserved");
        Ok(Self {
            mmap,
            base,
            unit_shift,
            units,
        })
    }

    /// First heap address.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// One past the last heap address.
    #[must_use]
    pub fn end(&self) -> usize {
        self.base + (self.units.len() << self.unit_shift)
    }

    /// Bytes per unit.
    #[must_use]
    pub const fn unit_size(&self) -> usize {
        1 << self.unit_shift
    }

    /// Number of units.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Whether `address` lies in the heap.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// Unit index of `address`.
    #[must_use]
    pub fn unit_index(&self, address: usize) -> Option<usize> {
        unit_index_of(self.base, self.unit_shift, self.units.len(), address)
    }

    /// Descriptor of unit `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn unit(&self, index: usize) -> &RegionDesc {
        &self.units[index]
    }

    /// Descriptor of the region headed by `id`.
    #[must_use]
    pub fn region(&self, id: RegionId) -> &RegionDesc {
        &self.units[id.index()]
    }

    /// The region containing `address`, if it is inside an allocated region.
    #[must_use]
    pub fn region_of(&self, address: usize) -> Option<&RegionDesc> {
        let unit = self.unit(self.unit_index(address)?);
        match unit.role() {
            UnitRole::Small | UnitRole::Large => Some(unit),
            UnitRole::Subordinate => Some(self.region(unit.owner())),
            UnitRole::Free | UnitRole::Released => None,
        }
    }

    /// The region containing `obj`.
    #[must_use]
    pub fn region_of_object(&self, obj: ObjectRef) -> Option<&RegionDesc> {
        self.region_of(obj.address())
    }

    /// Start address of unit `index`.
    #[must_use]
    pub const fn unit_start(&self, index: usize) -> usize {
        self.base + (index << self.unit_shift)
    }

    /// Zeroes `units` units starting at unit `index`.
    ///
    /// # Safety
    ///
    /// The range must hold no live objects and be owned by the caller.
    pub(crate) unsafe fn zero_units(&self, index: usize, units: usize) {
        let start = self.unit_start(index) as *mut u8;
        // SAFETY: the range lies in our mapping and is owned by the caller.
        unsafe { std::ptr::write_bytes(start, 0, units << self.unit_shift) };
    }

    /// Returns the pages of a unit range to the OS.
    ///
    /// Whole pages are decommitted; the partial pages at either end are
    /// zeroed instead, so the range reads as zero on success.
    ///
    /// # Safety
    ///
    /// The range must hold no live objects and be owned by the caller.
    pub(crate) unsafe fn decommit_units(&self, index: usize, units: usize) -> bool {
        let offset = index << self.unit_shift;
        let len = units << self.unit_shift;
        let page = sys_alloc::page_size();
        let head = (offset.next_multiple_of(page) - offset).min(len);
        let tail = (offset + len) % page;
        let tail = if head == len { 0 } else { tail };
        // SAFETY: forwarded to the caller.
        match unsafe { self.mmap.decommit(offset, len) } {
            Ok(()) => {
                // SAFETY: both edges lie inside the caller's range.
                unsafe {
                    std::ptr::write_bytes((self.base + offset) as *mut u8, 0, head);
                    std::ptr::write_bytes((self.base + offset + len - tail) as *mut u8, 0, tail);
                }
                true
            }
            Err(error) => {
                tracing::warn!(%error, index, units, "failed to decommit heap units");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::desc::RegionType;

    #[test]
    fn test_unit_index_of() {
        assert_eq!(unit_index_of(0x1000, 8, 4, 0x1000), Some(0));
        assert_eq!(unit_index_of(0x1000, 8, 4, 0x10ff), Some(0));
        assert_eq!(unit_index_of(0x1000, 8, 4, 0x1100), Some(1));
        assert_eq!(unit_index_of(0x1000, 8, 4, 0x13ff), Some(3));
        assert_eq!(unit_index_of(0x1000, 8, 4, 0x1400), None);
        assert_eq!(unit_index_of(0x1000, 8, 4, 0xfff), None);
    }

    #[test]
    fn test_reserve_layout() {
        let table = RegionTable::reserve(256, 1000).unwrap();
        assert_eq!(table.unit_count(), 1000);
        assert_eq!(table.unit_size(), 256);
        assert_eq!(table.end() - table.base(), 256_000);
        assert_eq!(table.unit(3).start(), table.base() + 768);
        assert!(table.region_of(table.base()).is_none());
    }

    #[test]
    fn test_region_of_resolves_subordinates() {
        let table = RegionTable::reserve(256, 16).unwrap();
        let head = table.unit(2);
        unsafe { head.initialize(3, UnitRole::Small, RegionType::Old) };
        table.unit(3).make_subordinate(head.id());
        table.unit(4).make_subordinate(head.id());

        let inside = table.unit_start(4) + 10;
        let region = table.region_of(inside).unwrap();
        assert_eq!(region.id(), RegionId(2));
        assert!(region.contains(inside));
        assert!(table.region_of(table.unit_start(5)).is_none());
    }

    #[test]
    fn test_decommit_zeroes_partial_pages() {
        let table = RegionTable::reserve(256, 64).unwrap();
        let start = table.unit_start(3) as *mut u8;
        let len = 40 * 256;
        unsafe {
            std::ptr::write_bytes(start, 0xab, len + 256);
            assert!(table.decommit_units(3, 40));
            let bytes = std::slice::from_raw_parts(start, len);
            assert!(bytes.iter().all(|&byte| byte == 0));
        }
        let after = unsafe { *(table.unit_start(43) as *const u8) };
        assert_eq!(after, 0xab);
    }
}
