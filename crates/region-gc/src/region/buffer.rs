//! Thread-owned allocation cursors.
//!
//! An [`AllocBuffer`] pins one region to one thread, which then bumps the
//! region's cursor without synchronization. Mutators hold one for new
//! objects; mutators and collector workers each hold a [`CopyBuffer`] for
//! evacuated objects.

use crate::region::desc::{RegionId, RegionType};
use crate::region::table::RegionTable;

/// One region owned by the current thread.
#[derive(Debug)]
pub struct AllocBuffer {
    region: Option<RegionId>,
    region_type: RegionType,
}

impl AllocBuffer {
    /// An empty buffer that will hold regions of `region_type`.
    #[must_use]
    pub const fn new(region_type: RegionType) -> Self {
        Self {
            region: None,
            region_type,
        }
    }

    /// Type of the regions this buffer takes.
    #[must_use]
    pub const fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// The current region.
    #[must_use]
    pub const fn region(&self) -> Option<RegionId> {
        self.region
    }

    /// Bumps `size` bytes out of the current region.
    pub fn try_allocate(&self, table: &RegionTable, size: usize) -> Option<usize> {
        table.region(self.region?).alloc_exclusive(size)
    }

    /// Installs a freshly taken region, returning the previous one.
    pub fn install(&mut self, region: RegionId) -> Option<RegionId> {
        self.region.replace(region)
    }

    /// Detaches the current region.
    pub fn take(&mut self) -> Option<RegionId> {
        self.region.take()
    }
}

/// Destinations for evacuated objects: survivors of a young region go to
/// to-space, objects that already survived once are promoted to old space.
#[derive(Debug)]
pub struct CopyBuffer {
    pub(crate) to: AllocBuffer,
    pub(crate) old: AllocBuffer,
}

impl Default for CopyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyBuffer {
    /// Empty copy buffers.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            to: AllocBuffer::new(RegionType::To),
            old: AllocBuffer::new(RegionType::Old),
        }
    }

    /// The buffer for the given destination.
    pub fn target(&mut self, promote: bool) -> &mut AllocBuffer {
        if promote {
            &mut self.old
        } else {
            &mut self.to
        }
    }

    /// Whether neither buffer holds a region.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.to.region.is_none() && self.old.region.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::desc::UnitRole;

    #[test]
    fn test_bump_within_region() {
        let table = RegionTable::reserve(256, 2).unwrap();
        unsafe { table.unit(0).initialize(1, UnitRole::Small, RegionType::ThreadLocal) };

        let mut buffer = AllocBuffer::new(RegionType::ThreadLocal);
        assert_eq!(buffer.try_allocate(&table, 16), None);
        assert_eq!(buffer.install(RegionId(0)), None);

        let a = buffer.try_allocate(&table, 200).unwrap();
        assert_eq!(a, table.unit_start(0));
        assert_eq!(buffer.try_allocate(&table, 64), None);
        assert_eq!(buffer.try_allocate(&table, 56), Some(a + 200));
        assert_eq!(buffer.take(), Some(RegionId(0)));
        assert_eq!(buffer.region(), None);
    }

    #[test]
    fn test_copy_buffer_targets() {
        let mut copy = CopyBuffer::new();
        assert!(copy.is_empty());
        assert_eq!(copy.target(true).region_type(), RegionType::Old);
        assert_eq!(copy.target(false).region_type(), RegionType::To);
        copy.target(false).install(RegionId(3));
        assert!(!copy.is_empty());
    }
}
