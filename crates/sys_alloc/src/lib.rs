//! Reservation of the contiguous address range backing a managed heap.
//!
//! A heap reserves one anonymous mapping at startup and never remaps it. Unit
//! ranges that the collector stops using can be handed back to the OS with
//! [`Mmap::decommit`]; the range stays addressable and reads back as zero.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the granularity at which a reservation's base address is aligned.
///
/// On Windows this is typically 64KB. On Unix it is the page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// An owned anonymous mapping.
///
/// The range is unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns the physical pages backing `[offset, offset + len)` to the OS.
    ///
    /// The range stays mapped and readable; its next read observes zeroes.
    /// `offset` and `len` are rounded inward to page boundaries, so partial
    /// pages at either end keep their contents.
    ///
    /// # Safety
    ///
    /// No live data may reside in the range: every byte in it is lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies outside the mapping or the OS
    /// rejects the request.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range outside mapping"))?;
        let page = page_size();
        let start = offset.next_multiple_of(page);
        let end = end - end % page;
        if start >= end {
            return Ok(());
        }
        // SAFETY: the range is page aligned and inside the mapping; the caller
        // guarantees nothing live is stored there.
        unsafe { self.inner.decommit(start, end - start) }
    }
}

// SAFETY: the mapping is plain memory; synchronization of its contents is the
// owner's concern.
unsafe impl Send for Mmap {}
// SAFETY: see above.
unsafe impl Sync for Mmap {}

/// Configuration for reserving a heap mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Prefaults the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skips swap reservation (`MAP_NORESERVE` where supported).
    ///
    /// Large heaps that are mostly untouched should set this.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates a zero-filled anonymous read/write mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is zero or the OS refuses the mapping.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        // SAFETY: a fresh anonymous mapping with no address hint cannot alias
        // existing memory.
        let inner = unsafe { os::MmapInner::map_anon(self.len, self.populate, self.no_reserve)? };
        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert!(ps.is_power_of_two(), "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag.is_power_of_two());
        assert!(ag >= page_size());
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = MmapOptions::new().map_anon().err().expect("zero length must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let len = page_size() * 4;
        let mmap = MmapOptions::new()
            .len(len)
            .no_reserve(true)
            .map_anon()
            .expect("failed to map");

        let base = mmap.ptr();
        assert!(!base.is_null());
        assert_eq!(base as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        unsafe {
            assert_eq!(ptr::read_volatile(base.add(len - 1)), 0);
            ptr::write_volatile(base, 42);
            assert_eq!(ptr::read_volatile(base), 42);
        }
    }

    #[test]
    fn test_decommit_reads_back_zero() {
        let page = page_size();
        let mmap = MmapOptions::new().len(page * 3).map_anon().expect("failed to map");
        let base = mmap.ptr();

        unsafe {
            ptr::write_bytes(base, 0xAB, page * 3);
            mmap.decommit(page, page).expect("decommit failed");

            assert_eq!(ptr::read_volatile(base), 0xAB);
            assert_eq!(ptr::read_volatile(base.add(page)), 0);
            assert_eq!(ptr::read_volatile(base.add(2 * page - 1)), 0);
            assert_eq!(ptr::read_volatile(base.add(2 * page)), 0xAB);
        }
    }

    #[test]
    fn test_decommit_partial_page_is_noop() {
        let page = page_size();
        let mmap = MmapOptions::new().len(page * 2).map_anon().expect("failed to map");
        let base = mmap.ptr();

        unsafe {
            ptr::write_bytes(base, 0x11, page * 2);
            mmap.decommit(8, page - 16).expect("decommit failed");
            assert_eq!(ptr::read_volatile(base.add(8)), 0x11);
        }
    }

    #[test]
    fn test_decommit_out_of_range() {
        let page = page_size();
        let mmap = MmapOptions::new().len(page).map_anon().expect("failed to map");
        let err = unsafe { mmap.decommit(0, page * 2) }.expect_err("range check");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
