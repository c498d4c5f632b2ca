use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page_size = usize::try_from(raw).unwrap_or(4096);
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes of private anonymous memory.
    ///
    /// # Safety
    ///
    /// Calls `mmap`.
    pub unsafe fn map_anon(len: usize, populate: bool, no_reserve: bool) -> io::Result<Self> {
        let populate = if populate { MAP_POPULATE } else { 0 };
        let no_reserve = if no_reserve { MAP_NORESERVE } else { 0 };

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate | no_reserve;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        // SAFETY: no fixed address is requested, so the kernel picks a free range.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Drops the pages of a page-aligned subrange.
    ///
    /// `MADV_DONTNEED` on a private anonymous mapping guarantees zero-fill on
    /// the next access.
    ///
    /// # Safety
    ///
    /// The range must be page aligned, inside the mapping and hold no live data.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: the caller guarantees the range is inside the mapping.
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        // SAFETY: madvise only affects the given range of our own mapping.
        let rc = unsafe { libc::madvise(addr.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: ptr/len describe a mapping we own.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

// SAFETY: the raw pointer is only an address of memory we own.
unsafe impl Send for MmapInner {}
// SAFETY: see above.
unsafe impl Sync for MmapInner {}
