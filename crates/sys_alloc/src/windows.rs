use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills the zeroed struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves and commits `len` bytes of read/write memory.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`.
    pub unsafe fn map_anon(len: usize, _populate: bool, _no_reserve: bool) -> io::Result<Self> {
        // SAFETY: a null address lets the OS choose the range.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Decommits a page-aligned subrange and commits it again, which leaves
    /// the pages zero-filled on the next access.
    ///
    /// # Safety
    ///
    /// The range must be page aligned, inside the mapping and hold no live data.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: the caller guarantees the range is inside the mapping.
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<std::ffi::c_void>();
        // SAFETY: the range belongs to our reservation.
        if unsafe { VirtualFree(addr, len, MEM_DECOMMIT) } == 0 {
            return Err(Error::last_os_error());
        }
        // SAFETY: recommitting pages of our own reservation.
        if unsafe { VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE) }.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: MEM_RELEASE requires dwSize to be 0 and the base address
            // returned by VirtualAlloc.
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

// SAFETY: the raw pointer is only an address of memory we own.
unsafe impl Send for MmapInner {}
// SAFETY: see above.
unsafe impl Sync for MmapInner {}
