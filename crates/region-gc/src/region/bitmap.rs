//! Per-region bitmaps.
//!
//! Mark, resurrect and enqueue bitmaps use one bit per 8-byte word of the
//! region; the remembered-set card table uses one bit per [`CARD_SIZE`]
//! bytes. All of them are allocated on first use through [`LazyBitmap`].

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Bytes covered by one remembered-set card.
pub const CARD_SIZE: usize = 512;

/// A fixed-size atomic bitmap.
#[derive(Debug)]
pub struct RegionBitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl RegionBitmap {
    /// Creates a cleared bitmap with room for `bits` bits.
    #[must_use]
    pub fn new(bits: usize) -> Self {
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, bits }
    }

    /// Number of addressable bits.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.bits
    }

    /// Sets bit `index`, returning whether it was already set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn set(&self, index: usize) -> bool {
        assert!(index < self.bits, "bitmap index {index} out of range");
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    /// Clears bit `index`, returning whether it was set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn unset(&self, index: usize) -> bool {
        assert!(index < self.bits, "bitmap index {index} out of range");
        let mask = 1u64 << (index % 64);
        self.words[index / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Tests bit `index`; out-of-range bits read as clear.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        (self.words[index / 64].load(Ordering::Acquire) >> (index % 64)) & 1 != 0
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Clears every bit.
    pub fn clear(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Calls `f` with the index of every set bit, in ascending order.
    pub fn for_each_set(&self, mut f: impl FnMut(usize)) {
        for (i, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(i * 64 + bit);
                bits &= bits - 1;
            }
        }
    }
}

/// Sentinel stored while one thread allocates the bitmap.
const ALLOCATING: *mut RegionBitmap = ptr::dangling_mut();

/// A bitmap pointer that moves through `null -> ALLOCATING -> bitmap`.
///
/// Exactly one thread wins the CAS to the sentinel and allocates; losers
/// spin on the load until the real pointer appears.
#[derive(Debug)]
pub struct LazyBitmap {
    ptr: AtomicPtr<RegionBitmap>,
}

impl Default for LazyBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyBitmap {
    /// An unallocated bitmap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Returns the bitmap, allocating it with `bits` capacity on first use.
    pub fn get_or_allocate(&self, bits: usize) -> &RegionBitmap {
        let backoff = crossbeam::utils::Backoff::new();
        loop {
            let current = self.ptr.load(Ordering::Acquire);
            if current.is_null() {
                if self
                    .ptr
                    .compare_exchange(ptr::null_mut(), ALLOCATING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                let bitmap = Box::into_raw(Box::new(RegionBitmap::new(bits)));
                self.ptr.store(bitmap, Ordering::Release);
                // SAFETY: just allocated; freed only through `release(&mut self)`.
                return unsafe { &*bitmap };
            }
            if current == ALLOCATING {
                backoff.snooze();
                continue;
            }
            // SAFETY: a published non-sentinel pointer came from Box::into_raw
            // and lives until `release`.
            return unsafe { &*current };
        }
    }

    /// Returns the bitmap if it has been published.
    #[must_use]
    pub fn get(&self) -> Option<&RegionBitmap> {
        let current = self.ptr.load(Ordering::Acquire);
        if current.is_null() || current == ALLOCATING {
            None
        } else {
            // SAFETY: see `get_or_allocate`.
            Some(unsafe { &*current })
        }
    }

    /// Whether the bitmap exists and bit `index` is set.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        self.get().is_some_and(|b| b.test(index))
    }

    /// Clears all bits without freeing the storage.
    pub fn clear(&self) {
        if let Some(bitmap) = self.get() {
            bitmap.clear();
        }
    }

    /// Frees the storage. Exclusive access guarantees no reader holds a
    /// reference into it.
    pub fn release(&mut self) {
        // SAFETY: `&mut self` rules out outstanding references.
        unsafe { self.release_unshared() };
    }

    /// Frees the storage through a shared reference.
    ///
    /// # Safety
    ///
    /// No other thread may hold or obtain a reference into the bitmap until
    /// this returns.
    pub unsafe fn release_unshared(&self) {
        let current = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !current.is_null() && current != ALLOCATING {
            // SAFETY: the pointer came from Box::into_raw and is unpublished now.
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

impl Drop for LazyBitmap {
    fn drop(&mut self) {
        self.release();
    }
}
