//! Work-stealing queue for parallel marking.
//!
//! A bounded Chase-Lev deque: the owning worker pushes and pops at the
//! bottom (LIFO), idle workers steal from the top (FIFO).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Lock-free work stealing queue.
///
/// Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
/// by Chase and Lev (2005), with the fence placement of "Correct and Efficient
/// Work-Stealing for Weak Memory Models" (Lê et al., 2013).
///
/// # Invariants
///
/// - `N` must be a power of 2
/// - Queue is empty when `bottom == top`
/// - Queue is full when `bottom - top == N`
/// - Only the owning worker calls [`push`](Self::push) and [`pop`](Self::pop)
#[derive(Debug)]
pub struct StealQueue<T: Copy, const N: usize> {
    buffer: UnsafeCell<[MaybeUninit<T>; N]>,
    bottom: AtomicUsize,
    top: AtomicUsize,
}

impl<T: Copy, const N: usize> StealQueue<T, N> {
    const MASK: usize = N - 1;

    /// Create a new steal queue.
    ///
    /// # Panics
    ///
    /// Panics if `N` is not a power of 2.
    #[must_use]
    pub const fn new() -> Self {
        assert!(N.is_power_of_two(), "StealQueue size N must be a power of 2");

        Self {
            buffer: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
            bottom: AtomicUsize::new(0),
            top: AtomicUsize::new(0),
        }
    }

    /// Push an item to the local end (LIFO). Owner only.
    ///
    /// Returns `false` if the queue is full.
    pub fn push(&self, item: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) >= N {
            return false;
        }

        // SAFETY: slot `b` is outside `[top, bottom)`, so no stealer reads it.
        unsafe {
            (*self.buffer.get())[b & Self::MASK].write(item);
        }

        // Release: the slot write is visible before the new bottom.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop an item from the local end (LIFO). Owner only.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        if b == self.top.load(Ordering::Acquire) {
            return None;
        }
        let new_b = b.wrapping_sub(1);
        self.bottom.store(new_b, Ordering::Relaxed);
        // The bottom store must be ordered before the top load, or a stealer
        // and the owner could both take the last item.
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if new_b.wrapping_sub(t) as isize > 0 {
            // SAFETY: more than one item remained; stealers cannot reach `new_b`.
            return Some(unsafe { (*self.buffer.get())[new_b & Self::MASK].assume_init_read() });
        }
        if new_b != t {
            // Emptied by stealers in the meantime.
            self.bottom.store(b, Ordering::Relaxed);
            return None;
        }

        // SAFETY: the slot was written by push; the CAS below decides who keeps it.
        let item = unsafe { (*self.buffer.get())[new_b & Self::MASK].assume_init_read() };
        let won = self
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b, Ordering::Relaxed);
        won.then_some(item)
    }

    /// Steal an item from the remote end (FIFO). Any thread.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if b.wrapping_sub(t) as isize <= 0 {
            return None;
        }

        // Read before claiming: once top moves the owner may overwrite the slot.
        // SAFETY: `t < b`, so the slot holds an item pushed by the owner.
        let item = unsafe { (*self.buffer.get())[t & Self::MASK].assume_init_read() };
        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| item)
    }

    /// Number of queued items; approximate while other threads run.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let len = b.wrapping_sub(t);
        if len as isize <= 0 {
            0
        } else {
            len
        }
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Copy, const N: usize> Default for StealQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: slots are handed over through the bottom/top protocol: each slot is
// read by at most one thread per push, and the top CAS arbitrates races.
unsafe impl<T: Copy + Send, const N: usize> Send for StealQueue<T, N> {}

// SAFETY: See Send impl
unsafe impl<T: Copy + Send, const N: usize> Sync for StealQueue<T, N> {}

#[cfg(test)]
mod tests {
    use super::StealQueue;

    #[test]
    fn test_steal_queue_basic() {
        let queue: StealQueue<i32, 1024> = StealQueue::new();
        assert!(queue.is_empty());

        assert!(queue.push(42));
        assert!(!queue.is_empty());

        assert_eq!(queue.pop(), Some(42));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_steal_queue_fifo() {
        let queue: StealQueue<i32, 1024> = StealQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.steal(), Some(1));
        assert_eq!(queue.steal(), Some(2));
        assert_eq!(queue.steal(), Some(3));
        assert_eq!(queue.steal(), None);
    }

    #[test]
    fn test_steal_queue_lifo() {
        let queue: StealQueue<i32, 1024> = StealQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn test_steal_queue_bounds() {
        let queue: StealQueue<i32, 16> = StealQueue::new();
        for i in 0..16 {
            assert!(queue.push(i));
        }
        assert!(!queue.push(999));
        assert_eq!(queue.len(), 16);
    }

    #[test]
    fn test_wrap_around() {
        let queue: StealQueue<i32, 8> = StealQueue::new();
        for round in 0..4 {
            for i in 0..8 {
                assert!(queue.push(round * 10 + i));
            }
            assert_eq!(queue.steal(), Some(round * 10));
            for _ in 0..7 {
                assert!(queue.pop().is_some());
            }
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn test_concurrent_steal_takes_each_item_once() {
        const ITEMS: usize = 10_000;
        let queue: StealQueue<usize, 16384> = StealQueue::new();
        let taken = std::sync::Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let mut local = Vec::new();
                    let mut misses = 0;
                    while misses < 1000 {
                        if let Some(item) = queue.steal() {
                            local.push(item);
                            misses = 0;
                        } else {
                            misses += 1;
                            std::thread::yield_now();
                        }
                    }
                    taken.lock().unwrap().extend(local);
                });
            }
            let mut local = Vec::new();
            for i in 0..ITEMS {
                assert!(queue.push(i));
                if i % 3 == 0 {
                    if let Some(item) = queue.pop() {
                        local.push(item);
                    }
                }
            }
            while let Some(item) = queue.pop() {
                local.push(item);
            }
            taken.lock().unwrap().extend(local);
        });

        let mut all = taken.into_inner().unwrap();
        all.sort_unstable();
        assert_eq!(all, (0..ITEMS).collect::<Vec<_>>());
    }
}
