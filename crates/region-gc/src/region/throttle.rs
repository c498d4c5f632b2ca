//! Allocation-rate throttling.
//!
//! While a collection runs, mutators that take new regions sleep for a time
//! that grows with heap pressure. The allowed allocation rate follows
//! `cos(π/2 · live / capacity)`: close to full speed on an empty heap, zero
//! on a full one. Collector threads are never throttled.

use std::cell::Cell;
use std::f64::consts::FRAC_PI_2;
use std::time::Duration;

thread_local! {
    static IS_GC_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as a collector thread.
pub fn mark_gc_thread() {
    IS_GC_THREAD.with(|flag| flag.set(true));
}

/// Whether the current thread is a collector thread.
#[must_use]
pub fn is_gc_thread() -> bool {
    IS_GC_THREAD.with(Cell::get)
}

/// Fraction of full allocation speed allowed at `pressure`
/// (`live / capacity`, clamped to `0.0..=1.0`).
#[must_use]
pub fn allocation_rate(pressure: f64) -> f64 {
    (FRAC_PI_2 * pressure.clamp(0.0, 1.0)).cos().max(0.0)
}

/// Sleep policy for region requests.
#[derive(Debug, Clone)]
pub struct AllocationThrottle {
    enabled: bool,
    max_sleep: Duration,
    capacity: usize,
}

impl AllocationThrottle {
    /// A throttle for a heap of `capacity` bytes.
    #[must_use]
    pub const fn new(enabled: bool, max_sleep: Duration, capacity: usize) -> Self {
        Self {
            enabled,
            max_sleep,
            capacity,
        }
    }

    /// The delay owed by a non-collector thread taking a region while a
    /// collection runs, given the bytes live after the previous cycle.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay(&self, live_after_gc: usize) -> Duration {
        if !self.enabled || self.capacity == 0 {
            return Duration::ZERO;
        }
        let pressure = live_after_gc as f64 / self.capacity as f64;
        self.max_sleep.mul_f64(1.0 - allocation_rate(pressure))
    }
}
