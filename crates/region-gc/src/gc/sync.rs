//! # Lock Ordering Discipline
//!
//! Every blocking lock in the heap has a level. A thread may only acquire a
//! lock whose level is greater than or equal to the highest level it already
//! holds.
//!
//! | Level | Lock                | Held by                                   |
//! |-------|---------------------|-------------------------------------------|
//! | 1     | `CollectorCycle`    | the thread running a GC cycle             |
//! | 2     | `StopTheWorld`      | the thread that stopped the world         |
//! | 3     | `MutatorRegistry`   | attach/detach, STW and phase handshakes   |
//! | 4     | `PinnedRefill`      | threads replacing the shared pinned region|
//! | 5     | `RegionList`        | list prepend/delete/merge                 |
//! | 6     | `FreeUnits`         | unit-range allocation and release         |
//! | 6     | `PinnedFreeSlots`   | the pinned free list                      |
//!
//! Region lists share one level: only the collector holds two of them at
//! once (during merges), so no cycle between lists can form.
//!
//! ## Forbidden Patterns
//!
//! - Never stop the world while holding a region list or the free units:
//!   mutators spinning on those locks could never reach a safepoint.
//! - Never wait on the resume channel while holding any lock above.
//!
//! ## Validation
//!
//! In debug builds every acquisition goes through [`LockGuard::new`], which
//! checks the order against a thread-local stack of held levels and panics
//! on a downgrade. Release builds compile the checks away.

use std::cell::{Cell, RefCell};

const MAX_LOCK_DEPTH: usize = 16;

struct LockOrderState {
    stack: RefCell<Vec<LockOrder>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Serializes GC cycles.
    CollectorCycle = 1,
    /// Serializes stop-the-world windows.
    StopTheWorld = 2,
    /// The mutator registry reader/writer lock.
    MutatorRegistry = 3,
    /// Replacement of the shared recent-pinned region.
    PinnedRefill = 4,
    /// A region list's mutex.
    RegionList = 5,
    /// The free-unit sets.
    FreeUnits = 6,
    /// The pinned free-slot list.
    PinnedFreeSlots = 7,
}

impl LockOrder {
    /// The acquisition level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::CollectorCycle => 1,
            Self::StopTheWorld => 2,
            Self::MutatorRegistry => 3,
            Self::PinnedRefill => 4,
            Self::RegionList => 5,
            Self::FreeUnits | Self::PinnedFreeSlots => 6,
        }
    }
}

/// RAII marker recording that the current thread holds a lock of some order.
///
/// Create it immediately before locking and keep it alive as long as the
/// lock guard.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    tag: LockOrder,
}

impl LockGuard {
    /// Validates and records the acquisition of a lock tagged `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a lock of a higher level is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            let _ = LOCK_ORDER_STATE.try_with(|state| {
                if state.is_shutdown.get() {
                    return;
                }
                let mut stack = state.stack.borrow_mut();
                if let Some(highest) = stack.iter().map(|t| t.level()).max() {
                    validate_lock_order(tag, highest);
                }
                stack.push(tag);
            });
        }
        Self { tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if state.is_shutdown.get() {
                return;
            }
            let mut stack = state.stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|t| *t == self.tag) {
                stack.remove(pos);
            }
        });
    }
}

/// Disables lock order tracking for the current thread.
///
/// Called on detached threads before their thread-locals are torn down.
#[allow(clippy::missing_const_for_fn)]
pub fn enter_thread_shutdown() {
    #[cfg(debug_assertions)]
    {
        let _ = LOCK_ORDER_STATE.try_with(|state| state.is_shutdown.set(true));
    }
}

/// Number of lock levels the current thread holds (debug builds only; zero
/// in release builds).
#[must_use]
pub fn held_lock_count() -> usize {
    #[cfg(debug_assertions)]
    {
        LOCK_ORDER_STATE
            .try_with(|state| state.stack.borrow().len())
            .unwrap_or(0)
    }
    #[cfg(not(debug_assertions))]
    {
        0
    }
}

#[cfg(debug_assertions)]
fn validate_lock_order(tag: LockOrder, highest_held: u8) {
    assert!(
        tag.level() >= highest_held,
        "Lock ordering violation: {tag:?} (level {}) acquired while holding a level {highest_held} lock",
        tag.level(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_increase() {
        assert!(LockOrder::CollectorCycle.level() < LockOrder::StopTheWorld.level());
        assert!(LockOrder::MutatorRegistry.level() < LockOrder::RegionList.level());
        assert_eq!(LockOrder::FreeUnits.level(), LockOrder::PinnedFreeSlots.level());
    }

    #[test]
    fn test_increasing_acquisition() {
        let _a = LockGuard::new(LockOrder::StopTheWorld);
        let _b = LockGuard::new(LockOrder::RegionList);
        let _c = LockGuard::new(LockOrder::RegionList);
        let _d = LockGuard::new(LockOrder::FreeUnits);
        if cfg!(debug_assertions) {
            assert_eq!(held_lock_count(), 4);
        }
    }

    #[test]
    fn test_out_of_order_release() {
        let a = LockGuard::new(LockOrder::MutatorRegistry);
        let b = LockGuard::new(LockOrder::RegionList);
        drop(a);
        drop(b);
        assert_eq!(held_lock_count(), 0);
        let _c = LockGuard::new(LockOrder::CollectorCycle);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_downgrade_panics() {
        let _list = LockGuard::new(LockOrder::RegionList);
        let _registry = LockGuard::new(LockOrder::MutatorRegistry);
    }
}
