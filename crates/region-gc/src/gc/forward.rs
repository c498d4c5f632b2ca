//! Object forwarding.
//!
//! An object is copied by exactly one thread: the one whose compare-exchange
//! moves its state word from `Normal` to `Forwarding`. Every other thread
//! spins until the winner publishes `Forwarded` and then reads the copy's
//! address from the state word. The table itself only routes copies into
//! the caller's [`CopyBuffer`].

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::error::fatal;
use crate::model::ObjectModel;
use crate::object::{ForwardState, ObjectRef, StateCell, MIN_OBJECT_SIZE};
use crate::region::{CopyBuffer, RegionDesc, RegionFlags, RegionManager, RegionType};

/// Routes copies into to-space and counts them.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    objects_copied: AtomicUsize,
    bytes_copied: AtomicUsize,
}

impl ForwardingTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects_copied: AtomicUsize::new(0),
            bytes_copied: AtomicUsize::new(0),
        }
    }

    /// Objects copied since the last [`reset`](Self::reset).
    #[must_use]
    pub fn objects_copied(&self) -> usize {
        self.objects_copied.load(Ordering::Relaxed)
    }

    /// Bytes copied since the last [`reset`](Self::reset).
    #[must_use]
    pub fn bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Zeroes the counters at the start of a cycle.
    pub fn reset(&self) {
        self.objects_copied.store(0, Ordering::Relaxed);
        self.bytes_copied.store(0, Ordering::Relaxed);
    }

    /// Reserves `size` bytes for the copy of an object living in `from`.
    ///
    /// Objects from survivor regions are promoted to old space; others go to
    /// to-space. Returns `None` when no region is left.
    pub fn route_object(
        &self,
        manager: &RegionManager,
        buffer: &mut CopyBuffer,
        from: &RegionDesc,
        size: usize,
    ) -> Option<usize> {
        let target = buffer.target(from.has_flag(RegionFlags::SURVIVOR));
        loop {
            if let Some(address) = target.try_allocate(manager.table(), size) {
                return Some(address);
            }
            if let Some(full) = target.take() {
                seal_copy_region(manager.region(full));
            }
            let id = manager.take_copy_region(target.region_type())?;
            tracing::trace!(region = id.0, region_type = target.region_type().name(), "copy region installed");
            target.install(id);
        }
    }

    /// The copy of `obj` if it has been forwarded, waiting out a copy in
    /// progress. `None` if the object has not been forwarded.
    #[must_use]
    pub fn get_forwarding_pointer(&self, obj: ObjectRef) -> Option<ObjectRef> {
        // SAFETY: callers pass objects of live regions.
        let state = unsafe { obj.state() };
        let backoff = Backoff::new();
        loop {
            let word = state.load();
            match word.forward_state() {
                ForwardState::Forwarded => return word.forwarding_address().and_then(ObjectRef::from_address),
                ForwardState::Forwarding => backoff.snooze(),
                ForwardState::Normal | ForwardState::ToVersion => return None,
            }
        }
    }

    /// Copies `obj` out of from-space unless another thread already did, and
    /// returns the copy.
    ///
    /// Running out of regions here is fatal: a half-evacuated object cannot
    /// be backed out.
    pub fn forward(
        &self,
        manager: &RegionManager,
        model: &dyn ObjectModel,
        buffer: &mut CopyBuffer,
        obj: ObjectRef,
    ) -> ObjectRef {
        // SAFETY: `obj` is in a from-space region, which stays mapped until
        // the cycle reclaims it.
        let state = unsafe { obj.state() };
        let backoff = Backoff::new();
        loop {
            let word = state.load();
            match word.forward_state() {
                ForwardState::Forwarded => {
                    return word
                        .forwarding_address()
                        .and_then(ObjectRef::from_address)
                        .unwrap_or_else(|| fatal("forwarded object without a copy"));
                }
                ForwardState::Forwarding => {
                    backoff.snooze();
                    continue;
                }
                ForwardState::ToVersion => {
                    fatal(&format!("from-space object {:#x} is a to-space version", obj.address()));
                }
                ForwardState::Normal => {}
            }

            if state
                .compare_exchange(word, word.with_forward_state(ForwardState::Forwarding))
                .is_err()
            {
                continue;
            }

            let size = model.object_size(obj);
            let from = manager
                .table()
                .region_of_object(obj)
                .unwrap_or_else(|| fatal("forwarding an object outside the heap"));
            let Some(address) = self.route_object(manager, buffer, from, size) else {
                fatal(&format!("out of memory while copying {size} bytes"));
            };

            // SAFETY: `address` is fresh space owned by `buffer`; the source
            // is frozen by the Forwarding state.
            unsafe {
                let copy_state = &*(address as *const StateCell);
                copy_state.store(word.with_forward_state(ForwardState::ToVersion));
                std::ptr::copy_nonoverlapping(
                    (obj.address() + MIN_OBJECT_SIZE) as *const u8,
                    (address + MIN_OBJECT_SIZE) as *mut u8,
                    size - MIN_OBJECT_SIZE,
                );
                copy_state.store(word);
            }
            let copy = ObjectRef::from_address(address).unwrap_or_else(|| fatal("null copy address"));
            model.object_moved(obj, copy);
            state.store(word.forwarded_to(address));

            self.objects_copied.fetch_add(1, Ordering::Relaxed);
            self.bytes_copied.fetch_add(size, Ordering::Relaxed);
            return copy;
        }
    }

    /// Resolves `obj` to its current location: its copy if it lives in
    /// from-space, else itself.
    pub fn resolve(
        &self,
        manager: &RegionManager,
        model: &dyn ObjectModel,
        buffer: &mut CopyBuffer,
        obj: ObjectRef,
    ) -> ObjectRef {
        match manager.table().region_of_object(obj) {
            Some(region) if region.region_type() == RegionType::From => self.forward(manager, model, buffer, obj),
            _ => obj,
        }
    }

    /// Retires both regions of `buffer` so the fix phase walks their copies.
    pub fn retire(manager: &RegionManager, buffer: &mut CopyBuffer) {
        for target in [&mut buffer.to, &mut buffer.old] {
            if let Some(id) = target.take() {
                seal_copy_region(manager.region(id));
            }
        }
    }
}

fn seal_copy_region(region: &RegionDesc) {
    region.set_copy_line(region.alloc_ptr());
}
