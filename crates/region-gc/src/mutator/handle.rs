//! The per-thread mutator handle.
//!
//! A [`Mutator`] is the only way a thread touches the heap. It owns the
//! thread's allocation, copy and SATB buffers and runs the barriers:
//!
//! - the SATB pre-write barrier while the mutator's phase is marking;
//! - the forwarding read barrier while the phase is `PreCopy`, `Copy` or `Fix`;
//! - the card-marking post-write barrier always.
//!
//! Object references held in locals are only valid until the next safepoint.
//! Anything that must survive one has to be reachable from a root.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::HeapError;
use crate::gc::request::{GcReason, GcRequest, GcType};
use crate::heap::{Heap, HeapInner};
use crate::metrics::GcMetrics;
use crate::object::{aligned_size, initialize_object, ObjectHeader, ObjectRef, RefField, RefValue, MIN_OBJECT_SIZE};
use crate::region::RegionType;

use super::record::{MutatorRecord, MutatorState, SATB_BUFFER_SIZE};

/// A thread attached to a [`Heap`].
///
/// `!Send`: the handle must be dropped on the thread that created it.
pub struct Mutator<'heap> {
    heap: &'heap Heap,
    record: Arc<MutatorRecord>,
    in_safe_region: Cell<bool>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for Mutator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("record", &self.record)
            .field("in_safe_region", &self.in_safe_region.get())
            .finish_non_exhaustive()
    }
}

impl<'heap> Mutator<'heap> {
    pub(crate) fn new(heap: &'heap Heap) -> Self {
        let record = heap.inner().mutators.attach();
        Self {
            heap,
            record,
            in_safe_region: Cell::new(false),
            _not_send: PhantomData,
        }
    }

    fn inner(&self) -> &'heap HeapInner {
        self.heap.inner()
    }

    /// Registry id of this mutator.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id()
    }

    /// The coordination record shared with the collector.
    #[must_use]
    pub fn record(&self) -> &MutatorRecord {
        &self.record
    }

    // ============ Safepoints ============

    /// Serves pending collector requests.
    ///
    /// Must be called regularly; a mutator that never polls stalls every
    /// stop-the-world until the hard timeout aborts the process.
    #[inline]
    pub fn safepoint(&self) {
        if self.in_safe_region.get() {
            return;
        }
        if self.record.state().intersects(MutatorState::PENDING) {
            self.inner().mutators.safepoint_slow(&self.record);
        }
    }

    /// Announces that this thread stops touching the heap, e.g. before a
    /// blocking call. The collector may work on the thread's buffers until
    /// [`leave_safe_region`](Self::leave_safe_region).
    pub fn enter_safe_region(&self) {
        if self.in_safe_region.replace(true) {
            return;
        }
        self.record.enter_safe_region();
    }

    /// Returns to the heap, waiting while the world is stopped or the
    /// collector holds this mutator.
    pub fn leave_safe_region(&self) {
        if !self.in_safe_region.replace(false) {
            return;
        }
        self.inner().mutators.leave_safe_region(&self.record);
        self.safepoint();
    }

    /// Runs `f` inside a safe region.
    pub fn safe_region<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_safe_region();
        let result = f();
        self.leave_safe_region();
        result
    }

    // ============ Allocation ============

    /// Allocates an object of `size` bytes with `header` as its class word.
    ///
    /// Objects above the large-object threshold get their own region. The
    /// body is zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfMemory`] if no region is left after a
    /// synchronous full collection.
    pub fn allocate(&self, header: ObjectHeader, size: usize) -> Result<ObjectRef, HeapError> {
        let size = aligned_size(size).max(MIN_OBJECT_SIZE);
        let regions = &self.inner().regions;
        if size > regions.large_object_threshold() {
            return self.allocate_large(header, size);
        }
        {
            // SAFETY: the owner is outside its safe region.
            let local = unsafe { self.record.local_mut() };
            if let Some(address) = local.alloc.try_allocate(regions.table(), size) {
                return Ok(self.finish_allocation(address, size, header));
            }
        }
        self.allocate_slow(header, size)
    }

    #[cold]
    fn allocate_slow(&self, header: ObjectHeader, size: usize) -> Result<ObjectRef, HeapError> {
        self.safepoint();
        let regions = &self.inner().regions;
        let delay = regions.request_for_region();
        if !delay.is_zero() {
            tracing::debug!(
                mutator = self.id(),
                delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX),
                "allocation throttled"
            );
            self.safe_region(|| std::thread::sleep(delay));
        }

        let mut collected = false;
        loop {
            {
                // SAFETY: the owner is outside its safe region.
                let local = unsafe { self.record.local_mut() };
                if let Some(full) = local.alloc.take() {
                    regions.retire_region(full, RegionType::RecentFull);
                }
                if let Some(id) = regions.take_thread_local_region(true) {
                    local.alloc.install(id);
                    let address = local
                        .alloc
                        .try_allocate(regions.table(), size)
                        .ok_or(HeapError::OutOfMemory { requested: size })?;
                    return Ok(self.finish_allocation(address, size, header));
                }
            }
            if collected {
                tracing::warn!(mutator = self.id(), size, "allocation failed after gc");
                return Err(HeapError::OutOfMemory { requested: size });
            }
            self.collect_for_allocation()?;
            collected = true;
        }
    }

    fn finish_allocation(&self, address: usize, size: usize, header: ObjectHeader) -> ObjectRef {
        self.inner().regions.record_allocation(size);
        // SAFETY: the bump handed `[address, address + size)` to this thread.
        unsafe { initialize_object(address, size, header) }
    }

    /// Allocates an object in a region of its own.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfMemory`] if no run of units is left after a
    /// synchronous full collection.
    pub fn allocate_large(&self, header: ObjectHeader, size: usize) -> Result<ObjectRef, HeapError> {
        let size = aligned_size(size).max(MIN_OBJECT_SIZE);
        self.retry_after_gc(size, || self.inner().regions.allocate_large(size, header, true))
    }

    /// Allocates an object that is never moved.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfMemory`] if no pinned space is left after a
    /// synchronous full collection.
    pub fn allocate_pinned(&self, header: ObjectHeader, size: usize) -> Result<ObjectRef, HeapError> {
        let size = aligned_size(size).max(MIN_OBJECT_SIZE);
        if size > self.inner().regions.unit_size() {
            return Err(HeapError::OutOfMemory { requested: size });
        }
        self.retry_after_gc(size, || self.inner().regions.allocate_pinned(size, header, true))
    }

    fn retry_after_gc(&self, size: usize, mut attempt: impl FnMut() -> Option<ObjectRef>) -> Result<ObjectRef, HeapError> {
        self.safepoint();
        if let Some(obj) = attempt() {
            return Ok(obj);
        }
        self.collect_for_allocation()?;
        attempt().ok_or(HeapError::OutOfMemory { requested: size })
    }

    fn collect_for_allocation(&self) -> Result<(), HeapError> {
        tracing::debug!(mutator = self.id(), "allocation failed, collecting");
        self.safe_region(|| self.heap.collect_sync(GcRequest::new(GcReason::OutOfMemory, GcType::Full)))?;
        Ok(())
    }

    // ============ Barriers ============

    /// Loads the reference at `offset` in `holder`.
    ///
    /// While objects are being evacuated a target still in from-space is
    /// copied (or its copy looked up) and the field is healed.
    ///
    /// # Safety
    ///
    /// `holder` must be a live object reachable by this mutator and `offset`
    /// one of its reference slots.
    pub unsafe fn load_ref(&self, holder: ObjectRef, offset: usize) -> Option<ObjectRef> {
        let phase = self.record.phase();
        let holder = if phase.needs_read_barrier() {
            self.resolve(holder)
        } else {
            holder
        };
        // SAFETY: forwarded to the caller.
        let field = unsafe { holder.field(offset) };
        let value = field.load();
        let target = value.target()?;
        if phase.needs_read_barrier() {
            return self.heal(holder, field, value, target);
        }
        if value.is_weak() && phase.is_marking() {
            // A weak load makes the target strongly reachable again.
            self.satb_enqueue(target);
        }
        Some(target)
    }

    fn heal(&self, holder: ObjectRef, field: &RefField, value: RefValue, target: ObjectRef) -> Option<ObjectRef> {
        let regions = &self.inner().regions;
        let Some(region) = regions.table().region_of_object(target) else {
            return Some(target);
        };
        if region.region_type() != RegionType::From {
            return Some(target);
        }
        if !region.is_live(target) {
            // Only weak fields of untraced objects can still name the dead.
            // Losing the CAS is fine: a racing store already replaced it.
            let _ = field.update(value, RefValue::NULL);
            return None;
        }
        let copy = self.forward(target);
        if field.update(value, value.with_target(copy)).is_settled() {
            self.remember(holder, field, copy);
        }
        Some(copy)
    }

    /// Stores `value` into the reference slot at `offset` in `holder`.
    ///
    /// # Safety
    ///
    /// As for [`load_ref`](Self::load_ref); `value` must be live.
    pub unsafe fn store_ref(&self, holder: ObjectRef, offset: usize, value: Option<ObjectRef>, weak: bool) {
        let phase = self.record.phase();
        let (holder, value) = if phase.needs_read_barrier() {
            (self.resolve(holder), value.map(|v| self.resolve(v)))
        } else {
            (holder, value)
        };
        let new = match value {
            Some(target) if weak => RefValue::weak(target),
            other => RefValue::from_option(other),
        };
        // SAFETY: forwarded to the caller.
        let field = unsafe { holder.field(offset) };
        let mut current = field.load();
        loop {
            if phase.is_marking() {
                if let Some(old) = current.target() {
                    self.satb_enqueue(old);
                }
            }
            match field.compare_exchange(current, new) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if let Some(target) = value {
            self.remember(holder, field, target);
        }
    }

    /// Initializing store into an object this mutator has just allocated and
    /// not yet published. Skips the SATB barrier.
    ///
    /// # Safety
    ///
    /// As for [`store_ref`](Self::store_ref); `holder` must not be visible to
    /// any other thread yet.
    pub unsafe fn init_ref(&self, holder: ObjectRef, offset: usize, value: Option<ObjectRef>, weak: bool) {
        let value = if self.record.phase().needs_read_barrier() {
            value.map(|v| self.resolve(v))
        } else {
            value
        };
        let new = match value {
            Some(target) if weak => RefValue::weak(target),
            other => RefValue::from_option(other),
        };
        // SAFETY: forwarded to the caller.
        let field = unsafe { holder.field(offset) };
        field.store(new);
        if let Some(target) = value {
            self.remember(holder, field, target);
        }
    }

    /// Marks the holder's card if an old-space slot now names a young object.
    fn remember(&self, holder: ObjectRef, field: &RefField, target: ObjectRef) {
        let table = self.inner().regions.table();
        let (Some(holder_region), Some(target_region)) =
            (table.region_of_object(holder), table.region_of_object(target))
        else {
            return;
        };
        if holder_region.region_type().needs_remembered_set() && target_region.region_type().is_young_space() {
            // Pairs with the fence after the fixer clears the card.
            fence(Ordering::SeqCst);
            holder_region.mark_card(field.address());
        }
    }

    fn satb_enqueue(&self, obj: ObjectRef) {
        // SAFETY: barriers run outside the safe region.
        let local = unsafe { self.record.local_mut() };
        local.satb.push(obj);
        if local.satb.len() >= SATB_BUFFER_SIZE {
            self.inner().collector.push_satb(local.satb.drain(..));
        }
    }

    fn forward(&self, obj: ObjectRef) -> ObjectRef {
        let inner = self.inner();
        // SAFETY: barriers run outside the safe region.
        let local = unsafe { self.record.local_mut() };
        inner
            .collector
            .forwarding()
            .forward(&inner.regions, inner.model.as_ref(), &mut local.copy, obj)
    }

    /// The current location of `obj`: its copy if it has been evacuated.
    #[must_use]
    pub fn resolve(&self, obj: ObjectRef) -> ObjectRef {
        if !self.record.phase().needs_read_barrier() {
            return obj;
        }
        let inner = self.inner();
        // SAFETY: called by the owner outside its safe region.
        let local = unsafe { self.record.local_mut() };
        inner
            .collector
            .forwarding()
            .resolve(&inner.regions, inner.model.as_ref(), &mut local.copy, obj)
    }

    // ============ Raw pointers ============

    /// Pins `obj`'s region so the object does not move while native code
    /// holds its address. Returns the address to use.
    pub fn acquire_raw_pointer(&self, obj: ObjectRef) -> ObjectRef {
        let obj = self.resolve(obj);
        self.inner().regions.acquire_raw_pointer(obj);
        obj
    }

    /// Releases a pin taken by [`acquire_raw_pointer`](Self::acquire_raw_pointer).
    pub fn release_raw_pointer(&self, obj: ObjectRef) {
        self.inner().regions.release_raw_pointer(obj);
    }

    // ============ Collection ============

    /// Requests a collection from inside a safe region.
    ///
    /// Synchronous requests return the metrics of the cycle that served them.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::CollectorStopped`] if the daemon is gone.
    pub fn request_gc(
        &self,
        reason: GcReason,
        asynchronous: bool,
        gc_type: GcType,
    ) -> Result<Option<GcMetrics>, HeapError> {
        self.safe_region(|| self.heap.request_gc(reason, asynchronous, gc_type))
    }

    /// Retires this thread's buffers. Called on drop.
    fn retire_buffers(&self) {
        let inner = self.inner();
        // SAFETY: the owner is outside its safe region.
        let local = unsafe { self.record.local_mut() };
        if let Some(id) = local.alloc.take() {
            inner.regions.retire_region(id, RegionType::RecentFull);
        }
        crate::gc::forward::ForwardingTable::retire(&inner.regions, &mut local.copy);
        if !local.satb.is_empty() {
            inner.collector.push_satb(local.satb.drain(..));
        }
    }
}

impl Drop for Mutator<'_> {
    fn drop(&mut self) {
        self.leave_safe_region();
        self.safepoint();
        self.retire_buffers();
        self.inner().mutators.detach(&self.record);
    }
}
