//! Per-mutator coordination state.
//!
//! A [`MutatorRecord`] is shared between its owning thread and the
//! coordinator. The state word decides who may touch the thread-local part:
//!
//! - the owner, while [`MutatorState::IN_SAFE_REGION`] is clear;
//! - the coordinator, while it has set [`MutatorState::COLLECTOR_HOLDS`] on a
//!   mutator in a safe region, or while the world is stopped.
//!
//! The owner cannot leave a safe region while `COLLECTOR_HOLDS` or
//! `SUSPEND_REQUESTED` is set, and the coordinator can only set
//! `COLLECTOR_HOLDS` on a word that has `IN_SAFE_REGION`; both transitions are
//! compare-exchanges on the same word.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::gc::phase::GcPhase;
use crate::object::ObjectRef;
use crate::region::{AllocBuffer, CopyBuffer, RegionType};

/// SATB entries buffered locally before they are flushed to the collector.
pub const SATB_BUFFER_SIZE: usize = 256;

bitflags! {
    /// Coordination bits of one mutator.
    pub struct MutatorState: u32 {
        /// The owner does not touch the heap.
        const IN_SAFE_REGION = 1 << 0;
        /// The coordinator is working on the owner's local state.
        const COLLECTOR_HOLDS = 1 << 1;
        /// The owner must park until the world restarts.
        const SUSPEND_REQUESTED = 1 << 2;
        /// The owner must adopt the global phase.
        const PHASE_REQUESTED = 1 << 3;
        /// The owner must run the pending flip callback.
        const FLIP_REQUESTED = 1 << 4;
        /// The owner is gone; the record awaits removal.
        const DETACHED = 1 << 5;
    }
}

impl MutatorState {
    /// Bits that send the owner into the safepoint slow path.
    pub const PENDING: Self = Self::from_bits_truncate(
        Self::SUSPEND_REQUESTED.bits | Self::PHASE_REQUESTED.bits | Self::FLIP_REQUESTED.bits,
    );

    /// Bits that keep the owner inside its safe region.
    pub const BLOCKING: Self =
        Self::from_bits_truncate(Self::SUSPEND_REQUESTED.bits | Self::COLLECTOR_HOLDS.bits);
}

/// Buffers owned by one mutator.
#[derive(Debug)]
pub struct MutatorLocal {
    pub(crate) alloc: AllocBuffer,
    pub(crate) copy: CopyBuffer,
    pub(crate) satb: Vec<ObjectRef>,
}

impl MutatorLocal {
    fn new() -> Self {
        Self {
            alloc: AllocBuffer::new(RegionType::ThreadLocal),
            copy: CopyBuffer::new(),
            satb: Vec::with_capacity(SATB_BUFFER_SIZE),
        }
    }

    /// The region currently used for bump allocation.
    #[must_use]
    pub const fn alloc_region(&self) -> Option<crate::region::RegionId> {
        self.alloc.region()
    }

    /// Whether the copy buffer holds no region.
    #[must_use]
    pub const fn copy_buffer_is_empty(&self) -> bool {
        self.copy.is_empty()
    }

    /// SATB entries not yet flushed.
    #[must_use]
    pub fn pending_satb(&self) -> usize {
        self.satb.len()
    }
}

/// Coordination record of one attached mutator.
pub struct MutatorRecord {
    id: u64,
    thread_name: Option<String>,
    state: AtomicU32,
    phase: AtomicU8,
    local: UnsafeCell<MutatorLocal>,
}

// SAFETY: `local` is only reached through `local_mut`, whose callers follow
// the ownership protocol described in the module docs.
unsafe impl Sync for MutatorRecord {}
// SAFETY: as above; the record holds no thread-bound data.
unsafe impl Send for MutatorRecord {}

impl std::fmt::Debug for MutatorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorRecord")
            .field("id", &self.id)
            .field("thread", &self.thread_name)
            .field("state", &self.state())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MutatorRecord {
    pub(crate) fn new(id: u64, phase: GcPhase) -> Self {
        Self {
            id,
            thread_name: std::thread::current().name().map(str::to_owned),
            state: AtomicU32::new(0),
            phase: AtomicU8::new(phase as u8),
            local: UnsafeCell::new(MutatorLocal::new()),
        }
    }

    /// Registry-unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Name of the thread that attached, if it had one.
    #[must_use]
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Current coordination bits.
    #[must_use]
    pub fn state(&self) -> MutatorState {
        MutatorState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// The phase this mutator has adopted.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Whether the owner is parked or otherwise away from the heap.
    #[must_use]
    pub fn is_in_safe_region(&self) -> bool {
        self.state().contains(MutatorState::IN_SAFE_REGION)
    }

    /// Whether the owner has detached.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.state().contains(MutatorState::DETACHED)
    }

    pub(crate) fn set_bits(&self, bits: MutatorState) -> MutatorState {
        MutatorState::from_bits_truncate(self.state.fetch_or(bits.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear_bits(&self, bits: MutatorState) -> MutatorState {
        MutatorState::from_bits_truncate(self.state.fetch_and(!bits.bits(), Ordering::AcqRel))
    }

    /// Enters a safe region. Called by the owner only.
    pub(crate) fn enter_safe_region(&self) {
        self.set_bits(MutatorState::IN_SAFE_REGION);
    }

    /// Leaves the safe region unless the coordinator holds the mutator or
    /// wants it suspended. Called by the owner only.
    pub(crate) fn try_leave_safe_region(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = MutatorState::from_bits_truncate(current);
            if state.intersects(MutatorState::BLOCKING) {
                return false;
            }
            let next = (state - MutatorState::IN_SAFE_REGION).bits();
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims the local state of a mutator sitting in a safe region.
    ///
    /// Returns `false` if the owner is running or someone else holds it.
    pub(crate) fn try_hold(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = MutatorState::from_bits_truncate(current);
            if !state.contains(MutatorState::IN_SAFE_REGION) || state.contains(MutatorState::COLLECTOR_HOLDS) {
                return false;
            }
            let next = (state | MutatorState::COLLECTOR_HOLDS).bits();
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// The thread-local buffers.
    ///
    /// # Safety
    ///
    /// The caller must be the owner outside a safe region, the coordinator
    /// holding the record, or the coordinator with the world stopped. No
    /// other reference to the buffers may be alive.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn local_mut(&self) -> &mut MutatorLocal {
        // SAFETY: exclusivity is guaranteed by the caller.
        unsafe { &mut *self.local.get() }
    }
}
