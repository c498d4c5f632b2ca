//! The mutator coordinator.
//!
//! Keeps the registry of attached mutators and drives the three handshakes
//! the collector needs:
//!
//! - [`stop_the_world`](MutatorManager::stop_the_world) parks every mutator
//!   in a safe region until the returned [`StwScope`] is dropped;
//! - [`transition_all_to_phase`](MutatorManager::transition_all_to_phase)
//!   publishes a phase that each mutator adopts at its next safepoint;
//! - [`flip`](MutatorManager::flip) runs a callback for every mutator, either
//!   on the mutator itself or on its behalf while it sits in a safe region,
//!   and waits for all of them.
//!
//! # Lock Ordering
//!
//! The stop-the-world mutex is level 2 and the registry lock level 3. Parked
//! mutators wait on the resume channel holding no lock.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::error::fatal;
use crate::gc::phase::GcPhase;
use crate::gc::sync::{LockGuard, LockOrder};

use super::record::{MutatorLocal, MutatorRecord, MutatorState};

/// One-shot work handed to every mutator by [`MutatorManager::flip`].
pub type FlipCallback = Arc<dyn Fn(&mut MutatorLocal) + Send + Sync>;

type Registry = Vec<Arc<MutatorRecord>>;

/// Registry and handshake driver for mutator threads.
pub struct MutatorManager {
    registry: RwLock<Registry>,
    pending_detach: SegQueue<u64>,
    stw: Mutex<()>,
    phase: AtomicU8,
    resume: Mutex<u64>,
    resume_cond: Condvar,
    flip: Mutex<Option<FlipCallback>>,
    next_id: AtomicU64,
    world_stopped: AtomicBool,
    soft_timeout: Duration,
    hard_retries: u32,
}

impl std::fmt::Debug for MutatorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorManager")
            .field("phase", &self.phase())
            .field("world_stopped", &self.is_world_stopped())
            .finish_non_exhaustive()
    }
}

impl MutatorManager {
    /// Creates an empty registry.
    ///
    /// A stop-the-world that waits longer than `soft_timeout` logs the
    /// mutators it is waiting for and doubles the timeout; after
    /// `hard_retries` such dumps the process aborts.
    #[must_use]
    pub fn new(soft_timeout: Duration, hard_retries: u32) -> Self {
        Self {
            registry: RwLock::new(Vec::new()),
            pending_detach: SegQueue::new(),
            stw: Mutex::new(()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            resume: Mutex::new(0),
            resume_cond: Condvar::new(),
            flip: Mutex::new(None),
            next_id: AtomicU64::new(1),
            world_stopped: AtomicBool::new(false),
            soft_timeout,
            hard_retries,
        }
    }

    /// The published global phase.
    #[must_use]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Whether a stop-the-world window is open.
    #[must_use]
    pub fn is_world_stopped(&self) -> bool {
        self.world_stopped.load(Ordering::Acquire)
    }

    /// Number of attached mutators.
    #[must_use]
    pub fn mutator_count(&self) -> usize {
        self.registry.read().iter().filter(|m| !m.is_detached()).count()
    }

    // ============ Registration ============

    /// Registers the calling thread as a mutator.
    ///
    /// Blocks while the world is stopped.
    pub fn attach(&self) -> Arc<MutatorRecord> {
        let _order = LockGuard::new(LockOrder::MutatorRegistry);
        let mut registry = self.registry.write();
        self.remove_detached(&mut registry);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(MutatorRecord::new(id, self.phase()));
        registry.push(Arc::clone(&record));
        tracing::debug!(mutator = id, thread = record.thread_name(), "mutator attached");
        record
    }

    /// Unregisters a mutator whose buffers are already retired.
    ///
    /// Never blocks: if the registry is busy the record is only flagged and
    /// removed by the next writer.
    pub fn detach(&self, record: &MutatorRecord) {
        record.enter_safe_region();
        record.set_bits(MutatorState::DETACHED);
        let _order = LockGuard::new(LockOrder::MutatorRegistry);
        if let Some(mut registry) = self.registry.try_write() {
            self.remove_detached(&mut registry);
        } else {
            self.pending_detach.push(record.id());
        }
        tracing::debug!(mutator = record.id(), "mutator detached");
    }

    fn remove_detached(&self, registry: &mut Registry) {
        let mut deferred = 0usize;
        while self.pending_detach.pop().is_some() {
            deferred += 1;
        }
        registry.retain(|m| !m.is_detached());
        if deferred > 0 {
            tracing::trace!(deferred, "deferred detaches processed");
        }
    }

    /// Calls `f` for every attached mutator under the registry read lock.
    pub fn visit_all(&self, mut f: impl FnMut(&MutatorRecord)) {
        let _order = LockGuard::new(LockOrder::MutatorRegistry);
        for record in self.registry.read().iter().filter(|m| !m.is_detached()) {
            f(record);
        }
    }

    // ============ Stop-the-world ============

    /// Parks every mutator in a safe region.
    ///
    /// Returns once all of them are parked; with no mutator attached it
    /// returns immediately. Mutators stay parked until the scope is dropped.
    /// The caller must not be an attached mutator outside a safe region.
    pub fn stop_the_world(&self) -> StwScope<'_> {
        let started = Instant::now();
        let stw_order = LockGuard::new(LockOrder::StopTheWorld);
        let stw = self.stw.lock();
        let registry_order = LockGuard::new(LockOrder::MutatorRegistry);
        let mut registry = self.registry.write();
        self.remove_detached(&mut registry);

        for record in registry.iter() {
            record.set_bits(MutatorState::SUSPEND_REQUESTED);
        }
        self.wait_for_all(&registry, "stop the world", |record| {
            record.is_in_safe_region() || record.is_detached()
        });
        self.world_stopped.store(true, Ordering::Release);
        tracing::trace!(
            mutators = registry.len(),
            sync_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "world stopped"
        );

        StwScope {
            manager: self,
            registry,
            _registry_order: registry_order,
            _stw: stw,
            _stw_order: stw_order,
            started,
        }
    }

    fn resume_all(&self, registry: &Registry) {
        for record in registry {
            record.clear_bits(MutatorState::SUSPEND_REQUESTED);
        }
        self.world_stopped.store(false, Ordering::Release);
        self.notify_resume();
    }

    fn notify_resume(&self) {
        let mut generation = self.resume.lock();
        *generation = generation.wrapping_add(1);
        self.resume_cond.notify_all();
    }

    /// Spins until `done` holds for every record, logging stuck mutators
    /// after each soft timeout.
    fn wait_for_all(&self, registry: &Registry, what: &str, mut done: impl FnMut(&MutatorRecord) -> bool) {
        let started = Instant::now();
        let mut deadline = self.soft_timeout;
        let mut dumps = 0u32;
        let backoff = Backoff::new();
        let mut pending: Vec<&Arc<MutatorRecord>> = registry.iter().collect();
        loop {
            pending.retain(|record| !done(record));
            if pending.is_empty() {
                return;
            }
            let waited = started.elapsed();
            if waited >= deadline {
                dumps += 1;
                for record in &pending {
                    tracing::warn!(
                        what,
                        mutator = record.id(),
                        thread = record.thread_name(),
                        state = ?record.state(),
                        phase = record.phase().name(),
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "mutator has not responded"
                    );
                }
                if dumps >= self.hard_retries {
                    fatal(&format!("{what}: {} mutators unresponsive after {waited:?}", pending.len()));
                }
                deadline = waited + deadline * 2;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    // ============ Phase handshakes ============

    /// Publishes `phase` without waiting.
    ///
    /// Mutators sitting in a safe region adopt it immediately; running ones
    /// adopt it at their next safepoint.
    pub fn transition_all_to_phase(&self, phase: GcPhase) {
        let _order = LockGuard::new(LockOrder::MutatorRegistry);
        let registry = self.registry.write();
        let previous = self.phase();
        if !previous.is_valid_transition(phase) {
            tracing::warn!(from = previous.name(), to = phase.name(), "unexpected phase transition");
        }
        self.phase.store(phase as u8, Ordering::Release);
        for record in registry.iter().filter(|m| !m.is_detached()) {
            if record.try_hold() {
                record.set_phase(phase);
                record.clear_bits(MutatorState::PHASE_REQUESTED | MutatorState::COLLECTOR_HOLDS);
                self.notify_resume();
            } else {
                record.set_bits(MutatorState::PHASE_REQUESTED);
            }
        }
    }

    /// Publishes `phase` and runs `callback` once for every mutator, waiting
    /// until all have run it.
    ///
    /// Mutators in a safe region are served in registry order by the caller;
    /// running mutators run the callback themselves at their next safepoint.
    pub fn flip(&self, phase: GcPhase, callback: FlipCallback) {
        let _order = LockGuard::new(LockOrder::MutatorRegistry);
        let registry = self.registry.write();
        self.phase.store(phase as u8, Ordering::Release);
        *self.flip.lock() = Some(Arc::clone(&callback));
        for record in registry.iter().filter(|m| !m.is_detached()) {
            record.set_bits(MutatorState::FLIP_REQUESTED | MutatorState::PHASE_REQUESTED);
        }

        self.wait_for_all(&registry, "flip", |record| {
            if record.is_detached() || !record.state().contains(MutatorState::FLIP_REQUESTED) {
                return true;
            }
            if !record.try_hold() {
                return false;
            }
            // SAFETY: the record is held; its owner stays in its safe region.
            callback(unsafe { record.local_mut() });
            record.set_phase(phase);
            record.clear_bits(
                MutatorState::FLIP_REQUESTED | MutatorState::PHASE_REQUESTED | MutatorState::COLLECTOR_HOLDS,
            );
            self.notify_resume();
            true
        });
        *self.flip.lock() = None;
        tracing::trace!(phase = phase.name(), mutators = registry.len(), "flip complete");
    }

    // ============ Mutator side ============

    /// Serves the requests pending on `record`. Called by its owner.
    pub(crate) fn safepoint_slow(&self, record: &MutatorRecord) {
        loop {
            let state = record.state();
            if !state.intersects(MutatorState::PENDING) {
                return;
            }
            if state.contains(MutatorState::FLIP_REQUESTED) {
                let callback = self.flip.lock().clone();
                if let Some(callback) = callback {
                    // SAFETY: the owner is outside its safe region.
                    callback(unsafe { record.local_mut() });
                }
                record.set_phase(self.phase());
                record.clear_bits(MutatorState::FLIP_REQUESTED | MutatorState::PHASE_REQUESTED);
            } else if state.contains(MutatorState::PHASE_REQUESTED) {
                record.set_phase(self.phase());
                record.clear_bits(MutatorState::PHASE_REQUESTED);
            }
            if state.contains(MutatorState::SUSPEND_REQUESTED) {
                record.enter_safe_region();
                self.leave_safe_region(record);
            }
        }
    }

    /// Leaves a safe region, parking while the coordinator needs the
    /// mutator. Pending requests are left for the caller's next safepoint.
    pub(crate) fn leave_safe_region(&self, record: &MutatorRecord) {
        while !record.try_leave_safe_region() {
            let mut generation = self.resume.lock();
            while record.state().intersects(MutatorState::BLOCKING) {
                self.resume_cond.wait(&mut generation);
            }
        }
    }
}

/// An open stop-the-world window. Dropping it restarts the mutators.
pub struct StwScope<'a> {
    manager: &'a MutatorManager,
    registry: RwLockWriteGuard<'a, Registry>,
    _registry_order: LockGuard,
    _stw: MutexGuard<'a, ()>,
    _stw_order: LockGuard,
    started: Instant,
}

impl std::fmt::Debug for StwScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StwScope")
            .field("mutators", &self.registry.len())
            .field("elapsed", &self.elapsed())
            .finish_non_exhaustive()
    }
}

impl StwScope<'_> {
    /// The parked mutators.
    #[must_use]
    pub fn mutators(&self) -> &[Arc<MutatorRecord>] {
        &self.registry
    }

    /// Time since the stop was requested.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Installs `phase` globally and on every parked mutator.
    pub fn set_phase(&self, phase: GcPhase) {
        let previous = self.manager.phase();
        if !previous.is_valid_transition(phase) {
            tracing::warn!(from = previous.name(), to = phase.name(), "unexpected phase transition");
        }
        self.manager.phase.store(phase as u8, Ordering::Release);
        for record in self.registry.iter() {
            record.set_phase(phase);
            record.clear_bits(MutatorState::PHASE_REQUESTED);
        }
    }

    /// Calls `f` with the buffers of every parked mutator.
    pub fn for_each_local(&self, mut f: impl FnMut(&MutatorRecord, &mut MutatorLocal)) {
        for record in self.registry.iter().filter(|m| !m.is_detached()) {
            // SAFETY: the world is stopped, so no owner touches its buffers.
            f(record, unsafe { record.local_mut() });
        }
    }
}

impl Drop for StwScope<'_> {
    fn drop(&mut self) {
        self.manager.resume_all(&self.registry);
        tracing::trace!(
            pause_us = u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "world resumed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn manager() -> MutatorManager {
        MutatorManager::new(Duration::from_secs(5), 6)
    }

    #[test]
    fn test_stw_without_mutators_returns() {
        let manager = manager();
        let scope = manager.stop_the_world();
        assert!(manager.is_world_stopped());
        assert!(scope.mutators().is_empty());
        drop(scope);
        assert!(!manager.is_world_stopped());
    }

    #[test]
    fn test_attach_detach() {
        let manager = manager();
        let a = manager.attach();
        let b = manager.attach();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.mutator_count(), 2);
        manager.detach(&a);
        assert_eq!(manager.mutator_count(), 1);
        let mut seen = Vec::new();
        manager.visit_all(|m| seen.push(m.id()));
        assert_eq!(seen, vec![b.id()]);
    }

    #[test]
    fn test_phase_adopted_lazily() {
        let manager = manager();
        let running = manager.attach();
        let parked = manager.attach();
        parked.enter_safe_region();

        manager.transition_all_to_phase(GcPhase::Enum);
        assert_eq!(parked.phase(), GcPhase::Enum);
        assert_eq!(running.phase(), GcPhase::Idle);
        assert!(running.state().contains(MutatorState::PHASE_REQUESTED));

        manager.safepoint_slow(&running);
        assert_eq!(running.phase(), GcPhase::Enum);
        assert!(!running.state().intersects(MutatorState::PENDING));

        manager.leave_safe_region(&parked);
        assert!(!parked.is_in_safe_region());
    }

    #[test]
    fn test_stw_parks_running_mutator() {
        let manager = manager();
        let stop = AtomicBool::new(false);
        let inside = AtomicUsize::new(0);
        let ready = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                let record = manager.attach();
                ready.wait();
                while !stop.load(Ordering::Acquire) {
                    inside.fetch_add(1, Ordering::SeqCst);
                    if record.state().intersects(MutatorState::PENDING) {
                        manager.safepoint_slow(&record);
                    }
                    std::hint::spin_loop();
                }
                manager.detach(&record);
            });

            ready.wait();
            {
                let scope = manager.stop_the_world();
                assert_eq!(scope.mutators().len(), 1);
                assert!(scope.mutators()[0].is_in_safe_region());
                let before = inside.load(Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                assert_eq!(inside.load(Ordering::SeqCst), before);
                scope.set_phase(GcPhase::Enum);
            }
            stop.store(true, Ordering::Release);
        });
        assert_eq!(manager.phase(), GcPhase::Enum);
        assert_eq!(manager.mutator_count(), 0);
    }

    #[test]
    fn test_flip_runs_for_every_mutator() {
        let manager = manager();
        let parked = manager.attach();
        parked.enter_safe_region();
        let runs = Arc::new(AtomicUsize::new(0));
        let stop = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                let record = manager.attach();
                while !stop.load(Ordering::Acquire) {
                    if record.state().intersects(MutatorState::PENDING) {
                        manager.safepoint_slow(&record);
                    }
                    std::hint::spin_loop();
                }
                manager.detach(&record);
            });
            while manager.mutator_count() < 2 {
                std::thread::yield_now();
            }

            let counter = Arc::clone(&runs);
            manager.flip(
                GcPhase::Idle,
                Arc::new(move |_local: &mut MutatorLocal| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            stop.store(true, Ordering::Release);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(parked.phase(), GcPhase::Idle);
        assert!(!parked.state().contains(MutatorState::COLLECTOR_HOLDS));
    }
}
