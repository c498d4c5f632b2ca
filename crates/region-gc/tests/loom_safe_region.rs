//! Loom model of the mutator state-word protocol.
//!
//! The owner may touch its local buffers only outside a safe region; the
//! coordinator only after setting `COLLECTOR_HOLDS` on a mutator that is in
//! one. Both sides move through compare-exchanges on a single word, so the
//! model checks that their accesses to the buffers never overlap.

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU32, Ordering};
use loom::sync::Arc;

const IN_SAFE_REGION: u32 = 1 << 0;
const COLLECTOR_HOLDS: u32 = 1 << 1;

struct Record {
    state: AtomicU32,
    local: UnsafeCell<u32>,
}

impl Record {
    fn new(state: u32) -> Self {
        Self {
            state: AtomicU32::new(state),
            local: UnsafeCell::new(0),
        }
    }

    fn try_leave(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & COLLECTOR_HOLDS != 0 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                current & !IN_SAFE_REGION,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_hold(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & IN_SAFE_REGION == 0 || current & COLLECTOR_HOLDS != 0 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                current | COLLECTOR_HOLDS,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.state.fetch_and(!COLLECTOR_HOLDS, Ordering::Release);
    }
}

/// The owner leaving its safe region and the coordinator taking hold of it
/// never both succeed without ordering their buffer accesses.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\""]
fn test_leave_and_hold_exclude_each_other() {
    loom::model(|| {
        let record = Arc::new(Record::new(IN_SAFE_REGION));

        let owner = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || {
                while !record.try_leave() {
                    loom::thread::yield_now();
                }
                record.local.with_mut(|local| unsafe { *local += 1 });
            }
        });

        if record.try_hold() {
            record.local.with_mut(|local| unsafe { *local += 10 });
            record.release();
        }

        owner.join().unwrap();
        let value = record.local.with(|local| unsafe { *local });
        assert!(value == 1 || value == 11);
    });
}

/// A hold on a running mutator is always refused.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\""]
fn test_hold_refused_outside_safe_region() {
    loom::model(|| {
        let record = Arc::new(Record::new(0));

        let owner = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || record.local.with_mut(|local| unsafe { *local += 1 })
        });

        assert!(!record.try_hold());
        owner.join().unwrap();
        assert_eq!(record.local.with(|local| unsafe { *local }), 1);
    });
}

/// The owner re-entering its safe region publishes its buffer writes to a
/// coordinator that takes hold afterwards.
#[test]
#[ignore = "loom test - run with RUSTFLAGS=\"--cfg loom\""]
fn test_enter_publishes_local_writes() {
    loom::model(|| {
        let record = Arc::new(Record::new(0));

        let owner = loom::thread::spawn({
            let record = Arc::clone(&record);
            move || {
                record.local.with_mut(|local| unsafe { *local = 7 });
                record.state.fetch_or(IN_SAFE_REGION, Ordering::Release);
            }
        });

        if record.try_hold() {
            assert_eq!(record.local.with(|local| unsafe { *local }), 7);
            record.release();
        }
        owner.join().unwrap();
    });
}
