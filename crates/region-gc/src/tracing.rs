//! GC tracing support.
//!
//! Structured spans and events for collection cycles. Every cycle gets a
//! [`GcId`] that is recorded on the `gc_cycle` span and on each `gc_phase`
//! span nested inside it, so all events of one cycle can be correlated.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{span, Level};

use crate::gc::phase::GcPhase;
use crate::gc::request::{GcReason, GcType};

/// Stable identifier for a GC cycle.
///
/// Monotonically increasing, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcId(pub u64);

static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

/// Generates the next unique GC id.
pub fn next_gc_id() -> GcId {
    GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
}

/// Enters the span covering a whole cycle.
pub fn trace_gc_cycle(gc_id: GcId, reason: GcReason, gc_type: GcType) -> span::EnteredSpan {
    span!(
        Level::DEBUG,
        "gc_cycle",
        gc_id = gc_id.0,
        reason = reason.name(),
        gc_type = gc_type.name()
    )
    .entered()
}

/// Enters the span covering one phase.
pub fn trace_phase(gc_id: GcId, phase: GcPhase) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_phase", gc_id = gc_id.0, phase = phase.name()).entered()
}

/// Logs the start of a phase.
pub fn log_phase_start(phase: GcPhase, used_units: usize) {
    tracing::debug!(phase = phase.name(), used_units, "phase_start");
}

/// Logs the end of a phase.
pub fn log_phase_end(phase: GcPhase, elapsed_us: u64) {
    tracing::debug!(phase = phase.name(), elapsed_us, "phase_end");
}

/// Logs the summary of a finished cycle.
pub fn log_cycle_end(gc_id: GcId, reclaimed_regions: usize, live_bytes: usize, pause_us: u64) {
    tracing::debug!(
        gc_id = gc_id.0,
        reclaimed_regions,
        live_bytes,
        pause_us,
        "gc_cycle_end"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_ids_increase() {
        let a = next_gc_id();
        let b = next_gc_id();
        assert!(b > a);
    }
}
