//! GC metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::gc::phase::GcPhase;
use crate::gc::request::{GcReason, GcType};
use crate::tracing::GcId;

/// Statistics from one collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcMetrics {
    /// Identifier of the cycle; `None` for the default value.
    pub gc_id: Option<GcId>,
    /// Why the cycle ran.
    pub reason: Option<GcReason>,
    /// Young or full.
    pub gc_type: Option<GcType>,
    /// Wall time of the whole cycle.
    pub duration: Duration,
    /// Time mutators spent stopped.
    pub pause: Duration,
    /// Duration of root enumeration.
    pub enum_duration: Duration,
    /// Duration of concurrent marking.
    pub mark_duration: Duration,
    /// Duration of the final-mark and pre-copy pause.
    pub post_mark_duration: Duration,
    /// Duration of evacuation.
    pub copy_duration: Duration,
    /// Duration of reference fixing, sweeping and reclamation.
    pub fix_duration: Duration,
    /// Objects marked live.
    pub objects_marked: usize,
    /// Bytes marked live.
    pub bytes_marked: usize,
    /// Objects copied out of from-space.
    pub objects_copied: usize,
    /// Bytes copied out of from-space.
    pub bytes_copied: usize,
    /// Weak references cleared.
    pub weak_cleared: usize,
    /// From-space regions evacuated.
    pub regions_evacuated: usize,
    /// From-space regions kept in place.
    pub regions_exempted: usize,
    /// Garbage regions returned to the free units.
    pub regions_reclaimed: usize,
    /// Dead bytes turned into fillers in non-moving regions.
    pub bytes_swept: usize,
    /// Bytes allocated in live regions after the cycle.
    pub live_bytes: usize,
    /// Fraction of from-space candidate bytes that were dead.
    pub garbage_ratio: f64,
    /// Collections completed by this heap, including this one.
    pub total_collections: usize,
}

impl GcMetrics {
    /// Records how long `phase` took.
    pub fn record_phase(&mut self, phase: GcPhase, elapsed: Duration) {
        let slot = match phase {
            GcPhase::Enum => &mut self.enum_duration,
            GcPhase::Mark => &mut self.mark_duration,
            GcPhase::PostMark | GcPhase::PreCopy => &mut self.post_mark_duration,
            GcPhase::Copy => &mut self.copy_duration,
            GcPhase::Fix | GcPhase::Idle => &mut self.fix_duration,
        };
        *slot += elapsed;
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

/// Cumulative counters of one heap.
#[derive(Debug, Default)]
pub struct HeapStats {
    collections: AtomicUsize,
    young_collections: AtomicUsize,
    full_collections: AtomicUsize,
    bytes_copied: AtomicUsize,
    regions_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
    history: Mutex<VecDeque<GcMetrics>>,
}

impl HeapStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a finished cycle into the counters and stamps its sequence
    /// number.
    pub(crate) fn record(&self, metrics: &mut GcMetrics) {
        let total = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics.total_collections = total;
        match metrics.gc_type {
            Some(GcType::Full) => self.full_collections.fetch_add(1, Ordering::Relaxed),
            _ => self.young_collections.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_copied
            .fetch_add(metrics.bytes_copied, Ordering::Relaxed);
        self.regions_reclaimed
            .fetch_add(metrics.regions_reclaimed, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            u64::try_from(metrics.pause.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        let mut history = self.history.lock();
        if history.len() == HISTORY_SIZE {
            history.pop_front();
        }
        history.push_back(*metrics);
    }

    /// Collections completed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Young collections completed.
    #[inline]
    #[must_use]
    pub fn young_collections(&self) -> usize {
        self.young_collections.load(Ordering::Relaxed)
    }

    /// Full collections completed.
    #[inline]
    #[must_use]
    pub fn full_collections(&self) -> usize {
        self.full_collections.load(Ordering::Relaxed)
    }

    /// Bytes evacuated over all cycles.
    #[inline]
    #[must_use]
    pub fn total_bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Regions returned to the free units over all cycles.
    #[inline]
    #[must_use]
    pub fn total_regions_reclaimed(&self) -> usize {
        self.regions_reclaimed.load(Ordering::Relaxed)
    }

    /// Total stop-the-world time.
    #[inline]
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    /// Metrics of the most recent cycle.
    #[must_use]
    pub fn last(&self) -> Option<GcMetrics> {
        self.history.lock().back().copied()
    }

    /// Metrics of the most recent cycles, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<GcMetrics> {
        self.history.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_phase_buckets() {
        let mut metrics = GcMetrics::default();
        metrics.record_phase(GcPhase::PostMark, Duration::from_millis(2));
        metrics.record_phase(GcPhase::PreCopy, Duration::from_millis(3));
        metrics.record_phase(GcPhase::Copy, Duration::from_millis(1));
        assert_eq!(metrics.post_mark_duration, Duration::from_millis(5));
        assert_eq!(metrics.copy_duration, Duration::from_millis(1));
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = HeapStats::new();
        assert!(stats.last().is_none());

        for i in 0..(HISTORY_SIZE + 3) {
            let mut metrics = GcMetrics {
                gc_type: Some(if i % 2 == 0 { GcType::Young } else { GcType::Full }),
                bytes_copied: 10,
                pause: Duration::from_micros(1),
                ..GcMetrics::default()
            };
            stats.record(&mut metrics);
            assert_eq!(metrics.total_collections, i + 1);
        }

        assert_eq!(stats.total_collections(), HISTORY_SIZE + 3);
        assert_eq!(stats.young_collections() + stats.full_collections(), HISTORY_SIZE + 3);
        assert_eq!(stats.total_bytes_copied(), 10 * (HISTORY_SIZE + 3));
        assert_eq!(stats.history().len(), HISTORY_SIZE);
        assert_eq!(stats.last().map(|m| m.total_collections), Some(HISTORY_SIZE + 3));
        assert_eq!(stats.total_pause(), Duration::from_micros((HISTORY_SIZE + 3) as u64));
    }
}
