//! Heap configuration.

use std::time::Duration;

use crate::error::HeapError;

/// Default bytes per heap unit.
pub const DEFAULT_UNIT_SIZE: usize = 256 * 1024;
/// Default reserved heap size.
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024 * 1024;
/// Smallest unit size accepted by [`HeapConfig::validate`].
pub const MIN_UNIT_SIZE: usize = 256;

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Tunables for a [`Heap`](crate::Heap).
///
/// Every field is public; the `with_*` setters allow chained construction.
/// [`Heap::new`](crate::Heap::new) calls [`validate`](Self::validate) before
/// reserving memory.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Bytes per unit. Power of two, at least [`MIN_UNIT_SIZE`].
    pub unit_size: usize,
    /// Reserved heap bytes. Rounded down to a whole number of units.
    pub heap_size: usize,
    /// Objects larger than this are placed in dedicated large regions.
    pub large_object_threshold: usize,
    /// Worker threads used by the parallel mark, copy and fix phases.
    pub gc_workers: usize,
    /// From-regions whose live ratio reaches this value are not evacuated.
    pub exempt_live_ratio: f64,
    /// Fraction of used units at which an asynchronous collection is requested.
    pub gc_trigger_ratio: f64,
    /// Fraction of old-space units above which heuristic collections are full.
    pub full_gc_old_ratio: f64,
    /// Reclaimed regions spanning at least this many units are decommitted.
    pub huge_page_release_units: usize,
    /// Units of garbage regions kept around for exact-size reuse.
    pub garbage_cache_units: usize,
    /// Wait before the first stop-the-world diagnostic dump. Doubles each dump.
    pub stw_soft_timeout: Duration,
    /// Diagnostic dumps after which a stuck stop-the-world aborts.
    pub stw_hard_retries: u32,
    /// Slow down allocating mutators while a collection runs.
    pub throttle: bool,
    /// Upper bound for one throttle sleep.
    pub throttle_max_sleep: Duration,
    /// Run heap verification after every Fix phase.
    pub verify: bool,
    /// Spawn the collector daemon thread when the heap is created.
    pub collector_thread: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            unit_size: DEFAULT_UNIT_SIZE,
            heap_size: DEFAULT_HEAP_SIZE,
            large_object_threshold: DEFAULT_UNIT_SIZE / 4,
            gc_workers: workers.min(4),
            exempt_live_ratio: 0.8,
            gc_trigger_ratio: 0.75,
            full_gc_old_ratio: 0.5,
            huge_page_release_units: (HUGE_PAGE_SIZE / DEFAULT_UNIT_SIZE).max(1),
            garbage_cache_units: 16,
            stw_soft_timeout: Duration::from_secs(2),
            stw_hard_retries: 6,
            throttle: true,
            throttle_max_sleep: Duration::from_millis(5),
            verify: cfg!(debug_assertions),
            collector_thread: true,
        }
    }
}

impl HeapConfig {
    /// Sets the unit size and rescales the unit-derived defaults.
    #[must_use]
    pub fn with_unit_size(mut self, unit_size: usize) -> Self {
        self.unit_size = unit_size;
        self.large_object_threshold = unit_size / 4;
        self.huge_page_release_units = (HUGE_PAGE_SIZE / unit_size.max(1)).max(1);
        self
    }

    /// Sets the reserved heap size in bytes.
    #[must_use]
    pub const fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.heap_size = heap_size;
        self
    }

    /// Sets the large-object threshold in bytes.
    #[must_use]
    pub const fn with_large_object_threshold(mut self, threshold: usize) -> Self {
        self.large_object_threshold = threshold;
        self
    }

    /// Sets the number of collector worker threads.
    #[must_use]
    pub const fn with_gc_workers(mut self, workers: usize) -> Self {
        self.gc_workers = workers;
        self
    }

    /// Sets the live ratio at which from-regions are exempted from copying.
    #[must_use]
    pub const fn with_exempt_live_ratio(mut self, ratio: f64) -> Self {
        self.exempt_live_ratio = ratio;
        self
    }

    /// Sets the used-unit fraction that triggers a heuristic collection.
    #[must_use]
    pub const fn with_gc_trigger_ratio(mut self, ratio: f64) -> Self {
        self.gc_trigger_ratio = ratio;
        self
    }

    /// Sets the number of garbage-region units cached for reuse.
    #[must_use]
    pub const fn with_garbage_cache_units(mut self, units: usize) -> Self {
        self.garbage_cache_units = units;
        self
    }

    /// Sets the unit count at which reclaimed regions are decommitted.
    #[must_use]
    pub const fn with_huge_page_release_units(mut self, units: usize) -> Self {
        self.huge_page_release_units = units;
        self
    }

    /// Sets the stop-the-world soft timeout.
    #[must_use]
    pub const fn with_stw_soft_timeout(mut self, timeout: Duration) -> Self {
        self.stw_soft_timeout = timeout;
        self
    }

    /// Enables or disables allocation throttling.
    #[must_use]
    pub const fn with_throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    /// Enables or disables post-Fix heap verification.
    #[must_use]
    pub const fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Enables or disables the collector daemon thread.
    #[must_use]
    pub const fn with_collector_thread(mut self, enabled: bool) -> Self {
        self.collector_thread = enabled;
        self
    }

    /// Number of units in the reserved range.
    #[must_use]
    pub const fn unit_count(&self) -> usize {
        if self.unit_size == 0 {
            0
        } else {
            self.heap_size / self.unit_size
        }
    }

    /// Effective worker count, never zero.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.gc_workers.max(1)
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidConfig`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), HeapError> {
        let invalid = |msg: String| Err(HeapError::InvalidConfig(msg));

        if !self.unit_size.is_power_of_two() || self.unit_size < MIN_UNIT_SIZE {
            return invalid(format!(
                "unit_size {} must be a power of two >= {MIN_UNIT_SIZE}",
                self.unit_size
            ));
        }
        if self.unit_count() == 0 {
            return invalid(format!(
                "heap_size {} holds no {}-byte unit",
                self.heap_size, self.unit_size
            ));
        }
        if u32::try_from(self.unit_count()).is_err() {
            return invalid(format!("{} units exceed the region table", self.unit_count()));
        }
        if self.large_object_threshold == 0 || self.large_object_threshold > self.unit_size {
            return invalid(format!(
                "large_object_threshold {} must be in 1..={}",
                self.large_object_threshold, self.unit_size
            ));
        }
        for (name, ratio) in [
            ("exempt_live_ratio", self.exempt_live_ratio),
            ("gc_trigger_ratio", self.gc_trigger_ratio),
            ("full_gc_old_ratio", self.full_gc_old_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return invalid(format!("{name} {ratio} must be within 0.0..=1.0"));
            }
        }
        if self.huge_page_release_units == 0 {
            return invalid("huge_page_release_units must be non-zero".to_owned());
        }
        if self.stw_soft_timeout.is_zero() {
            return invalid("stw_soft_timeout must be non-zero".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = HeapConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.unit_count(), 1024);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_with_unit_size_rescales() {
        let config = HeapConfig::default()
            .with_unit_size(256)
            .with_heap_size(256 * 1000);
        assert_eq!(config.unit_count(), 1000);
        assert_eq!(config.large_object_threshold, 64);
        assert_eq!(config.huge_page_release_units, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_unit() {
        let config = HeapConfig::default().with_unit_size(3000);
        assert!(matches!(config.validate(), Err(HeapError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_heap() {
        let config = HeapConfig::default().with_heap_size(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_large_threshold() {
        let config = HeapConfig::default()
            .with_unit_size(1024)
            .with_large_object_threshold(4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let config = HeapConfig::default().with_exempt_live_ratio(1.5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exempt_live_ratio"));
    }
}
