//! Free unit bookkeeping.
//!
//! Units that belong to no region are tracked as coalesced runs in two sets:
//! dirty runs (previously used, contents undefined) and released runs
//! (decommitted, zero on next touch). Units past the inactive-zone
//! watermark read as zero: they were never handed out, or were released
//! back into the zone.
//!
//! The two sets only describe contents. Allocation sees the free space as
//! maximal spans that may cross from one set to the other and run on into
//! the inactive zone.

use std::collections::BTreeMap;

/// A set of disjoint unit runs, coalesced on insertion.
#[derive(Debug, Default, Clone)]
pub struct UnitRangeSet {
    runs: BTreeMap<u32, u32>,
    units: usize,
}

impl UnitRangeSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            runs: BTreeMap::new(),
            units: 0,
        }
    }

    /// Total units in the set.
    #[must_use]
    pub const fn units(&self) -> usize {
        self.units
    }

    /// Number of disjoint runs.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Adds `[start, start + len)`, merging with adjacent runs.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the range overlaps an existing run.
    pub fn insert(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let added = len as usize;
        let mut start = start;
        let mut len = len;

        if let Some((&prev_start, &prev_len)) = self.runs.range(..start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "overlapping unit run");
            if prev_start + prev_len == start {
                self.runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.runs.get(&(start + len)) {
            self.runs.remove(&(start + len));
            len += next_len;
        }
        debug_assert!(
            self.runs.range(start..start + len).next().is_none(),
            "overlapping unit run"
        );
        self.runs.insert(start, len);
        self.units += added;
    }

    /// Removes every unit of `[start, end)` held by the set and returns the
    /// removed pieces in address order. Runs straddling either bound are
    /// split.
    pub fn remove_range(&mut self, start: u32, end: u32) -> Vec<(u32, u32)> {
        let first = self
            .runs
            .range(..start)
            .next_back()
            .filter(|&(&run_start, &run_len)| run_start + run_len > start)
            .map_or(start, |(&run_start, _)| run_start);
        let overlapping: Vec<(u32, u32)> = self.runs.range(first..end).map(|(s, l)| (*s, *l)).collect();

        let mut removed = Vec::with_capacity(overlapping.len());
        for (run_start, run_len) in overlapping {
            let run_end = run_start + run_len;
            let cut_start = run_start.max(start);
            let cut_end = run_end.min(end);
            self.runs.remove(&run_start);
            if run_start < cut_start {
                self.runs.insert(run_start, cut_start - run_start);
            }
            if cut_end < run_end {
                self.runs.insert(cut_end, run_end - cut_end);
            }
            self.units -= (cut_end - cut_start) as usize;
            removed.push((cut_start, cut_end - cut_start));
        }
        removed
    }

    /// Removes and returns the run ending exactly at `end`, if any.
    fn pop_run_ending_at(&mut self, end: u32) -> Option<(u32, u32)> {
        let (&start, &len) = self.runs.range(..end).next_back()?;
        if start + len != end {
            return None;
        }
        self.runs.remove(&start);
        self.units -= len as usize;
        Some((start, len))
    }

    /// Length of the largest run.
    #[must_use]
    pub fn largest_run(&self) -> u32 {
        self.runs.values().copied().max().unwrap_or(0)
    }

    /// Iterates `(start, len)` runs in address order.
    pub fn runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.runs.iter().map(|(s, l)| (*s, *l))
    }
}

/// What a freshly taken unit range was made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSource {
    /// At least one unit was previously used and may hold stale bytes.
    Dirty,
    /// Some units were decommitted and none are dirty; reads as zero.
    Released,
    /// Only inactive-zone units; reads as zero.
    Inactive,
}

impl UnitSource {
    /// Whether every unit is known to be zero.
    #[must_use]
    pub const fn is_zeroed(self) -> bool {
        !matches!(self, Self::Dirty)
    }
}

/// A unit range removed from the free space by [`FreeUnits::take`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakenUnits {
    /// First unit of the range.
    pub start: u32,
    /// Units in the range.
    pub len: u32,
    /// The dirtiest kind of unit in the range.
    pub source: UnitSource,
    /// The dirty sub-runs, which are the only parts that need zeroing.
    pub dirty: Vec<(u32, u32)>,
}

/// A maximal run of free units, regardless of which set holds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpan {
    /// First unit.
    pub start: u32,
    /// Units in the span.
    pub len: u32,
}

/// All units not held by a region.
#[derive(Debug)]
pub struct FreeUnits {
    dirty: UnitRangeSet,
    released: UnitRangeSet,
    inactive_start: u32,
    total: u32,
}

impl FreeUnits {
    /// Free units for a heap of `total` units, all in the inactive zone.
    #[must_use]
    pub const fn new(total: u32) -> Self {
        Self {
            dirty: UnitRangeSet::new(),
            released: UnitRangeSet::new(),
            inactive_start: 0,
            total,
        }
    }

    /// Allocates `len` contiguous units from the best-fitting free span.
    ///
    /// Spans are coalesced across the dirty and released sets and the
    /// inactive zone, so the inactive zone is only grown into when no
    /// smaller span fits.
    pub fn take(&mut self, len: u32) -> Option<TakenUnits> {
        if len == 0 {
            return None;
        }
        let span = self
            .spans()
            .into_iter()
            .filter(|span| span.len >= len)
            .min_by_key(|span| span.len)?;
        Some(self.carve(span.start, len))
    }

    fn carve(&mut self, start: u32, len: u32) -> TakenUnits {
        let end = start + len;
        let dirty = self.dirty.remove_range(start, end);
        let released = self.released.remove_range(start, end);
        if end > self.inactive_start {
            self.inactive_start = end;
        }
        let source = if !dirty.is_empty() {
            UnitSource::Dirty
        } else if !released.is_empty() {
            UnitSource::Released
        } else {
            UnitSource::Inactive
        };
        TakenUnits {
            start,
            len,
            source,
            dirty,
        }
    }

    /// The free space as maximal spans in address order.
    #[must_use]
    pub fn spans(&self) -> Vec<FreeSpan> {
        let mut runs: Vec<(u32, u32)> = self.dirty.runs().chain(self.released.runs()).collect();
        runs.sort_unstable_by_key(|&(start, _)| start);
        if self.inactive_start < self.total {
            runs.push((self.inactive_start, self.total - self.inactive_start));
        }

        let mut spans: Vec<FreeSpan> = Vec::with_capacity(runs.len());
        for (start, len) in runs {
            match spans.last_mut() {
                Some(last) if last.start + last.len == start => last.len += len,
                _ => spans.push(FreeSpan { start, len }),
            }
        }
        spans
    }

    /// Length of the largest free span.
    #[must_use]
    pub fn largest_span(&self) -> u32 {
        self.spans().iter().map(|span| span.len).max().unwrap_or(0)
    }

    /// Returns a run whose contents are stale.
    pub fn add_dirty(&mut self, start: u32, len: u32) {
        self.dirty.insert(start, len);
    }

    /// Returns a run whose pages were decommitted. A released run touching
    /// the inactive zone lowers the watermark instead.
    pub fn add_released(&mut self, start: u32, len: u32) {
        self.released.insert(start, len);
        if let Some((run_start, _)) = self.released.pop_run_ending_at(self.inactive_start) {
            self.inactive_start = run_start;
        }
    }

    /// Dirty free units.
    #[must_use]
    pub const fn dirty_units(&self) -> usize {
        self.dirty.units()
    }

    /// Released free units.
    #[must_use]
    pub const fn released_units(&self) -> usize {
        self.released.units()
    }

    /// Units at or above the inactive-zone watermark.
    #[must_use]
    pub const fn inactive_units(&self) -> usize {
        (self.total - self.inactive_start) as usize
    }

    /// All units not held by a region.
    #[must_use]
    pub const fn free_units(&self) -> usize {
        self.dirty_units() + self.released_units() + self.inactive_units()
    }

    /// The inactive-zone watermark.
    #[must_use]
    pub const fn inactive_start(&self) -> u32 {
        self.inactive_start
    }

    /// The dirty runs.
    #[must_use]
    pub const fn dirty(&self) -> &UnitRangeSet {
        &self.dirty
    }

    /// The released runs.
    #[must_use]
    pub const fn released(&self) -> &UnitRangeSet {
        &self.released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_coalesces() {
        let mut set = UnitRangeSet::new();
        set.insert(10, 5);
        set.insert(20, 5);
        assert_eq!(set.run_count(), 2);
        set.insert(15, 5);
        assert_eq!(set.run_count(), 1);
        assert_eq!(set.runs().collect::<Vec<_>>(), vec![(10, 15)]);
        assert_eq!(set.units(), 15);
    }

    #[test]
    fn test_remove_range_splits_runs() {
        let mut set = UnitRangeSet::new();
        set.insert(0, 8);
        set.insert(10, 4);
        set.insert(20, 6);

        let removed = set.remove_range(6, 22);
        assert_eq!(removed, vec![(6, 2), (10, 4), (20, 2)]);
        assert_eq!(set.runs().collect::<Vec<_>>(), vec![(0, 6), (22, 4)]);
        assert_eq!(set.units(), 10);
        assert!(set.remove_range(30, 40).is_empty());
    }

    #[test]
    fn test_best_fit_prefers_smallest_span() {
        let mut free = FreeUnits::new(100);
        free.take(60).unwrap();
        free.add_dirty(0, 8);
        free.add_dirty(20, 3);
        free.add_dirty(40, 5);

        assert_eq!(free.take(3).map(|t| t.start), Some(20));
        assert_eq!(free.take(4).map(|t| t.start), Some(40));
        assert_eq!(free.dirty().runs().collect::<Vec<_>>(), vec![(0, 8), (44, 1)]);
        let inactive = free.take(9).unwrap();
        assert_eq!((inactive.start, inactive.source), (60, UnitSource::Inactive));
        assert_eq!(free.dirty_units(), 9);
    }

    #[test]
    fn test_span_crosses_dirty_and_released() {
        let mut free = FreeUnits::new(66);
        free.take(66).unwrap();
        free.add_dirty(0, 2);
        free.add_released(2, 64);
        assert_eq!(free.dirty_units(), 2);
        assert_eq!(free.inactive_units(), 64);
        assert_eq!(free.spans(), vec![FreeSpan { start: 0, len: 66 }]);

        let taken = free.take(66).unwrap();
        assert_eq!(taken.start, 0);
        assert_eq!(taken.source, UnitSource::Dirty);
        assert_eq!(taken.dirty, vec![(0, 2)]);
        assert_eq!(free.free_units(), 0);
    }

    #[test]
    fn test_released_run_lowers_watermark() {
        let mut free = FreeUnits::new(100);
        free.take(30).unwrap();
        free.add_released(10, 10);
        assert_eq!(free.inactive_start(), 30);

        free.add_released(20, 10);
        assert_eq!(free.inactive_start(), 10);
        assert_eq!(free.released_units(), 0);
        assert_eq!(free.inactive_units(), 90);

        free.add_dirty(0, 10);
        assert_eq!(free.inactive_start(), 10);
        assert_eq!(free.dirty_units(), 10);
    }

    #[test]
    fn test_mixed_take_reports_dirtiest_source() {
        let mut free = FreeUnits::new(40);
        free.take(22).unwrap();
        free.add_released(0, 4);
        free.add_dirty(4, 4);
        free.add_released(14, 2);

        let released = free.take(2).unwrap();
        assert_eq!((released.start, released.source), (14, UnitSource::Released));
        assert!(released.dirty.is_empty());

        let mixed = free.take(8).unwrap();
        assert_eq!(mixed.start, 0);
        assert_eq!(mixed.source, UnitSource::Dirty);
        assert_eq!(mixed.dirty, vec![(4, 4)]);

        let tail = free.take(8).unwrap();
        assert_eq!((tail.start, tail.source), (22, UnitSource::Inactive));
        assert!(!UnitSource::Dirty.is_zeroed());
        assert!(UnitSource::Released.is_zeroed());
    }

    #[test]
    fn test_inactive_exhaustion() {
        let mut free = FreeUnits::new(10);
        assert!(free.take(10).is_some());
        assert_eq!(free.take(1), None);
        assert_eq!(free.free_units(), 0);
        assert_eq!(free.largest_span(), 0);
    }
}
