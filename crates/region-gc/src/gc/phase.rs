//! Collector phases.

/// The phase of the running collection.
///
/// One cycle visits every phase in declaration order and returns to
/// [`Idle`](Self::Idle). The global phase is installed by the mutator
/// coordinator while it holds the registry write lock; each mutator adopts it
/// at its next safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum GcPhase {
    /// No collection is running.
    Idle = 0,
    /// Garbage candidates are assembled and roots enumerated.
    Enum = 1,
    /// The object graph is traced concurrently.
    Mark = 2,
    /// Remaining marking work is drained and weak references are cleared.
    PostMark = 3,
    /// From-space is classified and roots are preforwarded.
    PreCopy = 4,
    /// Live from-space objects are evacuated.
    Copy = 5,
    /// Stale references are rewritten to the copies.
    Fix = 6,
}

impl GcPhase {
    /// Decodes a phase stored as `u8`; unknown values decode as `Idle`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Enum,
            2 => Self::Mark,
            3 => Self::PostMark,
            4 => Self::PreCopy,
            5 => Self::Copy,
            6 => Self::Fix,
            _ => Self::Idle,
        }
    }

    /// The phase that follows this one in a cycle.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Idle => Self::Enum,
            Self::Enum => Self::Mark,
            Self::Mark => Self::PostMark,
            Self::PostMark => Self::PreCopy,
            Self::PreCopy => Self::Copy,
            Self::Copy => Self::Fix,
            Self::Fix => Self::Idle,
        }
    }

    /// Whether `to` may directly follow `self`.
    ///
    /// Only the cycle order is allowed, plus staying in the same phase.
    #[must_use]
    pub const fn is_valid_transition(self, to: Self) -> bool {
        self as u8 == to as u8 || self.next() as u8 == to as u8
    }

    /// Whether the snapshot-at-the-beginning write barrier is active.
    #[must_use]
    pub const fn is_marking(self) -> bool {
        matches!(self, Self::Enum | Self::Mark | Self::PostMark)
    }

    /// Whether loads must resolve forwarded objects.
    #[must_use]
    pub const fn needs_read_barrier(self) -> bool {
        matches!(self, Self::PreCopy | Self::Copy | Self::Fix)
    }

    /// Whether a cycle is in progress.
    #[must_use]
    pub const fn is_collecting(self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Lower-case name used in logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Enum => "enum",
            Self::Mark => "mark",
            Self::PostMark => "post_mark",
            Self::PreCopy => "pre_copy",
            Self::Copy => "copy",
            Self::Fix => "fix",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_order() {
        let mut phase = GcPhase::Idle;
        let mut seen = vec![phase];
        loop {
            phase = phase.next();
            if phase == GcPhase::Idle {
                break;
            }
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                GcPhase::Idle,
                GcPhase::Enum,
                GcPhase::Mark,
                GcPhase::PostMark,
                GcPhase::PreCopy,
                GcPhase::Copy,
                GcPhase::Fix,
            ]
        );
    }

    #[test]
    fn test_transitions() {
        assert!(GcPhase::Idle.is_valid_transition(GcPhase::Enum));
        assert!(GcPhase::Fix.is_valid_transition(GcPhase::Idle));
        assert!(GcPhase::Mark.is_valid_transition(GcPhase::Mark));
        assert!(!GcPhase::Idle.is_valid_transition(GcPhase::Copy));
        assert!(!GcPhase::Copy.is_valid_transition(GcPhase::Mark));
    }

    #[test]
    fn test_barrier_windows() {
        assert!(GcPhase::Enum.is_marking());
        assert!(GcPhase::PostMark.is_marking());
        assert!(!GcPhase::Copy.is_marking());
        assert!(GcPhase::Copy.needs_read_barrier());
        assert!(!GcPhase::Mark.needs_read_barrier());
        for raw in 0..7 {
            assert_eq!(GcPhase::from_u8(raw) as u8, raw);
        }
    }
}
