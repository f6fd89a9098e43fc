//! Virtual time.

use serde::Serialize;
use std::fmt;

/// A point in virtual time, counted in whole milliseconds since the start of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    /// The start of every run.
    pub const ZERO: Self = Self(0);

    /// The latest representable instant.
    pub const MAX: Self = Self(u64::MAX);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the instant `millis` after `self`, saturating at [SimTime::MAX].
    pub const fn after(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Returns the milliseconds elapsed since `earlier` (zero if `earlier` is later).
    pub const fn since(&self, earlier: SimTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_saturates() {
        let t = SimTime::from_millis(10);
        assert_eq!(t.after(5).as_millis(), 15);
        assert_eq!(t.since(SimTime::from_millis(4)), 6);
        assert_eq!(t.since(SimTime::from_millis(40)), 0);
        assert_eq!(SimTime::MAX.after(1), SimTime::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(SimTime::from_millis(1500).to_string(), "1500ms");
    }
}
