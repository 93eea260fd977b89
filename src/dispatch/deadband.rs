//! Absolute-tolerance change filter.

use serde::{Deserialize, Serialize};

/// Default tolerance, in the engineering units of the motor.
pub const DEFAULT_DEADBAND: f64 = 0.05;

/// Ignores motor moves no larger than `tolerance`.
///
/// The comparison is absolute, never relative. A difference exactly equal to
/// the tolerance counts as unchanged, as do two equal infinities. NaN is
/// never close to anything, so a NaN on either side is always accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deadband {
    tolerance: f64,
}

impl Default for Deadband {
    fn default() -> Self {
        Self::new(DEFAULT_DEADBAND)
    }
}

impl Deadband {
    /// Create a filter with the given absolute tolerance.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    /// The absolute tolerance.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// True when `a` and `b` are within the tolerance of each other.
    pub fn is_close(&self, a: f64, b: f64) -> bool {
        a == b || (a - b).abs() <= self.tolerance
    }

    /// Whether a new sample should replace the current value.
    pub fn accepts(&self, current: Option<f64>, new: f64) -> bool {
        match current {
            None => true,
            Some(current) => !self.is_close(current, new),
        }
    }
}
