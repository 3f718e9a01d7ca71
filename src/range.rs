//! Sweep range decomposition.
//!
//! A range request (`start`, `stop`, `step`) is turned into an ordered list of
//! single-value steps before anything is sent to hardware. Validation happens
//! here so that a bad range never reaches the Instrument Link.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance used when deciding whether the last step still lands on `stop`.
const STEP_EPSILON: f64 = 1e-9;

/// Hard ceiling on an expansion, whatever limit the caller asks for.
pub const MAX_EXPANSION: usize = 1_000_000;

/// Range validation failures. All of these are configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RangeError {
    /// `step` is zero
    #[error("step must not be zero")]
    ZeroStep,

    /// The sign of `step` points away from `stop`
    #[error("step {step} cannot reach {stop} from {start}")]
    WrongDirection {
        /// First value
        start: f64,
        /// Last value
        stop: f64,
        /// Increment
        step: f64,
    },

    /// NaN or infinity somewhere in the triple
    #[error("range values must be finite")]
    NotFinite,

    /// Zero points requested
    #[error("point count must be at least 1")]
    NoPoints,

    /// Expansion exceeds the step limit
    #[error("range expands to {steps} steps, limit is {limit}")]
    TooManySteps {
        /// Steps the range would expand to, saturated at `usize::MAX`
        steps: usize,
        /// Limit in force
        limit: usize,
    },
}

/// A start/stop/step triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    /// First value
    pub start: f64,
    /// Last value, included when a whole number of steps lands on it
    pub stop: f64,
    /// Signed increment
    pub step: f64,
}

impl SweepRange {
    /// Create a range without validating it.
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Build a range from a point count, the way the bench front-end
    /// describes sweeps (`points` evenly spaced values, both ends included).
    pub fn from_points(start: f64, stop: f64, points: usize) -> Result<Self, RangeError> {
        if points == 0 {
            return Err(RangeError::NoPoints);
        }
        if !start.is_finite() || !stop.is_finite() {
            return Err(RangeError::NotFinite);
        }
        if points == 1 || start == stop {
            // Any non-zero step with the right sign yields a single point.
            return Ok(Self::new(start, start, 1.0));
        }
        let step = (stop - start) / (points - 1) as f64;
        Ok(Self::new(start, stop, step))
    }

    /// Check the range can be walked from `start` to `stop`.
    pub fn validate(&self) -> Result<(), RangeError> {
        if !self.start.is_finite() || !self.stop.is_finite() || !self.step.is_finite() {
            return Err(RangeError::NotFinite);
        }
        if self.step == 0.0 {
            return Err(RangeError::ZeroStep);
        }
        let span = self.stop - self.start;
        if span != 0.0 && span.signum() != self.step.signum() {
            return Err(RangeError::WrongDirection {
                start: self.start,
                stop: self.stop,
                step: self.step,
            });
        }
        Ok(())
    }

    /// Number of steps the range expands to. Assumes a valid range.
    ///
    /// Saturates at `usize::MAX` for spans too long to count.
    pub fn len(&self) -> usize {
        let span = self.stop - self.start;
        if span == 0.0 {
            return 1;
        }
        let intervals = (span / self.step + STEP_EPSILON).floor();
        if !intervals.is_finite() || intervals >= usize::MAX as f64 {
            return usize::MAX;
        }
        (intervals as usize).saturating_add(1)
    }

    /// Always false: a valid range has at least its start point.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Validate and check the expansion against a step limit.
    pub fn validate_with_limit(&self, limit: usize) -> Result<(), RangeError> {
        self.validate()?;
        let limit = limit.min(MAX_EXPANSION);
        let steps = self.len();
        if steps > limit {
            return Err(RangeError::TooManySteps { steps, limit });
        }
        Ok(())
    }

    /// Expand into the ordered list of values to apply.
    ///
    /// Values are `start + i * step`, so rounding does not accumulate over
    /// long sweeps. The last value is within one step of `stop`. Ranges
    /// longer than [`MAX_EXPANSION`] are refused.
    pub fn steps(&self) -> Result<Vec<f64>, RangeError> {
        self.validate_with_limit(MAX_EXPANSION)?;
        let count = self.len();
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let value = self.start + i as f64 * self.step;
            // Snap the tail onto `stop` when it only misses by rounding.
            if (value - self.stop).abs() <= STEP_EPSILON * self.step.abs().max(1.0) {
                values.push(self.stop);
            } else {
                values.push(value);
            }
        }
        Ok(values)
    }
}

impl std::fmt::Display for SweepRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{} step {}", self.start, self.stop, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_range_includes_both_ends() {
        let steps = SweepRange::new(0.0, 10.0, 5.0).steps().unwrap();
        assert_eq!(steps, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_descending_range() {
        let steps = SweepRange::new(0.0, -5.0, -1.0).steps().unwrap();
        assert_eq!(steps, vec![0.0, -1.0, -2.0, -3.0, -4.0, -5.0]);
    }

    #[test]
    fn test_uneven_range_stops_within_one_step() {
        let range = SweepRange::new(0.0, 10.0, 3.0);
        let steps = range.steps().unwrap();
        assert_eq!(steps, vec![0.0, 3.0, 6.0, 9.0]);
        let last = *steps.last().unwrap();
        assert!((range.stop - last).abs() < range.step.abs());
    }

    #[test]
    fn test_degenerate_range_is_single_point() {
        let steps = SweepRange::new(7.5, 7.5, 1.0).steps().unwrap();
        assert_eq!(steps, vec![7.5]);
    }

    #[test]
    fn test_zero_step_rejected() {
        assert_eq!(
            SweepRange::new(0.0, 10.0, 0.0).validate(),
            Err(RangeError::ZeroStep)
        );
        // Zero is rejected even when start == stop.
        assert_eq!(
            SweepRange::new(1.0, 1.0, 0.0).validate(),
            Err(RangeError::ZeroStep)
        );
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let err = SweepRange::new(0.0, -5.0, 1.0).validate().unwrap_err();
        assert!(matches!(err, RangeError::WrongDirection { .. }));
    }

    #[test]
    fn test_non_finite_rejected() {
        assert_eq!(
            SweepRange::new(0.0, f64::NAN, 1.0).validate(),
            Err(RangeError::NotFinite)
        );
    }

    #[test]
    fn test_step_limit() {
        let range = SweepRange::new(0.0, 1000.0, 1.0);
        assert!(range.validate_with_limit(2000).is_ok());
        assert_eq!(
            range.validate_with_limit(10),
            Err(RangeError::TooManySteps {
                steps: 1001,
                limit: 10
            })
        );
    }

    #[test]
    fn test_huge_span_is_rejected_not_overflowed() {
        let range = SweepRange::new(0.0, 1e300, 1e-10);
        assert_eq!(range.len(), usize::MAX);
        assert_eq!(
            range.validate_with_limit(10_000),
            Err(RangeError::TooManySteps {
                steps: usize::MAX,
                limit: 10_000
            })
        );
        assert!(matches!(range.steps(), Err(RangeError::TooManySteps { .. })));

        // Finite ends whose difference overflows to infinity.
        let range = SweepRange::new(-1.7e308, 1.7e308, 1.0);
        assert!(range.validate().is_ok());
        assert!(matches!(
            range.validate_with_limit(usize::MAX),
            Err(RangeError::TooManySteps { limit: MAX_EXPANSION, .. })
        ));
    }

    #[test]
    fn test_from_points_matches_front_end_sweeps() {
        let range = SweepRange::from_points(1.0e9, 9.0e9, 201).unwrap();
        let steps = range.steps().unwrap();
        assert_eq!(steps.len(), 201);
        assert_eq!(steps[0], 1.0e9);
        assert_eq!(*steps.last().unwrap(), 9.0e9);
    }

    #[test]
    fn test_from_points_single_point() {
        let range = SweepRange::from_points(2.4e9, 5.0e9, 1).unwrap();
        assert_eq!(range.steps().unwrap(), vec![2.4e9]);
        assert_eq!(SweepRange::from_points(0.0, 1.0, 0), Err(RangeError::NoPoints));
    }

    #[test]
    fn test_fractional_steps_do_not_drift() {
        let steps = SweepRange::new(0.0, 1.0, 0.1).steps().unwrap();
        assert_eq!(steps.len(), 11);
        assert_eq!(*steps.last().unwrap(), 1.0);
        for pair in steps.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
