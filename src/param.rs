//! Reparametrized fit variables.
//!
//! The optimizer works on an unconstrained coordinate vector. Each model
//! parameter owns one such coordinate `x` together with a transform that maps
//! it to the constrained model-space value, so bounds never have to be
//! enforced by the solver itself. The transform family is small and fixed,
//! so it is a closed sum type dispatched by tag.
use nalgebra::DVector;

use serde::{Deserialize, Serialize};

/// Sentinel for a parameter that has no slot in the optimizer vector
pub const INVALID_INDEX: i32 = -1;

fn invalid_index() -> i32 {
    INVALID_INDEX
}

/// The coordinate-to-value mapping of a [`FitParam`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// Identity, `val = x`
    Linear,
    /// Non-negative values only, `val = x²`
    Positive,
    /// Bounded via a sine, `val = min + (max - min)(1 + sin x)/2`
    SineBounded { min: f64, max: f64 },
    /// Bounded via an arctangent with a configurable slope,
    /// `val = min + (max - min)(π/2 + atan(slope·x))/π`
    AtanBounded { min: f64, max: f64, slope: f64 },
}

/// One scalar model parameter expressed through an unconstrained internal
/// coordinate.
///
/// A parameter flagged `to_fit` is assigned a slot in the optimizer vector
/// during an index pass; otherwise it keeps reporting its externally-imposed
/// value and its index stays unassigned. The `*_from` accessors evaluate a
/// candidate fit vector without mutating the parameter, which is how the
/// objective function evaluates "what-if" variable sets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParam {
    x: f64,
    pub to_fit: bool,
    #[serde(skip, default = "invalid_index")]
    index: i32,
    uncert: f64,
    transform: Transform,
}

impl FitParam {
    fn with_transform(transform: Transform) -> Self {
        Self {
            x: 0.0,
            to_fit: true,
            index: INVALID_INDEX,
            uncert: 0.0,
            transform,
        }
    }

    /// An unconstrained parameter
    pub fn free(value: f64) -> Self {
        let mut p = Self::with_transform(Transform::Linear);
        p.set_val(value);
        p
    }

    /// A parameter constrained to non-negative values
    pub fn positive(value: f64) -> Self {
        let mut p = Self::with_transform(Transform::Positive);
        p.set_val(value);
        p
    }

    /// A sine-bounded parameter confined to `[v1, v2]`
    pub fn sine_bounded(value: f64, v1: f64, v2: f64) -> Self {
        let mut p = Self::with_transform(Transform::SineBounded {
            min: v1.min(v2),
            max: v1.max(v2),
        });
        p.set_val(value);
        p
    }

    /// An arctangent-bounded parameter confined to `[v1, v2]`
    pub fn atan_bounded(value: f64, v1: f64, v2: f64, slope: f64) -> Self {
        let mut p = Self::with_transform(Transform::AtanBounded {
            min: v1.min(v2),
            max: v1.max(v2),
            slope,
        });
        p.set_val(value);
        p
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// The internal unconstrained coordinate
    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn set_x(&mut self, x: f64) {
        self.x = x;
    }

    /// The model-space value at a given coordinate
    pub fn val_at(&self, x: f64) -> f64 {
        match self.transform {
            Transform::Linear => x,
            Transform::Positive => x * x,
            Transform::SineBounded { min, max } => (1.0 + x.sin()) * (max - min) / 2.0 + min,
            Transform::AtanBounded { min, max, slope } => {
                (std::f64::consts::FRAC_PI_2 + (slope * x).atan()) * (max - min)
                    / std::f64::consts::PI
                    + min
            }
        }
    }

    /// d(val)/d(x) at a given coordinate
    pub fn grad_at(&self, x: f64) -> f64 {
        match self.transform {
            Transform::Linear => 1.0,
            Transform::Positive => 2.0 * x,
            Transform::SineBounded { min, max } => x.cos() * (max - min) / 2.0,
            Transform::AtanBounded { min, max, slope } => {
                slope / (1.0 + (slope * x).powi(2)) * (max - min) / std::f64::consts::PI
            }
        }
    }

    /// The current model-space value
    pub fn val(&self) -> f64 {
        self.val_at(self.x)
    }

    /// The current transform gradient
    pub fn grad(&self) -> f64 {
        self.grad_at(self.x)
    }

    /// Impose a model-space value by inverting the transform.
    ///
    /// For bounded transforms, values at or beyond a bound saturate the
    /// internal coordinate instead of producing a non-finite one.
    pub fn set_val(&mut self, value: f64) {
        match self.transform {
            Transform::Linear => self.x = value,
            Transform::Positive => self.x = value.sqrt(),
            Transform::SineBounded { min, max } => {
                let t = (min + max - 2.0 * value) / (min - max);
                if t.abs() <= 1.0 {
                    self.x = t.asin();
                } else if t < 0.0 {
                    self.x = -std::f64::consts::FRAC_PI_2;
                } else {
                    self.x = std::f64::consts::FRAC_PI_2;
                }
            }
            Transform::AtanBounded { min, max, slope } => {
                if value >= max {
                    self.x = f64::MAX;
                } else if value <= min {
                    self.x = -f64::MAX;
                } else {
                    self.x = (std::f64::consts::PI * (value - min) / (max - min)
                        - std::f64::consts::FRAC_PI_2)
                        .tan()
                        / slope;
                }
            }
        }
    }

    /// Lower bound of the admissible value range
    pub fn min(&self) -> f64 {
        match self.transform {
            Transform::Linear => f64::NEG_INFINITY,
            Transform::Positive => 0.0,
            Transform::SineBounded { min, .. } | Transform::AtanBounded { min, .. } => min,
        }
    }

    /// Upper bound of the admissible value range
    pub fn max(&self) -> f64 {
        match self.transform {
            Transform::Linear | Transform::Positive => f64::INFINITY,
            Transform::SineBounded { max, .. } | Transform::AtanBounded { max, .. } => max,
        }
    }

    /// Replace the bounds of a bounded transform, re-clamping the current
    /// value into the new range. Has no effect on unbounded transforms.
    pub fn bound(&mut self, v1: f64, v2: f64) {
        let value = self.val();
        match &mut self.transform {
            Transform::SineBounded { min, max }
            | Transform::AtanBounded { min, max, .. } => {
                *min = v1.min(v2);
                *max = v1.max(v2);
            }
            Transform::Linear | Transform::Positive => return,
        }
        self.set_val(value.clamp(self.min(), self.max()));
    }

    /// Whether the current value sits within epsilon of either bound.
    ///
    /// Always `false` for unbounded transforms.
    pub fn at_extremum(&self, min_epsilon: f64, max_epsilon: f64) -> bool {
        match self.transform {
            Transform::Linear | Transform::Positive => false,
            Transform::SineBounded { min, max } | Transform::AtanBounded { min, max, .. } => {
                ((self.val() - min) < min_epsilon) || ((max - self.val()) < max_epsilon)
            }
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn valid_index(&self) -> bool {
        self.index > INVALID_INDEX
    }

    pub fn reset_index(&mut self) {
        self.index = INVALID_INDEX;
    }

    /// Take the next slot in the optimizer vector if this parameter is being
    /// fit, else clear the slot.
    ///
    /// # Panics
    /// Index assignment only proceeds forward; a negative counter is a
    /// caller bug and panics.
    pub fn update_index(&mut self, counter: &mut i32) {
        assert!(
            *counter >= 0,
            "parameter index counter must be non-negative, got {counter}"
        );
        if self.to_fit {
            self.index = *counter;
            *counter += 1;
        } else {
            self.reset_index();
        }
    }

    /// Read the model-space value from a candidate fit vector, falling back
    /// to the internal coordinate when no slot is assigned
    pub fn val_from(&self, fit: &DVector<f64>) -> f64 {
        if self.valid_index() {
            self.val_at(fit[self.index as usize])
        } else {
            self.val()
        }
    }

    /// Read the transform gradient from a candidate fit vector, falling back
    /// to the internal coordinate when no slot is assigned
    pub fn grad_from(&self, fit: &DVector<f64>) -> f64 {
        if self.valid_index() {
            self.grad_at(fit[self.index as usize])
        } else {
            self.grad()
        }
    }

    /// Write the internal coordinate into the fit vector
    pub fn put(&self, fit: &mut DVector<f64>) {
        if self.valid_index() {
            fit[self.index as usize] = self.x;
        }
    }

    /// Adopt the coordinate from an optimized fit vector
    pub fn get(&mut self, fit: &DVector<f64>) {
        if self.valid_index() {
            self.x = fit[self.index as usize];
        }
    }

    pub fn uncert(&self) -> f64 {
        self.uncert
    }

    pub fn set_uncert(&mut self, uncert: f64) {
        self.uncert = uncert;
    }

    /// Propagate the inverse-Hessian diagonal through the transform,
    /// `uncert = sqrt(|diag · grad² · chisq_norm|)`
    pub fn get_uncert(&mut self, diagonals: &DVector<f64>, chisq_norm: f64) {
        if self.valid_index() {
            self.uncert =
                (diagonals[self.index as usize] * self.grad().powi(2) * chisq_norm).abs().sqrt();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn free_is_identity() {
        let p = FitParam::free(7.5);
        assert_eq!(p.val(), 7.5);
        assert_eq!(p.grad(), 1.0);
    }

    #[test]
    fn positive_squares() {
        let p = FitParam::positive(400.0);
        assert!((p.x() - 20.0).abs() < 1e-12);
        assert!((p.val() - 400.0).abs() < 1e-9);
        assert!((p.grad() - 40.0).abs() < 1e-9);
    }

    #[rstest::rstest]
    #[case(0.81)]
    #[case(1.0)]
    #[case(2.5)]
    #[case(3.9)]
    #[case(4.99)]
    fn sine_bounded_round_trip(#[case] v: f64) {
        let mut p = FitParam::sine_bounded(3.2, 0.8, 5.0);
        p.set_val(v);
        assert!((p.val() - v).abs() < 1e-12, "round trip failed for {v}");
    }

    #[test]
    fn sine_bounded_saturates() {
        let mut p = FitParam::sine_bounded(3.2, 0.8, 5.0);
        p.set_val(-10.0);
        assert!(p.x().is_finite());
        assert!((p.val() - 0.8).abs() < 1e-12);
        p.set_val(1e4);
        assert!(p.x().is_finite());
        assert!((p.val() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn atan_bounded_round_trip() {
        let mut p = FitParam::atan_bounded(1.0, 0.0, 2.0, 0.3);
        for v in [0.05, 0.7, 1.3, 1.95] {
            p.set_val(v);
            assert!((p.val() - v).abs() < 1e-9, "round trip failed for {v}");
        }
        p.set_val(5.0);
        assert!((p.val() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn at_extremum_detects_bounds() {
        let mut p = FitParam::sine_bounded(0.8, 0.8, 5.0);
        assert!(p.at_extremum(1e-6, 1e-6));
        p.set_val(2.0);
        assert!(!p.at_extremum(1e-6, 1e-6));
        p.set_val(5.0);
        assert!(p.at_extremum(1e-6, 1e-6));
    }

    #[test]
    fn index_assignment_walks_counter() {
        let mut p = FitParam::sine_bounded(2.0, 0.0, 4.0);
        let mut i = 0;
        p.update_index(&mut i);
        assert_eq!(p.index(), 0);
        assert_eq!(i, 1);

        i = 42;
        p.update_index(&mut i);
        assert_eq!(p.index(), 42);
        assert_eq!(i, 43);
    }

    #[test]
    fn unassign_is_idempotent() {
        let mut p = FitParam::sine_bounded(2.0, 0.0, 4.0);
        let mut i = 5;
        p.update_index(&mut i);
        assert!(p.valid_index());

        p.to_fit = false;
        p.update_index(&mut i);
        assert_eq!(p.index(), INVALID_INDEX);
        assert_eq!(i, 6);
        p.update_index(&mut i);
        assert_eq!(p.index(), INVALID_INDEX);
        assert_eq!(i, 6);
    }

    #[test]
    #[should_panic]
    fn negative_counter_panics() {
        let mut p = FitParam::free(1.0);
        let mut i = -1;
        p.update_index(&mut i);
    }

    #[test]
    fn vector_fallback() {
        let mut p = FitParam::sine_bounded(3.0, 0.0, 4.0);
        let fit = DVector::from_element(1, 0.25);

        // no index assigned: reads the internal coordinate
        assert_eq!(p.val_from(&fit), p.val());

        let mut i = 0;
        p.update_index(&mut i);
        assert_eq!(p.val_from(&fit), p.val_at(0.25));
        assert_eq!(p.grad_from(&fit), p.grad_at(0.25));
    }

    #[test]
    fn put_get_round_trip() {
        let mut p = FitParam::sine_bounded(3.0, 0.0, 4.0);
        let mut i = 0;
        p.update_index(&mut i);

        let mut fit = DVector::from_element(1, 0.0);
        p.put(&mut fit);
        assert_eq!(fit[0], p.x());

        let fit2 = DVector::from_element(1, 0.125);
        p.get(&fit2);
        assert_eq!(p.x(), 0.125);
    }

    #[test]
    fn uncert_propagates_through_transform() {
        let mut p = FitParam::positive(100.0);
        let mut i = 0;
        p.update_index(&mut i);

        let diag = DVector::from_element(1, 0.5);
        p.get_uncert(&diag, 2.0);
        let expected = (0.5 * p.grad().powi(2) * 2.0_f64).abs().sqrt();
        assert!((p.uncert() - expected).abs() < 1e-12);
    }
}
