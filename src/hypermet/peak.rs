use nalgebra::DVector;

use serde::{Deserialize, Serialize};

use super::precalc::{PrecalcVals, Side};
use super::skew::Skew;
use super::step::Step;
use crate::calibration::EnergyCalibration;
use crate::param::FitParam;
use crate::sum4::Sum4;
use crate::uncertain::UncertainValue;

/// The individually-evaluated terms of one peak
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Components {
    pub gaussian: f64,
    pub short_tail: f64,
    pub right_tail: f64,
    pub long_tail: f64,
    pub step: f64,
}

impl Components {
    /// The peak proper: Gaussian core plus its skews
    pub fn peak_skews(&self) -> f64 {
        self.gaussian + self.short_tail + self.right_tail
    }

    /// The background-like terms: long tail and step
    pub fn step_tail(&self) -> f64 {
        self.long_tail + self.step
    }

    /// Everything
    pub fn all(&self) -> f64 {
        self.peak_skews() + self.step_tail()
    }
}

/// One Hypermet peak.
///
/// Position and amplitude are unique to the peak; width, tail and step
/// configuration usually follow the owning region's template peak unless the
/// matching override flag is set. Identity is the fitted position
/// ([`Peak::id`]); a peak is only ever mutated through the region that owns
/// it. The `sum4` member carries the fit-independent edge-sample summary for
/// cross-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub position: FitParam,
    pub amplitude: FitParam,

    pub width_override: bool,
    pub width: FitParam,

    /// Left skew, part of the peak proper
    pub short_tail: Skew,
    /// Right skew, part of the peak proper
    pub right_tail: Skew,

    /// Background tail on the low-energy side
    pub long_tail: Skew,
    pub step: Step,

    pub chi_sq_norm: f64,

    pub sum4: Sum4,
}

impl Default for Peak {
    fn default() -> Self {
        let mut short_tail = Skew::new(Side::Left);
        short_tail.amplitude = FitParam::sine_bounded(0.45, 0.02, 1.5);
        short_tail.slope = FitParam::sine_bounded(0.3, 0.2, 0.5);
        let mut right_tail = Skew::new(Side::Right);
        right_tail.enabled = false;
        right_tail.amplitude = FitParam::sine_bounded(0.1, 0.01, 0.9);
        right_tail.slope = FitParam::sine_bounded(0.8, 0.3, 1.5);
        Self {
            position: FitParam::sine_bounded(0.0, 0.0, 1.0),
            amplitude: FitParam::positive(10.0),
            width_override: false,
            width: FitParam::sine_bounded(3.2, 0.8, 5.0),
            short_tail,
            right_tail,
            long_tail: Skew::long_tail(),
            step: Step::new(Side::Left),
            chi_sq_norm: 0.0,
            sum4: Sum4::default(),
        }
    }
}

impl Peak {
    /// Adopt width/tail/step settings from a template peak, except where an
    /// override flag protects them. Position and amplitude are never touched.
    pub fn apply_defaults(&mut self, other: &Peak) {
        if !self.width_override {
            self.width = other.width;
        }
        if !self.short_tail.override_defaults {
            self.short_tail = other.short_tail.clone();
        }
        if !self.right_tail.override_defaults {
            self.right_tail = other.right_tail.clone();
        }
        if !self.long_tail.override_defaults {
            self.long_tail = other.long_tail.clone();
        }
        if !self.step.override_defaults {
            self.step = other.step.clone();
        }
    }

    /// Adopt width/tail/step settings from a template unconditionally,
    /// clearing all override flags
    pub fn force_defaults(&mut self, other: &Peak) {
        self.width = other.width;
        self.width_override = false;
        self.short_tail = other.short_tail.clone();
        self.short_tail.override_defaults = false;
        self.right_tail = other.right_tail.clone();
        self.right_tail.override_defaults = false;
        self.long_tail = other.long_tail.clone();
        self.long_tail.override_defaults = false;
        self.step = other.step.clone();
        self.step.override_defaults = false;
    }

    /// A copy of this peak with every non-Gaussian component disabled
    pub fn gaussian_only(&self) -> Peak {
        let mut ret = self.clone();
        ret.short_tail.enabled = false;
        ret.right_tail.enabled = false;
        ret.long_tail.enabled = false;
        ret.step.enabled = false;
        ret
    }

    pub fn is_gaussian_only(&self) -> bool {
        !(self.short_tail.enabled
            || self.right_tail.enabled
            || self.long_tail.enabled
            || self.step.enabled)
    }

    /// Peak identity: the fitted channel position
    pub fn id(&self) -> f64 {
        self.position.val()
    }

    /// Reject non-finite or out-of-range parameters, and fitted parameters
    /// stuck at a bound
    pub fn sanity_check(&self, min_x: f64, max_x: f64) -> bool {
        let amp = self.amplitude.val();
        let pos = self.position.val();
        let wid = self.width.val();
        if !amp.is_finite() || (amp <= 0.0) {
            return false;
        }
        if !pos.is_finite() || (pos < min_x) || (pos > max_x) {
            return false;
        }
        if !wid.is_finite() || (wid <= 0.0) {
            return false;
        }
        if self.position.to_fit && self.position.at_extremum(1e-5, 1e-5) {
            return false;
        }
        if self.width_override && self.width.to_fit && self.width.at_extremum(1e-5, 1e-5) {
            return false;
        }
        if self.short_tail.enabled && !self.short_tail.sane(1e-5, 1e-5, 1e-5) {
            return false;
        }
        if self.right_tail.enabled && !self.right_tail.sane(1e-5, 1e-5, 1e-5) {
            return false;
        }
        if self.long_tail.enabled && !self.long_tail.sane(1e-10, 1e-5, 1e-5) {
            return false;
        }
        if self.step.enabled && !self.step.sane(1e-7, 1e-5) {
            return false;
        }
        true
    }

    /// Take fit-vector slots in a fixed traversal order:
    /// position → amplitude → width → tails → step
    pub fn update_indices(&mut self, counter: &mut i32) {
        self.position.update_index(counter);
        self.amplitude.update_index(counter);
        if self.width_override {
            self.width.update_index(counter);
        } else {
            self.width.reset_index();
        }
        self.short_tail.update_indices(counter);
        self.right_tail.update_indices(counter);
        self.long_tail.update_indices(counter);
        self.step.update_indices(counter);
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.position.put(fit);
        self.amplitude.put(fit);
        self.width.put(fit);
        self.short_tail.put(fit);
        self.right_tail.put(fit);
        self.long_tail.put(fit);
        self.step.put(fit);
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.position.get(fit);
        self.amplitude.get(fit);
        self.width.get(fit);
        self.short_tail.get(fit);
        self.right_tail.get(fit);
        self.long_tail.get(fit);
        self.step.get(fit);
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chisq_norm: f64) {
        self.position.get_uncert(diagonals, chisq_norm);
        self.amplitude.get_uncert(diagonals, chisq_norm);
        self.width.get_uncert(diagonals, chisq_norm);
        self.short_tail.get_uncerts(diagonals, chisq_norm);
        self.right_tail.get_uncerts(diagonals, chisq_norm);
        self.long_tail.get_uncerts(diagonals, chisq_norm);
        self.step.get_uncerts(diagonals, chisq_norm);
    }

    pub fn precalc_vals(&self, chan: f64) -> PrecalcVals {
        PrecalcVals::new(chan, &self.position, &self.amplitude, &self.width)
    }

    pub fn precalc_vals_at(&self, chan: f64, fit: &DVector<f64>) -> PrecalcVals {
        PrecalcVals::new_at(chan, fit, &self.position, &self.amplitude, &self.width)
    }

    fn gaussian(pre: &PrecalcVals) -> f64 {
        pre.ampl * (-pre.spread.powi(2)).exp()
    }

    fn components_with(&self, pre: &PrecalcVals, fit: Option<&DVector<f64>>) -> Components {
        let mut ret = Components {
            gaussian: Self::gaussian(pre),
            ..Default::default()
        };
        match fit {
            Some(fit) => {
                if self.short_tail.enabled {
                    ret.short_tail = self.short_tail.eval_at(pre, fit);
                }
                if self.right_tail.enabled {
                    ret.right_tail = self.right_tail.eval_at(pre, fit);
                }
                if self.long_tail.enabled {
                    ret.long_tail = self.long_tail.eval_at(pre, fit);
                }
                if self.step.enabled {
                    ret.step = self.step.eval_at(pre, fit);
                }
            }
            None => {
                if self.short_tail.enabled {
                    ret.short_tail = self.short_tail.eval(pre);
                }
                if self.right_tail.enabled {
                    ret.right_tail = self.right_tail.eval(pre);
                }
                if self.long_tail.enabled {
                    ret.long_tail = self.long_tail.eval(pre);
                }
                if self.step.enabled {
                    ret.step = self.step.eval(pre);
                }
            }
        }
        ret
    }

    /// Evaluate every component at a channel from the current parameters
    pub fn eval(&self, chan: f64) -> Components {
        self.components_with(&self.precalc_vals(chan), None)
    }

    /// Evaluate every component against a candidate fit vector
    pub fn eval_at(&self, chan: f64, fit: &DVector<f64>) -> Components {
        self.components_with(&self.precalc_vals_at(chan, fit), Some(fit))
    }

    fn gaussian_grad(pre: &PrecalcVals, grads: &mut DVector<f64>) -> f64 {
        let ret = Self::gaussian(pre);
        if pre.i_pos > crate::param::INVALID_INDEX {
            grads[pre.i_pos as usize] += pre.pos_grad * ret * 2.0 * pre.spread / pre.width;
        }
        if pre.i_width > crate::param::INVALID_INDEX {
            grads[pre.i_width as usize] +=
                pre.width_grad * ret * 2.0 * pre.spread.powi(2) / pre.width;
        }
        if pre.i_amp > crate::param::INVALID_INDEX {
            grads[pre.i_amp as usize] += pre.amp_grad * ret / pre.ampl;
        }
        ret
    }

    /// Evaluate while accumulating partial derivatives at the indices given
    /// by the shared precalc and each sub-component's own parameters.
    ///
    /// A parameter shared by several components (width, amplitude, position)
    /// receives the summed contribution of every component depending on it.
    pub fn eval_grad(&self, chan: f64, grads: &mut DVector<f64>) -> Components {
        let pre = self.precalc_vals(chan);
        let mut ret = Components {
            gaussian: Self::gaussian_grad(&pre, grads),
            ..Default::default()
        };
        if self.short_tail.enabled {
            ret.short_tail = self.short_tail.eval_grad(&pre, grads);
        }
        if self.right_tail.enabled {
            ret.right_tail = self.right_tail.eval_grad(&pre, grads);
        }
        if self.long_tail.enabled {
            ret.long_tail = self.long_tail.eval_grad(&pre, grads);
        }
        if self.step.enabled {
            ret.step = self.step.eval_grad(&pre, grads);
        }
        ret
    }

    /// Same as [`Peak::eval_grad`] against a candidate fit vector
    pub fn eval_grad_at(
        &self,
        chan: f64,
        fit: &DVector<f64>,
        grads: &mut DVector<f64>,
    ) -> Components {
        let pre = self.precalc_vals_at(chan, fit);
        let mut ret = Components {
            gaussian: Self::gaussian_grad(&pre, grads),
            ..Default::default()
        };
        if self.short_tail.enabled {
            ret.short_tail = self.short_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.right_tail.enabled {
            ret.right_tail = self.right_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.long_tail.enabled {
            ret.long_tail = self.long_tail.eval_grad_at(&pre, fit, grads);
        }
        if self.step.enabled {
            ret.step = self.step.eval_grad_at(&pre, fit, grads);
        }
        ret
    }

    pub fn peak_position(&self) -> UncertainValue {
        UncertainValue::new(self.position.val(), self.position.uncert())
    }

    /// Fitted position mapped through an energy calibration, with the
    /// position uncertainty scaled by the local calibration slope
    pub fn peak_energy<C: EnergyCalibration + ?Sized>(&self, cal: &C) -> UncertainValue {
        let pos = self.position.val();
        let slope = cal.transform(pos + 0.5) - cal.transform(pos - 0.5);
        UncertainValue::new(cal.transform(pos), slope.abs() * self.position.uncert())
    }

    /// Full width at half maximum of the Gaussian core, in channels
    pub fn fwhm(&self) -> UncertainValue {
        let factor = 2.0 * 2.0f64.ln().sqrt();
        UncertainValue::new(
            self.width.val() * factor,
            self.width.uncert() * factor,
        )
    }

    /// FWHM in energy units across the calibrated peak flanks
    pub fn fwhm_energy<C: EnergyCalibration + ?Sized>(&self, cal: &C) -> UncertainValue {
        let fwhm = self.fwhm();
        let pos = self.position.val();
        let span =
            cal.transform(pos + 0.5 * fwhm.value()) - cal.transform(pos - 0.5 * fwhm.value());
        let rel = if fwhm.value() != 0.0 {
            fwhm.sigma() / fwhm.value()
        } else {
            0.0
        };
        UncertainValue::new(span, span.abs() * rel)
    }

    /// Analytic area of the peak proper (Gaussian plus skews)
    pub fn area(&self) -> UncertainValue {
        let amp = self.amplitude.val();
        let width = self.width.val();
        let mut shape = std::f64::consts::PI.sqrt();
        if self.short_tail.enabled {
            let m = self.short_tail.slope.val();
            shape += self.short_tail.amplitude.val() * m * (-0.25 / m.powi(2)).exp();
        }
        if self.right_tail.enabled {
            let m = self.right_tail.slope.val();
            shape += self.right_tail.amplitude.val() * m * (-0.25 / m.powi(2)).exp();
        }
        let value = amp * width * shape;
        let rel_amp = if amp != 0.0 {
            self.amplitude.uncert() / amp
        } else {
            0.0
        };
        let rel_width = if width != 0.0 {
            self.width.uncert() / width
        } else {
            0.0
        };
        UncertainValue::new(value, value.abs() * (rel_amp.powi(2) + rel_width.powi(2)).sqrt())
    }
}
