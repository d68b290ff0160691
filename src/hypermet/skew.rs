use libm::erfc;
use nalgebra::DVector;

use serde::{Deserialize, Serialize};

use super::precalc::{flip, PrecalcVals, Side};
use crate::param::FitParam;

/// An exponentially-modified-Gaussian correction term added to one side of
/// a peak, modeling detector charge-collection asymmetries.
///
/// `value = half_ampl · amplitude · exp(s̃/slope) · erfc(0.5/slope + s̃)`
/// with `s̃` the side-flipped spread. The same shape with a long slope and
/// small amplitude serves as the background "long tail".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skew {
    /// Keep this component's settings when region defaults are applied
    pub override_defaults: bool,
    pub enabled: bool,
    pub side: Side,
    /// Amplitude relative to the Gaussian amplitude
    pub amplitude: FitParam,
    /// Decay length in units of the peak width
    pub slope: FitParam,
}

impl Skew {
    pub fn new(side: Side) -> Self {
        Self {
            override_defaults: false,
            enabled: true,
            side,
            amplitude: FitParam::sine_bounded(0.1, 1e-4, 1.5),
            slope: FitParam::sine_bounded(0.5, 0.2, 50.0),
        }
    }

    /// A disabled long-tail variant with gentler defaults
    pub fn long_tail() -> Self {
        let mut tail = Self::new(Side::Left);
        tail.enabled = false;
        tail.amplitude = FitParam::sine_bounded(0.01, 1e-10, 0.15);
        tail.slope = FitParam::sine_bounded(50.0, 2.5, 300.0);
        tail
    }

    pub fn reset_indices(&mut self) {
        self.amplitude.reset_index();
        self.slope.reset_index();
    }

    /// If enabled, takes slots for the parameters flagged for fitting
    pub fn update_indices(&mut self, counter: &mut i32) {
        if self.enabled {
            self.amplitude.update_index(counter);
            self.slope.update_index(counter);
        } else {
            self.reset_indices();
        }
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.amplitude.put(fit);
        self.slope.put(fit);
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.amplitude.get(fit);
        self.slope.get(fit);
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chisq_norm: f64) {
        self.amplitude.get_uncert(diagonals, chisq_norm);
        self.slope.get_uncert(diagonals, chisq_norm);
    }

    fn eval_with(&self, pre: &PrecalcVals, ampl: f64, slp: f64) -> f64 {
        let spread = flip(self.side, pre.spread);
        pre.half_ampl * ampl * (spread / slp).exp() * erfc(0.5 / slp + spread)
    }

    pub fn eval(&self, pre: &PrecalcVals) -> f64 {
        self.eval_with(pre, self.amplitude.val(), self.slope.val())
    }

    pub fn eval_at(&self, pre: &PrecalcVals, fit: &DVector<f64>) -> f64 {
        self.eval_with(pre, self.amplitude.val_from(fit), self.slope.val_from(fit))
    }

    fn grad_with(
        &self,
        pre: &PrecalcVals,
        ampl: f64,
        ampl_grad: f64,
        slp: f64,
        slp_grad: f64,
        grads: &mut DVector<f64>,
    ) -> f64 {
        let ret = self.eval_with(pre, ampl, slp);
        let spread = flip(self.side, pre.spread);
        let t2 = pre.ampl * ampl * (spread / slp).exp() / std::f64::consts::PI.sqrt()
            * (-(1.0 / (2.0 * slp) + spread).powi(2)).exp()
            / pre.width;
        if pre.i_width > crate::param::INVALID_INDEX {
            grads[pre.i_width as usize] +=
                pre.width_grad * spread * (t2 - ret / (pre.width * slp));
        }
        if pre.i_pos > crate::param::INVALID_INDEX {
            grads[pre.i_pos as usize] +=
                pre.pos_grad * flip(self.side, t2 - ret / (slp * pre.width));
        }
        if pre.i_amp > crate::param::INVALID_INDEX {
            grads[pre.i_amp as usize] += pre.amp_grad * ret / pre.ampl;
        }

        if self.amplitude.valid_index() {
            grads[self.amplitude.index() as usize] += ampl_grad * ret / ampl;
        }
        if self.slope.valid_index() {
            grads[self.slope.index() as usize] += slp_grad
                * ((-spread / slp.powi(2)) * ret + (pre.width / (2.0 * slp.powi(2))) * t2);
        }
        ret
    }

    /// Evaluate while accumulating partial derivatives, both into the shared
    /// position/width/amplitude slots and into this component's own
    pub fn eval_grad(&self, pre: &PrecalcVals, grads: &mut DVector<f64>) -> f64 {
        self.grad_with(
            pre,
            self.amplitude.val(),
            self.amplitude.grad(),
            self.slope.val(),
            self.slope.grad(),
            grads,
        )
    }

    /// Same as [`Skew::eval_grad`] against a candidate fit vector
    pub fn eval_grad_at(
        &self,
        pre: &PrecalcVals,
        fit: &DVector<f64>,
        grads: &mut DVector<f64>,
    ) -> f64 {
        self.grad_with(
            pre,
            self.amplitude.val_from(fit),
            self.amplitude.grad_from(fit),
            self.slope.val_from(fit),
            self.slope.grad_from(fit),
            grads,
        )
    }

    /// No fitted parameter may sit at a bound extremum
    pub fn sane(&self, amp_min_eps: f64, amp_max_eps: f64, slope_eps: f64) -> bool {
        if self.amplitude.to_fit && self.amplitude.at_extremum(amp_min_eps, amp_max_eps) {
            return false;
        }
        if self.slope.to_fit && self.slope.at_extremum(slope_eps, slope_eps) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn precalc(chan: f64) -> (PrecalcVals, FitParam, FitParam, FitParam) {
        let mut position = FitParam::sine_bounded(21.0, 0.0, 40.0);
        let mut amplitude = FitParam::positive(400.0);
        let mut width = FitParam::sine_bounded(3.2, 0.8, 5.0);
        let mut i = 0;
        position.update_index(&mut i);
        amplitude.update_index(&mut i);
        width.update_index(&mut i);
        (
            PrecalcVals::new(chan, &position, &amplitude, &width),
            position,
            amplitude,
            width,
        )
    }

    #[test]
    fn left_tail_rises_toward_the_peak() {
        let skew = Skew::new(Side::Left);
        let (far, ..) = precalc(5.0);
        let (near, ..) = precalc(19.0);
        assert!(skew.eval(&far) < skew.eval(&near));
        // and dies off on the right flank
        let (right, ..) = precalc(35.0);
        assert!(skew.eval(&right) < skew.eval(&near));
    }

    #[test]
    fn sides_mirror() {
        let left = Skew::new(Side::Left);
        let right = Skew::new(Side::Right);
        let (below, ..) = precalc(18.0);
        let (above, ..) = precalc(24.0);
        // 18 and 24 are symmetric about the position: mirrored evaluation
        assert!((left.eval(&below) - right.eval(&above)).abs() < 1e-10);
    }

    #[test]
    fn disabled_takes_no_slots() {
        let mut skew = Skew::new(Side::Left);
        skew.enabled = false;
        let mut i = 3;
        skew.update_indices(&mut i);
        assert_eq!(i, 3);
        assert!(!skew.amplitude.valid_index());
        assert!(!skew.slope.valid_index());
    }

    #[test]
    fn eval_grad_returns_eval() {
        let mut skew = Skew::new(Side::Left);
        let (pre, ..) = precalc(19.0);
        let mut i = 3;
        skew.update_indices(&mut i);
        let mut grads = DVector::from_element(i as usize, 0.0);
        let ret = skew.eval_grad(&pre, &mut grads);
        assert_eq!(ret, skew.eval(&pre));
        assert_ne!(grads[3], 0.0);
        assert_ne!(grads[4], 0.0);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        for side in [Side::Left, Side::Right] {
            let mut skew = Skew::new(side);
            let (_, position, amplitude, width) = precalc(0.0);
            let mut i = 3;
            skew.update_indices(&mut i);

            let mut fit = DVector::from_element(i as usize, 0.0);
            position.put(&mut fit);
            amplitude.put(&mut fit);
            width.put(&mut fit);
            skew.put(&mut fit);

            let chan = 19.5;
            let eval_at = |v: &DVector<f64>| {
                let pre = PrecalcVals::new_at(chan, v, &position, &amplitude, &width);
                skew.eval_at(&pre, v)
            };

            let pre = PrecalcVals::new_at(chan, &fit, &position, &amplitude, &width);
            let mut grads = DVector::from_element(i as usize, 0.0);
            skew.eval_grad_at(&pre, &fit, &mut grads);

            let eps = 1e-7;
            for k in 0..i as usize {
                let mut up = fit.clone();
                up[k] += eps;
                let mut down = fit.clone();
                down[k] -= eps;
                let numeric = (eval_at(&up) - eval_at(&down)) / (2.0 * eps);
                assert!(
                    (grads[k] - numeric).abs() < 1e-4 * numeric.abs().max(1.0),
                    "{side:?} var {k}: analytic {} vs numeric {numeric}",
                    grads[k]
                );
            }
        }
    }

    #[test]
    fn sanity_rejects_extrema() {
        let mut skew = Skew::new(Side::Left);
        assert!(skew.sane(1e-6, 1e-6, 1e-6));
        skew.amplitude.set_val(1.5);
        assert!(!skew.sane(1e-6, 1e-6, 1e-6));
    }
}
