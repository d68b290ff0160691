use libm::erfc;
use nalgebra::DVector;

use serde::{Deserialize, Serialize};

use super::precalc::{flip, PrecalcVals, Side};
use crate::param::FitParam;

/// A smooth step under the peak, `half_ampl · amplitude · erfc(s̃)`,
/// accounting for incomplete charge collection plateauing on one side.
///
/// Unlike the skew tails the step has no slope of its own, and by
/// construction it contributes no position gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Keep this component's settings when region defaults are applied
    pub override_defaults: bool,
    pub enabled: bool,
    pub side: Side,
    /// Plateau height relative to the Gaussian amplitude
    pub amplitude: FitParam,
}

impl Default for Step {
    fn default() -> Self {
        Self::new(Side::Left)
    }
}

impl Step {
    pub fn new(side: Side) -> Self {
        Self {
            override_defaults: false,
            enabled: true,
            side,
            amplitude: FitParam::sine_bounded(5e-4, 1e-6, 0.05),
        }
    }

    pub fn reset_indices(&mut self) {
        self.amplitude.reset_index();
    }

    /// If enabled, takes a slot for the amplitude when flagged for fitting
    pub fn update_indices(&mut self, counter: &mut i32) {
        if self.enabled {
            self.amplitude.update_index(counter);
        } else {
            self.reset_indices();
        }
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.amplitude.put(fit);
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.amplitude.get(fit);
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chisq_norm: f64) {
        self.amplitude.get_uncert(diagonals, chisq_norm);
    }

    fn eval_with(&self, pre: &PrecalcVals, ampl: f64) -> f64 {
        pre.half_ampl * ampl * erfc(flip(self.side, pre.spread))
    }

    pub fn eval(&self, pre: &PrecalcVals) -> f64 {
        self.eval_with(pre, self.amplitude.val())
    }

    pub fn eval_at(&self, pre: &PrecalcVals, fit: &DVector<f64>) -> f64 {
        self.eval_with(pre, self.amplitude.val_from(fit))
    }

    fn grad_with(
        &self,
        pre: &PrecalcVals,
        ampl: f64,
        ampl_grad: f64,
        grads: &mut DVector<f64>,
    ) -> f64 {
        let ret = self.eval_with(pre, ampl);
        let spread = flip(self.side, pre.spread);
        let t2 = pre.ampl * ampl * (-spread.powi(2)).exp() / std::f64::consts::PI.sqrt();
        if pre.i_width > crate::param::INVALID_INDEX {
            grads[pre.i_width as usize] += pre.width_grad * t2 * spread / pre.width;
        }
        if pre.i_amp > crate::param::INVALID_INDEX {
            grads[pre.i_amp as usize] += pre.amp_grad * ret / pre.ampl;
        }
        if self.amplitude.valid_index() {
            grads[self.amplitude.index() as usize] += ampl_grad * ret / ampl;
        }
        ret
    }

    /// Evaluate while accumulating partial derivatives into the shared
    /// width/amplitude slots and this component's own amplitude
    pub fn eval_grad(&self, pre: &PrecalcVals, grads: &mut DVector<f64>) -> f64 {
        self.grad_with(pre, self.amplitude.val(), self.amplitude.grad(), grads)
    }

    /// Same as [`Step::eval_grad`] against a candidate fit vector
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
            grads,
        )
    }

    /// The fitted amplitude may not sit at a bound extremum
    pub fn sane(&self, amp_min_eps: f64, amp_max_eps: f64) -> bool {
        !(self.amplitude.to_fit && self.amplitude.at_extremum(amp_min_eps, amp_max_eps))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parent() -> (FitParam, FitParam, FitParam) {
        let mut position = FitParam::sine_bounded(51.0, 44.0, 68.0);
        let mut amplitude = FitParam::positive(40000.0);
        let mut width = FitParam::sine_bounded(3.2, 0.8, 5.0);
        let mut i = 0;
        amplitude.update_index(&mut i);
        width.update_index(&mut i);
        position.update_index(&mut i);
        (position, amplitude, width)
    }

    fn pre_at(chan: f64, parent: &(FitParam, FitParam, FitParam)) -> PrecalcVals {
        PrecalcVals::new(chan, &parent.0, &parent.1, &parent.2)
    }

    #[test]
    fn left_step_plateaus_on_the_left() {
        let step = Step::new(Side::Left);
        let p = parent();
        // amplitude 40000 * step amplitude 5e-4 = 20 at the plateau
        assert!((step.eval(&pre_at(0.0, &p)) - 20.0).abs() < 1e-9);
        assert!(step.eval(&pre_at(100.0, &p)).abs() < 1e-9);
    }

    #[test]
    fn right_step_plateaus_on_the_right() {
        let step = Step::new(Side::Right);
        let p = parent();
        assert!(step.eval(&pre_at(0.0, &p)).abs() < 1e-9);
        assert!((step.eval(&pre_at(100.0, &p)) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn step_contributes_no_position_gradient() {
        let mut step = Step::new(Side::Left);
        let p = parent();
        let mut i = 3;
        step.update_indices(&mut i);

        let mut grads = DVector::from_element(4, 0.0);
        let ret = step.eval_grad(&pre_at(47.0, &p), &mut grads);

        assert_eq!(ret, step.eval(&pre_at(47.0, &p)));
        assert_ne!(grads[0], 0.0); // parent amplitude
        assert_ne!(grads[1], 0.0); // parent width
        assert_eq!(grads[2], 0.0); // parent position untouched
        assert_ne!(grads[3], 0.0); // own amplitude
    }

    #[test]
    fn eval_at_reads_fit_vector() {
        let mut step = Step::new(Side::Left);
        let p = parent();
        let mut i = 3;
        step.update_indices(&mut i);

        let pre = pre_at(47.0, &p);
        let goal = step.eval(&pre);

        let mut fit = DVector::from_element(4, 0.0);
        step.put(&mut fit);
        step.amplitude.set_val(1e-6);

        assert_ne!(step.eval(&pre), goal);
        assert_eq!(step.eval_at(&pre, &fit), goal);
    }

    #[test]
    fn width_gradient_matches_finite_difference() {
        let mut step = Step::new(Side::Left);
        let (position, amplitude, width) = parent();
        let mut i = 3;
        step.update_indices(&mut i);

        let mut fit = DVector::from_element(4, 0.0);
        amplitude.put(&mut fit);
        width.put(&mut fit);
        position.put(&mut fit);
        step.put(&mut fit);

        let chan = 49.0;
        let eval_at = |v: &DVector<f64>| {
            let pre = PrecalcVals::new_at(chan, v, &position, &amplitude, &width);
            step.eval_at(&pre, v)
        };

        let pre = PrecalcVals::new_at(chan, &fit, &position, &amplitude, &width);
        let mut grads = DVector::from_element(4, 0.0);
        step.eval_grad_at(&pre, &fit, &mut grads);

        let eps = 1e-7;
        for k in [0usize, 1, 3] {
            let mut up = fit.clone();
            up[k] += eps;
            let mut down = fit.clone();
            down[k] -= eps;
            let numeric = (eval_at(&up) - eval_at(&down)) / (2.0 * eps);
            assert!(
                (grads[k] - numeric).abs() < 1e-4 * numeric.abs().max(1.0),
                "var {k}: analytic {} vs numeric {numeric}",
                grads[k]
            );
        }
    }
}
