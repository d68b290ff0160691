//! Polynomial background fit jointly with the peaks of a region.
use nalgebra::DVector;

use serde::{Deserialize, Serialize};

use crate::data::WeightedData;
use crate::param::FitParam;
use crate::sum4::Sum4Edge;

/// A background polynomial evaluated relative to an x-offset,
/// `base + slope·(x - offset) + curve·(x - offset)²`.
///
/// Slope and curvature can be disabled individually; a disabled term takes
/// no slot in the fit vector and contributes nothing to the gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyBackground {
    pub x_offset: f64,
    pub base: FitParam,
    pub slope_enabled: bool,
    pub slope: FitParam,
    pub curve_enabled: bool,
    pub curve: FitParam,
}

impl Default for PolyBackground {
    fn default() -> Self {
        Self {
            x_offset: 0.0,
            base: FitParam::sine_bounded(0.0, 0.0, 1.0),
            slope_enabled: true,
            slope: FitParam::sine_bounded(0.0, -5.0, 5.0),
            curve_enabled: true,
            curve: FitParam::sine_bounded(0.0, -5.0, 5.0),
        }
    }
}

impl PolyBackground {
    /// Seed a background from a region's data and its two edge samples:
    /// base from the left average, slope from the finite difference of the
    /// averages, anchored at the right end of the left edge.
    pub fn from_data(data: &WeightedData, lb: &Sum4Edge, rb: &Sum4Edge) -> Self {
        let mut bkg = Self::default();
        bkg.x_offset = lb.right();
        bkg.base.bound(0.0, (3.0 * data.count_max()).max(1.0));
        bkg.base.set_val(lb.average().value());

        let slope_seed = (rb.average().value() - lb.average().value()) / (rb.left() - lb.right());
        let slope_bound = (10.0 * slope_seed.abs()).max(5.0);
        bkg.slope.bound(-slope_bound, slope_bound);
        bkg.slope.set_val(slope_seed);
        bkg
    }

    /// Take slots in the fit vector for the enabled coefficients
    pub fn update_indices(&mut self, counter: &mut i32) {
        self.base.update_index(counter);
        if self.slope_enabled {
            self.slope.update_index(counter);
        } else {
            self.slope.reset_index();
        }
        if self.curve_enabled {
            self.curve.update_index(counter);
        } else {
            self.curve.reset_index();
        }
    }

    pub fn put(&self, fit: &mut DVector<f64>) {
        self.base.put(fit);
        self.slope.put(fit);
        self.curve.put(fit);
    }

    pub fn get(&mut self, fit: &DVector<f64>) {
        self.base.get(fit);
        self.slope.get(fit);
        self.curve.get(fit);
    }

    pub fn get_uncerts(&mut self, diagonals: &DVector<f64>, chisq_norm: f64) {
        self.base.get_uncert(diagonals, chisq_norm);
        self.slope.get_uncert(diagonals, chisq_norm);
        self.curve.get_uncert(diagonals, chisq_norm);
    }

    fn eval_with(&self, bin: f64, base: f64, slope: f64, curve: f64) -> f64 {
        let mut ret = base;
        if self.slope_enabled {
            ret += slope * (bin - self.x_offset);
        }
        if self.curve_enabled {
            ret += curve * (bin - self.x_offset).powi(2);
        }
        ret
    }

    pub fn eval(&self, bin: f64) -> f64 {
        self.eval_with(bin, self.base.val(), self.slope.val(), self.curve.val())
    }

    pub fn eval_at(&self, bin: f64, fit: &DVector<f64>) -> f64 {
        self.eval_with(
            bin,
            self.base.val_from(fit),
            self.slope.val_from(fit),
            self.curve.val_from(fit),
        )
    }

    /// Evaluate while accumulating coefficient gradients at their indices
    pub fn eval_grad(&self, bin: f64, grads: &mut DVector<f64>) -> f64 {
        let ret = self.eval(bin);
        if self.base.valid_index() {
            grads[self.base.index() as usize] += self.base.grad();
        }
        if self.slope_enabled && self.slope.valid_index() {
            grads[self.slope.index() as usize] += self.slope.grad() * (bin - self.x_offset);
        }
        if self.curve_enabled && self.curve.valid_index() {
            grads[self.curve.index() as usize] += self.curve.grad() * (bin - self.x_offset).powi(2);
        }
        ret
    }

    /// Evaluate a candidate fit vector while accumulating gradients
    pub fn eval_grad_at(&self, bin: f64, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
        let ret = self.eval_at(bin, fit);
        if self.base.valid_index() {
            grads[self.base.index() as usize] += self.base.grad_from(fit);
        }
        if self.slope_enabled && self.slope.valid_index() {
            grads[self.slope.index() as usize] += self.slope.grad_from(fit) * (bin - self.x_offset);
        }
        if self.curve_enabled && self.curve.valid_index() {
            grads[self.curve.index() as usize] +=
                self.curve.grad_from(fit) * (bin - self.x_offset).powi(2);
        }
        ret
    }

    /// Add the background curve onto an existing rendering
    pub fn eval_add(&self, bins: &[f64], vals: &mut [f64]) {
        for (bin, val) in bins.iter().zip(vals.iter_mut()) {
            *val += self.eval(*bin);
        }
    }

    /// No fitted coefficient may sit at a bound extremum
    pub fn sane(&self) -> bool {
        if self.base.to_fit && self.base.at_extremum(1e-5, 1e-5) {
            return false;
        }
        if self.slope_enabled && self.slope.to_fit && self.slope.at_extremum(1e-5, 1e-5) {
            return false;
        }
        if self.curve_enabled && self.curve.to_fit && self.curve.at_extremum(1e-5, 1e-5) {
            return false;
        }
        true
    }
}
