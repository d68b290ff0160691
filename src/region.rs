//! One region of interest: a contiguous slice of spectrum, two edge
//! samples, a background model and the peaks between them.
//!
//! The region is also the optimizer objective: its weighted chi-square and
//! analytic gradient are assembled from the background and every peak,
//! against one shared variable vector indexed in a fixed traversal order.
use log::trace;
use nalgebra::DVector;

use thiserror::Error;

use crate::background::PolyBackground;
use crate::data::WeightedData;
use crate::hypermet::Peak;
use crate::optimizer::{FitObjective, FitResult};
use crate::sum4::{sum4_background, Sum4, Sum4Edge, Sum4Error};

/// All the ways region construction and editing can fail
#[derive(Debug, Clone, Error)]
pub enum RegionError {
    #[error("A region cannot be built from empty data")]
    EmptyData,
    #[error("Bad region edges: {0}")]
    Edges(#[from] Sum4Error),
}

/// A region of interest over `[left, right]` with its model state
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    data: WeightedData,
    pub lb: Sum4Edge,
    pub rb: Sum4Edge,
    pub background: PolyBackground,
    /// Template supplying width/tail/step settings to new peaks
    pub default_peak: Peak,
    peaks: Vec<Peak>,
    variable_count: i32,
}

impl Region {
    /// Build a region over `data` flanked by two valid edge samples; the
    /// background is seeded from the edges
    pub fn new(
        data: WeightedData,
        lb: Sum4Edge,
        rb: Sum4Edge,
        default_peak: Peak,
    ) -> Result<Self, RegionError> {
        if data.is_empty() {
            return Err(RegionError::EmptyData);
        }
        sum4_background(&lb, &rb)?;
        let background = PolyBackground::from_data(&data, &lb, &rb);
        Ok(Self {
            data,
            lb,
            rb,
            background,
            default_peak,
            peaks: Vec::new(),
            variable_count: 0,
        })
    }

    /// Reassemble a region from persisted parts against re-supplied data
    pub(crate) fn from_parts(
        data: WeightedData,
        lb: Sum4Edge,
        rb: Sum4Edge,
        background: PolyBackground,
        default_peak: Peak,
        mut peaks: Vec<Peak>,
    ) -> Result<Self, RegionError> {
        if data.is_empty() {
            return Err(RegionError::EmptyData);
        }
        peaks.sort_by(|a, b| a.id().total_cmp(&b.id()));
        Ok(Self {
            data,
            lb,
            rb,
            background,
            default_peak,
            peaks,
            variable_count: 0,
        })
    }

    pub fn data(&self) -> &WeightedData {
        &self.data
    }

    pub fn left(&self) -> f64 {
        self.data.first_chan()
    }

    pub fn right(&self) -> f64 {
        self.data.last_chan()
    }

    /// Width in channels, 0 when empty
    pub fn width(&self) -> f64 {
        if self.data.is_empty() {
            0.0
        } else {
            self.right() - self.left() + 1.0
        }
    }

    /// Bin-range intersection test
    pub fn overlaps(&self, left: f64, right: f64) -> bool {
        let (l, r) = (left.min(right), left.max(right));
        (self.left() <= r) && (l <= self.right())
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn peak_count(&self) -> usize {
        self.peaks.len()
    }

    pub fn contains(&self, peak_id: f64) -> bool {
        self.peak(peak_id).is_some()
    }

    pub fn peak(&self, peak_id: f64) -> Option<&Peak> {
        self.peaks.iter().find(|p| p.id().total_cmp(&peak_id).is_eq())
    }

    fn peak_index(&self, peak_id: f64) -> Option<usize> {
        self.peaks.iter().position(|p| p.id().total_cmp(&peak_id).is_eq())
    }

    fn sort_peaks(&mut self) {
        self.peaks.sort_by(|a, b| a.id().total_cmp(&b.id()));
    }

    /// Adopt a full peak set wholesale (used when merging regions)
    pub(crate) fn adopt_peaks(&mut self, peaks: impl IntoIterator<Item = Peak>) {
        self.peaks.extend(peaks);
        self.sort_peaks();
    }

    /// Create a peak centered between `left` and `right` with the given
    /// height guess above background.
    ///
    /// Returns false, leaving the region untouched, when the guess carries
    /// no significant signal or the range is not inside the region.
    pub fn add_peak(&mut self, left: f64, right: f64, height: f64) -> bool {
        if !(left < right) || (left < self.left()) || (self.right() < right) {
            return false;
        }
        if !height.is_finite() || (height <= 0.0) {
            return false;
        }

        let mut peak = self.default_peak.clone();
        peak.position = crate::param::FitParam::sine_bounded(0.5 * (left + right), left, right);
        peak.amplitude = crate::param::FitParam::positive(height);
        peak.sum4 = Sum4::new(&self.data.subset(left, right), &self.lb, &self.rb)
            .unwrap_or_default();

        trace!(
            "add_peak at {} amplitude {height} in [{left}, {right}]",
            peak.id()
        );
        self.peaks.push(peak);
        self.sort_peaks();
        true
    }

    /// Remove every peak whose identity appears in `ids`
    pub fn remove_peaks(&mut self, ids: &[f64]) -> bool {
        let before = self.peaks.len();
        self.peaks
            .retain(|p| !ids.iter().any(|id| p.id().total_cmp(id).is_eq()));
        before != self.peaks.len()
    }

    /// Swap in an edited peak model, keeping the analytic summary
    pub fn replace_hypermet(&mut self, peak_id: f64, mut hyp: Peak) -> bool {
        let Some(idx) = self.peak_index(peak_id) else {
            return false;
        };
        hyp.sum4 = self.peaks[idx].sum4;
        self.peaks[idx] = hyp;
        self.sort_peaks();
        true
    }

    /// Recompute one peak's analytic summary over new bounds
    pub fn adjust_sum4(&mut self, peak_id: f64, left: f64, right: f64) -> bool {
        let Some(idx) = self.peak_index(peak_id) else {
            return false;
        };
        match Sum4::new(&self.data.subset(left, right), &self.lb, &self.rb) {
            Ok(sum4) => {
                self.peaks[idx].sum4 = sum4;
                true
            }
            Err(_) => false,
        }
    }

    /// Atomically swap the region's data and both edges, re-seeding the
    /// background.
    ///
    /// Callers must ensure peaks remain inside the new bounds, widening the
    /// region first when necessary.
    pub fn replace_data(
        &mut self,
        data: WeightedData,
        lb: Sum4Edge,
        rb: Sum4Edge,
    ) -> Result<(), RegionError> {
        if data.is_empty() {
            return Err(RegionError::EmptyData);
        }
        sum4_background(&lb, &rb)?;
        self.background = PolyBackground::from_data(&data, &lb, &rb);
        self.data = data;
        self.lb = lb;
        self.rb = rb;
        Ok(())
    }

    /// Full model at a channel: background plus every peak
    pub fn model(&self, chan: f64) -> f64 {
        let mut ret = self.background.eval(chan);
        for peak in &self.peaks {
            ret += peak.eval(chan).all();
        }
        ret
    }

    /// Background-like terms only: the polynomial plus step/long-tail
    /// contributions
    pub fn model_background(&self, chan: f64) -> f64 {
        let mut ret = self.background.eval(chan);
        for peak in &self.peaks {
            ret += peak.eval(chan).step_tail();
        }
        ret
    }

    /// Render the region's fit and background curves over its own channels
    pub fn render(&self) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let chan = self.data.chan.clone();
        let fit = chan.iter().map(|&c| self.model(c)).collect();
        let background = chan.iter().map(|&c| self.model_background(c)).collect();
        (chan, fit, background)
    }

    /// Model at a channel against a candidate fit vector
    fn model_at(&self, chan: f64, fit: &DVector<f64>) -> f64 {
        let mut ret = self.background.eval_at(chan, fit);
        for peak in &self.peaks {
            ret += peak.eval_at(chan, fit).all();
        }
        ret
    }

    /// Assign fit-vector slots: every peak in position order (position →
    /// amplitude → width → tails → step each), then the background
    pub fn update_indices(&mut self) {
        let mut counter = 0;
        for peak in &mut self.peaks {
            peak.update_indices(&mut counter);
        }
        self.background.update_indices(&mut counter);
        self.variable_count = counter;
    }

    pub fn variable_count(&self) -> i32 {
        self.variable_count
    }

    pub fn degrees_of_freedom(&self) -> f64 {
        ((self.data.len() as f64) - (self.variable_count as f64)).max(1.0)
    }

    /// Weighted chi-square at the current parameter state
    pub fn chi_sq(&self) -> f64 {
        let mut chi = 0.0;
        for i in 0..self.data.len() {
            let resid = (self.data.count[i] - self.model(self.data.chan[i])) / self.data.weight[i];
            chi += resid * resid;
        }
        chi
    }

    pub fn chi_sq_norm(&self) -> f64 {
        self.chi_sq() / self.degrees_of_freedom()
    }

    /// Adopt optimized variables into every parameter
    pub fn save_fit(&mut self, fit: &DVector<f64>) {
        for peak in &mut self.peaks {
            peak.get(fit);
        }
        self.background.get(fit);
        self.sort_peaks();
    }

    /// Adopt an optimizer result including propagated uncertainties
    pub fn save_fit_uncerts(&mut self, result: &FitResult) {
        self.save_fit(&result.variables);

        if result.inv_hessian.nrows() != self.variable_count as usize {
            return;
        }
        let dof = self.degrees_of_freedom();
        let diags = DVector::from_iterator(
            result.inv_hessian.nrows(),
            result.inv_hessian.diagonal().iter().map(|d| d * dof),
        );
        let chisq_norm = self.chi_sq_norm();
        for peak in &mut self.peaks {
            peak.get_uncerts(&diags, chisq_norm);
            peak.chi_sq_norm = chisq_norm;
        }
        self.background.get_uncerts(&diags, chisq_norm);
    }

    /// Whether the fitted state passes all sanity checks
    pub fn sane(&self) -> bool {
        if !self.background.sane() {
            return false;
        }
        self.peaks
            .iter()
            .all(|p| p.sanity_check(self.left(), self.right()))
    }
}

impl FitObjective for Region {
    fn variables(&self) -> DVector<f64> {
        let mut fit = DVector::from_element(self.variable_count.max(0) as usize, 0.0);
        for peak in &self.peaks {
            peak.put(&mut fit);
        }
        self.background.put(&mut fit);
        fit
    }

    fn eval(&self, fit: &DVector<f64>) -> f64 {
        let mut chi = 0.0;
        for i in 0..self.data.len() {
            let resid =
                (self.data.count[i] - self.model_at(self.data.chan[i], fit)) / self.data.weight[i];
            chi += resid * resid;
        }
        chi
    }

    fn eval_grad(&self, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
        let mut chi = 0.0;
        let mut point_grads = DVector::from_element(grads.len(), 0.0);
        for i in 0..self.data.len() {
            point_grads.fill(0.0);
            let chan = self.data.chan[i];
            let mut model = self.background.eval_grad_at(chan, fit, &mut point_grads);
            for peak in &self.peaks {
                model += peak.eval_grad_at(chan, fit, &mut point_grads).all();
            }
            let weight_sq = self.data.weight[i] * self.data.weight[i];
            let delta = self.data.count[i] - model;
            chi += delta * delta / weight_sq;
            let scale = -2.0 * delta / weight_sq;
            grads.axpy(scale, &point_grads, 1.0);
        }
        chi
    }
}
