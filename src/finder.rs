//! Convolution-based peak-candidate detection (the "KON" filter).
//!
//! A sliding-window second difference is computed over the residual
//! spectrum and normalized by the local count level; bins whose normalized
//! statistic exceeds a significance threshold become preliminary hits, and
//! contiguous runs of hits become candidate intervals. Interval edges are
//! then pushed outward either by a statistical walk over the convolution
//! statistic or, when a theoretical per-bin FWHM curve is available, by a
//! fixed multiple of that width. Both modes are deliberate and selectable.
use log::debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::lower_bound;

/// All the ways candidate detection can fail
#[derive(Debug, Clone, Error)]
pub enum FinderError {
    #[error("The channel and count arrays do not match in length ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error("The spectrum is empty")]
    Empty,
    #[error("The theoretical width curve does not match the spectrum length")]
    WidthCurveMismatch,
}

/// Detection thresholds for the KON filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KonSettings {
    /// Half-width of the second-difference window, in bins
    pub width: usize,
    /// Significance threshold against the raw spectrum
    pub sigma_spectrum: f64,
    /// Significance threshold against residuals once a fit is present
    pub sigma_resid: f64,
    /// Edge extension, in theoretical FWHMs, used when a width curve is set
    pub edge_width_factor: f64,
}

impl Default for KonSettings {
    fn default() -> Self {
        Self {
            width: 4,
            sigma_spectrum: 3.0,
            sigma_resid: 3.0,
            edge_width_factor: 3.5,
        }
    }
}

impl KonSettings {
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn sigma_spectrum(mut self, sigma: f64) -> Self {
        self.sigma_spectrum = sigma;
        self
    }

    pub fn sigma_resid(mut self, sigma: f64) -> Self {
        self.sigma_resid = sigma;
        self
    }

    pub fn edge_width_factor(mut self, factor: f64) -> Self {
        self.edge_width_factor = factor;
        self
    }
}

/// One candidate interval flagged by the filter
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DetectedPeak {
    pub left: f64,
    pub right: f64,
    pub center: f64,
    pub highest_y: f64,
}

/// The candidate finder: holds the spectrum, any fit overlays, the
/// convolution statistic and the detected candidate intervals.
#[derive(Debug, Default, Clone)]
pub struct Finder {
    pub x: Vec<f64>,
    pub y: Vec<f64>,

    pub y_fit: Vec<f64>,
    pub y_background: Vec<f64>,
    pub y_resid: Vec<f64>,
    pub y_resid_on_background: Vec<f64>,

    pub y_kon: Vec<f64>,
    pub y_convolution: Vec<f64>,

    pub prelim: Vec<usize>,
    pub filtered: Vec<DetectedPeak>,

    theoretical_fw: Option<Vec<f64>>,
    residual_mode: bool,
    settings: KonSettings,
}

impl Finder {
    /// Run detection over a fresh spectrum
    pub fn new(x: Vec<f64>, y: Vec<f64>, settings: KonSettings) -> Result<Self, FinderError> {
        if x.len() != y.len() {
            return Err(FinderError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        if x.is_empty() {
            return Err(FinderError::Empty);
        }
        let mut finder = Self {
            x,
            y,
            settings,
            ..Default::default()
        };
        finder.reset();
        finder.calc_kon();
        finder.find_peaks();
        Ok(finder)
    }

    pub fn settings(&self) -> &KonSettings {
        &self.settings
    }

    pub fn empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Discard fit overlays: residuals equal the data again
    pub fn reset(&mut self) {
        self.y_resid = self.y.clone();
        self.y_resid_on_background = self.y.clone();
        self.y_fit = vec![0.0; self.x.len()];
        self.y_background = vec![0.0; self.x.len()];
        self.residual_mode = false;
    }

    /// Install a theoretical per-bin FWHM curve; edge extension switches
    /// from the statistical walk to a fixed multiple of this width
    pub fn set_theoretical_fw(&mut self, fw: Vec<f64>) -> Result<(), FinderError> {
        if fw.len() != self.x.len() {
            return Err(FinderError::WidthCurveMismatch);
        }
        self.theoretical_fw = Some(fw);
        self.calc_kon();
        self.find_peaks();
        Ok(())
    }

    /// Overlay a fit and its background on a sub-range of the spectrum,
    /// recompute residuals and re-run detection on them.
    ///
    /// Returns false (leaving state untouched) when the overlay arrays do
    /// not line up with the held spectrum.
    pub fn set_fit(&mut self, x_fit: &[f64], y_fit: &[f64], y_background: &[f64]) -> bool {
        if (x_fit.len() != y_fit.len()) || (x_fit.len() != y_background.len()) || x_fit.is_empty()
        {
            return false;
        }

        let l = self.find_index(x_fit[0]);
        let r = self.find_index(x_fit[x_fit.len() - 1]);
        if (r - l + 1) != x_fit.len() {
            return false;
        }

        for i in 0..x_fit.len() {
            self.y_fit[l + i] = y_fit[i];
            self.y_background[l + i] = y_background[i];
            let resid = self.y[l + i] - y_fit[i];
            self.y_resid[l + i] = resid;
            self.y_resid_on_background[l + i] = y_background[i] + resid;
        }
        self.residual_mode = true;

        self.calc_kon();
        self.find_peaks();
        true
    }

    fn sigma(&self) -> f64 {
        if self.residual_mode {
            self.settings.sigma_resid
        } else {
            self.settings.sigma_spectrum
        }
    }

    /// Compute the second-difference convolution and flag preliminary hits
    fn calc_kon(&mut self) {
        let n = self.x.len();
        let width = self.settings.width.max(2);
        let sigma = self.sigma();

        let mut start = width;
        let mut end = n as isize - 1 - 2 * width as isize;

        if let Some(fw) = &self.theoretical_fw {
            for (i, w) in fw.iter().enumerate() {
                if w.ceil() < i as f64 {
                    start = i;
                    break;
                }
            }
            for i in (0..fw.len()).rev() {
                if 2.0 * fw[i].ceil() + i as f64 + 1.0 < fw.len() as f64 {
                    end = i as isize;
                    break;
                }
            }
        }

        self.y_kon = vec![0.0; n];
        self.y_convolution = vec![0.0; n];
        self.prelim.clear();

        let mut j = start;
        while (j as isize) < end {
            let mut w = width;
            if let Some(fw) = &self.theoretical_fw {
                w = (fw[j].floor() as usize).max(2);
            }
            let shift = w / 2;
            if (j < w) || (j + 2 * w + 1 >= n) {
                j += 1;
                continue;
            }

            let mut kon = 0.0;
            let mut avg = 0.0;
            for i in j..=(j + w + 1) {
                kon += 2.0 * self.y_resid[i] - self.y_resid[i - w] - self.y_resid[i + w];
                avg += self.y_resid[i];
            }
            avg /= w as f64;

            // a degenerate normalizer means "no candidate", never a NaN
            let norm = 6.0 * w as f64 * avg;
            let conv = if norm > 0.0 { kon / norm.sqrt() } else { 0.0 };
            self.y_kon[j + shift] = kon;
            self.y_convolution[j + shift] = conv;

            if conv > sigma {
                self.prelim.push(j + shift);
            }
            j += 1;
        }
    }

    /// Merge contiguous preliminary hits into candidate intervals and
    /// extend their edges
    fn find_peaks(&mut self) {
        self.filtered.clear();
        if self.prelim.is_empty() {
            return;
        }

        // find edges of contiguous hit runs (gap <= 1)
        let mut lefts = vec![self.prelim[0]];
        let mut rights = Vec::new();
        let mut prev = self.prelim[0];
        for &current in &self.prelim {
            if current > prev + 1 {
                rights.push(prev);
                lefts.push(current);
            }
            prev = current;
        }
        rights.push(prev);

        for (&lhit, &rhit) in lefts.iter().zip(rights.iter()) {
            let l = self.left_edge(lhit);
            let r = self.right_edge(rhit);
            let mut p = DetectedPeak {
                left: self.x[l],
                right: self.x[r],
                ..Default::default()
            };
            for j in l..=r {
                p.highest_y = p.highest_y.max(self.y_resid[j]);
            }
            p.center = 0.5 * (p.left + p.right);
            self.filtered.push(p);
        }
        debug!(
            "KON found {} candidate interval(s) from {} hits",
            self.filtered.len(),
            self.prelim.len()
        );
    }

    fn left_edge(&self, mut idx: usize) -> usize {
        if self.y_convolution.is_empty() || idx >= self.y_convolution.len() {
            return 0;
        }

        if let Some(fw) = &self.theoretical_fw {
            let width = fw[idx].floor();
            let goal = self.x[idx] - 0.5 * width * self.settings.edge_width_factor;
            while (idx > 0) && (self.x[idx] > goal) {
                idx -= 1;
            }
            return idx;
        }

        let edge_threshold = -0.5 * self.sigma();
        while (idx > 0) && (self.y_convolution[idx] >= 0.0) {
            idx -= 1;
        }
        if idx > 0 {
            idx -= 1;
        }
        while (idx > 0) && (self.y_convolution[idx] < edge_threshold) {
            idx -= 1;
        }
        idx
    }

    fn right_edge(&self, mut idx: usize) -> usize {
        let n = self.y_convolution.len();
        if n == 0 || idx >= n {
            return 0;
        }

        if let Some(fw) = &self.theoretical_fw {
            let width = fw[idx].floor();
            let goal = self.x[idx] + 0.5 * width * self.settings.edge_width_factor;
            while (idx + 1 < n) && (self.x[idx] < goal) {
                idx += 1;
            }
            return idx;
        }

        let edge_threshold = -0.5 * self.sigma();
        while (idx < n) && (self.y_convolution[idx] >= 0.0) {
            idx += 1;
        }
        if idx < n {
            idx += 1;
        }
        while (idx < n) && (self.y_convolution[idx] < edge_threshold) {
            idx += 1;
        }
        idx.min(n - 1)
    }

    /// Walk out to the statistical left edge of the structure containing
    /// `chan`
    pub fn find_left(&self, chan: f64) -> f64 {
        if self.x.is_empty() {
            return 0.0;
        }
        if (chan < self.x[0]) || (chan >= self.x[self.x.len() - 1]) {
            return self.x[0];
        }
        self.x[self.left_edge(self.find_index(chan))]
    }

    /// Walk out to the statistical right edge of the structure containing
    /// `chan`
    pub fn find_right(&self, chan: f64) -> f64 {
        if self.x.is_empty() {
            return 0.0;
        }
        if (chan < self.x[0]) || (chan >= self.x[self.x.len() - 1]) {
            return self.x[self.x.len() - 1];
        }
        self.x[self.right_edge(self.find_index(chan))]
    }

    /// Index of the first bin at or past `chan`
    pub fn find_index(&self, chan: f64) -> usize {
        lower_bound(&self.x, chan)
    }

    /// The candidate with the largest residual maximum
    pub fn tallest_detected(&self) -> Option<&DetectedPeak> {
        self.filtered
            .iter()
            .max_by(|a, b| a.highest_y.total_cmp(&b.highest_y))
    }

    /// Largest residual value with channel in `[left, right]`
    pub fn highest_residual(&self, left: f64, right: f64) -> f64 {
        let mut highest = 0.0f64;
        for i in 0..self.x.len() {
            if (self.x[i] >= left) && (self.x[i] <= right) {
                highest = highest.max(self.y_resid[i]);
            }
        }
        highest
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::synthetic_gaussian;

    #[test]
    fn rejects_mismatched_input() {
        assert!(matches!(
            Finder::new(vec![0.0], vec![], KonSettings::default()),
            Err(FinderError::LengthMismatch { .. })
        ));
        assert!(matches!(
            Finder::new(vec![], vec![], KonSettings::default()),
            Err(FinderError::Empty)
        ));
    }

    #[test]
    fn flat_spectrum_has_no_candidates() {
        let x: Vec<f64> = (0..200).map(|i| i as f64).collect();
        let y = vec![50.0; 200];
        let finder = Finder::new(x, y, KonSettings::default()).unwrap();
        assert!(finder.filtered.is_empty());
    }

    #[test]
    fn single_gaussian_yields_one_bracketing_candidate() {
        let (x, y) = synthetic_gaussian(200, 100.0, 1000.0, 3.5, 20.0);
        let finder = Finder::new(x, y, KonSettings::default()).unwrap();

        assert_eq!(finder.filtered.len(), 1);
        let p = &finder.filtered[0];
        assert!(p.left < 100.0 && 100.0 < p.right, "{} {}", p.left, p.right);
        assert!((p.highest_y - 1020.0).abs() < 1.0);
    }

    #[test]
    fn two_separated_gaussians_yield_two_candidates() {
        let (x, mut y) = synthetic_gaussian(400, 100.0, 1000.0, 3.5, 20.0);
        let (_, y2) = synthetic_gaussian(400, 300.0, 800.0, 3.5, 0.0);
        for (a, b) in y.iter_mut().zip(y2.iter()) {
            *a += b;
        }
        let finder = Finder::new(x, y, KonSettings::default()).unwrap();

        assert_eq!(finder.filtered.len(), 2);
        assert!(finder.filtered[0].left < 100.0 && 100.0 < finder.filtered[0].right);
        assert!(finder.filtered[1].left < 300.0 && 300.0 < finder.filtered[1].right);
        let tallest = finder.tallest_detected().unwrap();
        assert!(tallest.left < 100.0 && 100.0 < tallest.right);
    }

    #[test]
    fn theoretical_width_mode_extends_by_fixed_multiple() {
        let (x, y) = synthetic_gaussian(200, 100.0, 1000.0, 3.5, 20.0);
        let mut finder = Finder::new(x, y, KonSettings::default()).unwrap();
        assert!(matches!(
            finder.set_theoretical_fw(vec![5.0; 10]),
            Err(FinderError::WidthCurveMismatch)
        ));

        finder.set_theoretical_fw(vec![5.0; 200]).unwrap();
        assert_eq!(finder.filtered.len(), 1);
        let p = &finder.filtered[0];
        // edges move a fixed multiple of the theoretical width outward from
        // the hit run, well clear of the true center
        assert!(p.left < 100.0 - 5.0 && 100.0 + 5.0 < p.right);
    }

    #[test]
    fn perfect_fit_overlay_silences_detection() {
        let (x, y) = synthetic_gaussian(200, 100.0, 1000.0, 3.5, 20.0);
        let finder = Finder::new(x.clone(), y.clone(), KonSettings::default()).unwrap();
        assert_eq!(finder.filtered.len(), 1);

        let mut finder = finder;
        let background = vec![20.0; 200];
        assert!(finder.set_fit(&x, &y, &background));
        assert!(finder.filtered.is_empty());
        // residuals are flat zero now
        assert!(finder.y_resid.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn set_fit_rejects_misaligned_overlay() {
        let (x, y) = synthetic_gaussian(200, 100.0, 1000.0, 3.5, 20.0);
        let mut finder = Finder::new(x, y, KonSettings::default()).unwrap();
        assert!(!finder.set_fit(&[0.0, 1.0], &[0.0], &[0.0]));
        assert!(!finder.set_fit(&[0.0, 5.0], &[0.0, 0.0], &[0.0, 0.0]));
    }

    #[test]
    fn highest_residual_scans_range() {
        let (x, y) = synthetic_gaussian(200, 100.0, 1000.0, 3.5, 20.0);
        let finder = Finder::new(x, y, KonSettings::default()).unwrap();
        assert!((finder.highest_residual(90.0, 110.0) - 1020.0).abs() < 1.0);
        assert!((finder.highest_residual(0.0, 50.0) - 20.0).abs() < 1.0);
    }
}
