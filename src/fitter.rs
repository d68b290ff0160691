//! Top-level orchestration: spectrum ingestion, region discovery and
//! editing, fit dispatch and the merged spectrum-wide view.
use std::fmt;
use std::fs;
use std::io::{self, Write};

use log::{debug, info};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::background::PolyBackground;
use crate::calibration::{EnergyCalibration, FwhmCalibration};
use crate::data::{DataError, WeightedData};
use crate::finder::{Finder, FinderError};
use crate::hypermet::Peak;
use crate::optimizer::Optimizer;
use crate::region::{Region, RegionError};
use crate::roi::RegionManager;
use crate::search::lower_bound;
use crate::settings::FitSettings;
use crate::sum4::Sum4Edge;

/// All the ways fitter-level operations can fail
#[derive(Debug, Error)]
pub enum FitterError {
    #[error("The spectrum contains no counts")]
    EmptySpectrum,
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Finder(#[from] FinderError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Sum4(#[from] crate::sum4::Sum4Error),
    #[error("Snapshot refers to region [{left}, {right}] not present in the spectrum")]
    SnapshotMismatch { left: f64, right: f64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The merged spectrum-wide view: data, composited fit, composited
/// background and residual, recomputed in full after every mutation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FitEvaluation {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub y_fit: Vec<f64>,
    pub y_background: Vec<f64>,
    pub y_resid: Vec<f64>,
}

impl FitEvaluation {
    fn with_data(x: Vec<f64>, y: Vec<f64>) -> Self {
        let mut eval = Self {
            x,
            y,
            ..Default::default()
        };
        eval.reset();
        eval
    }

    /// Zero the overlays; residuals equal the data again
    fn reset(&mut self) {
        self.y_fit = vec![0.0; self.x.len()];
        self.y_background = vec![0.0; self.x.len()];
        self.y_resid = self.y.clone();
    }

    /// Composite one region's rendering into the merged arrays
    fn merge(&mut self, chan: &[f64], fit: &[f64], background: &[f64]) {
        if chan.is_empty() {
            return;
        }
        let offset = lower_bound(&self.x, chan[0]);
        for k in 0..chan.len() {
            let i = offset + k;
            if i >= self.x.len() {
                break;
            }
            self.y_fit[i] = fit[k];
            self.y_background[i] = background[k];
            self.y_resid[i] = self.y[i] - fit[k];
        }
    }

    /// Largest residual with channel in `[left, right]`
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

/// Persisted form of one region: bin bounds, edge-sample bounds and model
/// state, but no raw histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub left: f64,
    pub right: f64,
    pub lb: (f64, f64),
    pub rb: (f64, f64),
    pub background: PolyBackground,
    pub default_peak: Peak,
    pub peaks: Vec<Peak>,
}

/// Persisted form of a whole fitter.
///
/// Deserialization requires the original spectrum to be re-supplied through
/// [`Fitter::from_snapshot`]; the snapshot never embeds the raw histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitterSnapshot {
    pub settings: FitSettings,
    pub live_time_s: f64,
    pub name: String,
    pub detectors: Vec<String>,
    pub regions: Vec<RegionSnapshot>,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "parallelism")] {
        fn render_regions(regions: &[RegionManager]) -> Vec<(Vec<f64>, Vec<f64>, Vec<f64>)> {
            use rayon::prelude::*;
            regions.par_iter().map(|r| r.region().render()).collect()
        }
    } else {
        fn render_regions(regions: &[RegionManager]) -> Vec<(Vec<f64>, Vec<f64>, Vec<f64>)> {
            regions.iter().map(|r| r.region().render()).collect()
        }
    }
}

/// The region-based spectrum fitter.
///
/// Owns the full weighted histogram, the global settings and a collection
/// of [`RegionManager`]s keyed by region identity. All mutation entry
/// points return booleans or identifiers reflecting success and leave
/// previous state untouched on failure; the merged view is recomputed in
/// full after every mutating operation.
pub struct Fitter {
    pub settings: FitSettings,
    pub name: String,
    pub detectors: Vec<String>,

    weighted: WeightedData,
    eval: FitEvaluation,
    regions: Vec<RegionManager>,
    live_time_s: f64,

    energy_cal: Option<Box<dyn EnergyCalibration + Send + Sync>>,
    fwhm_cal: Option<Box<dyn FwhmCalibration + Send + Sync>>,
}

impl fmt::Debug for Fitter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fitter")
            .field("name", &self.name)
            .field("bins", &self.eval.x.len())
            .field("regions", &self.regions.len())
            .field("live_time_s", &self.live_time_s)
            .finish()
    }
}

impl Fitter {
    pub fn new(settings: FitSettings) -> Self {
        Self {
            settings,
            name: String::new(),
            detectors: Vec::new(),
            weighted: WeightedData::default(),
            eval: FitEvaluation::default(),
            regions: Vec::new(),
            live_time_s: 0.0,
            energy_cal: None,
            fwhm_cal: None,
        }
    }

    /// Ingest a one-dimensional count histogram, trimming it to the first
    /// and last non-zero bin. Channel numbers stay global.
    pub fn set_data(&mut self, counts: &[f64], live_time_s: f64) -> Result<(), FitterError> {
        let first = counts
            .iter()
            .position(|&c| c > 0.0)
            .ok_or(FitterError::EmptySpectrum)?;
        let last = counts.iter().rposition(|&c| c > 0.0).unwrap();

        let x: Vec<f64> = (first..=last).map(|i| i as f64).collect();
        let y: Vec<f64> = counts[first..=last].to_vec();

        self.weighted = WeightedData::new(x.clone(), y.clone(), self.settings.weight_policy)?;
        self.eval = FitEvaluation::with_data(x, y);
        self.regions.clear();
        self.live_time_s = live_time_s;
        info!(
            "ingested spectrum: {} bins in [{first}, {last}], live time {live_time_s}s",
            last - first + 1
        );
        Ok(())
    }

    pub fn set_energy_calibration(&mut self, cal: Box<dyn EnergyCalibration + Send + Sync>) {
        self.energy_cal = Some(cal);
    }

    pub fn set_fwhm_calibration(&mut self, cal: Box<dyn FwhmCalibration + Send + Sync>) {
        self.fwhm_cal = Some(cal);
    }

    pub fn live_time_s(&self) -> f64 {
        self.live_time_s
    }

    pub fn fit_evaluation(&self) -> &FitEvaluation {
        &self.eval
    }

    pub fn empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[RegionManager] {
        &self.regions
    }

    pub fn contains_region(&self, id: f64) -> bool {
        self.region_index(id).is_some()
    }

    pub fn region(&self, id: f64) -> Option<&RegionManager> {
        self.region_index(id).map(|i| &self.regions[i])
    }

    fn region_index(&self, id: f64) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.id().total_cmp(&id).is_eq())
    }

    fn sort_regions(&mut self) {
        self.regions.sort_by(|a, b| a.id().total_cmp(&b.id()));
    }

    pub fn peak_count(&self) -> usize {
        self.regions.iter().map(|r| r.peak_count()).sum()
    }

    pub fn contains_peak(&self, peak_id: f64) -> bool {
        self.regions.iter().any(|r| r.contains(peak_id))
    }

    /// Every peak across all regions, in channel order
    pub fn peaks(&self) -> Vec<&Peak> {
        let mut peaks: Vec<&Peak> = self
            .regions
            .iter()
            .flat_map(|r| r.region().peaks().iter())
            .collect();
        peaks.sort_by(|a, b| a.id().total_cmp(&b.id()));
        peaks
    }

    pub fn parent_region(&self, peak_id: f64) -> Option<&RegionManager> {
        self.regions.iter().find(|r| r.contains(peak_id))
    }

    /// Identities of all regions intersecting `[left, right]`
    pub fn relevant_regions(&self, left: f64, right: f64) -> Vec<f64> {
        self.regions
            .iter()
            .filter(|r| r.region().overlaps(left, right))
            .map(|r| r.id())
            .collect()
    }

    /// Whether an interval's right edge survives the low-energy cutoff
    fn above_cutoff(&self, right: f64) -> bool {
        match &self.energy_cal {
            Some(cal) => cal.transform(right) > self.settings.finder_cutoff_kev,
            None => true,
        }
    }

    /// Theoretical per-bin FWHM curve when both calibrations are available
    fn theoretical_fw(&self) -> Option<Vec<f64>> {
        let energy = self.energy_cal.as_deref()?;
        let fwhm = self.fwhm_cal.as_deref()?;
        Some(
            self.eval
                .x
                .iter()
                .map(|&chan| {
                    let nrg = energy.transform(chan);
                    let fw = fwhm.fwhm(nrg);
                    energy.inverse(nrg + fw / 2.0) - energy.inverse(nrg - fw / 2.0)
                })
                .collect(),
        )
    }

    /// Build a region over `[left, right]` with fresh edge samples, or None
    /// when the range is too narrow
    fn build_region(&self, left: f64, right: f64) -> Option<Region> {
        let data = self.weighted.subset(left, right);
        let samples = self.settings.edge_samples.max(1);
        if data.len() < 2 * samples + 3 {
            return None;
        }
        let lb = Sum4Edge::new(&data.left(samples)).ok()?;
        let rb = Sum4Edge::new(&data.right(samples)).ok()?;
        Region::new(data, lb, rb, self.settings.default_peak.clone()).ok()
    }

    /// Seed a fresh region with peak guesses from a finder pass over its
    /// own sub-range
    fn guess_peaks(&self, manager: &mut RegionManager) {
        let mut region = manager.region().clone();
        let Ok(finder) = Finder::new(
            region.data().chan.clone(),
            region.data().count.clone(),
            self.settings.kon,
        ) else {
            return;
        };

        let mut added = false;
        for candidate in &finder.filtered {
            let mut height = finder.highest_residual(candidate.left, candidate.right);
            height -= region.background.eval(candidate.center);
            added |= region.add_peak(candidate.left, candidate.right, height);
        }
        if added {
            manager.modify_region(region, "Initial guess");
        }
    }

    /// Discover regions of interest over the whole spectrum.
    ///
    /// Candidate intervals closer than `2·width` (after a fixed margin)
    /// merge into one ROI, neighboring ROIs split flank space at the
    /// midpoint, and ROIs below the energy cutoff are discarded. Every ROI
    /// is seeded with edge samples and initial peak guesses.
    pub fn find_regions(&mut self) {
        self.regions.clear();
        if self.eval.x.is_empty() {
            return;
        }

        let Ok(mut finder) = Finder::new(
            self.eval.x.clone(),
            self.eval.y.clone(),
            self.settings.kon,
        ) else {
            return;
        };
        if let Some(fw) = self.theoretical_fw() {
            let _ = finder.set_theoretical_fw(fw);
        }
        if finder.filtered.is_empty() {
            self.render_all();
            return;
        }

        let margin = self.settings.kon.width as f64;
        let lo = self.eval.x[0];
        let hi = self.eval.x[self.eval.x.len() - 1];

        let mut intervals: Vec<(f64, f64)> = Vec::new();
        let mut bounds = finder.filtered[0];
        for p in &finder.filtered {
            if p.left < (bounds.right + 2.0 * margin) {
                bounds.left = bounds.left.min(p.left);
                bounds.right = bounds.right.max(p.right);
            } else {
                let (l, r) = ((bounds.left - margin).max(lo), (bounds.right + margin).min(hi));
                if self.above_cutoff(r) {
                    intervals.push((l, r));
                }
                bounds = *p;
            }
        }
        let (l, r) = ((bounds.left - margin).max(lo), (bounds.right + margin).min(hi));
        if self.above_cutoff(r) {
            intervals.push((l, r));
        }

        // neighboring ROIs share flank space at the midpoint instead of
        // overlapping
        for i in 0..intervals.len().saturating_sub(1) {
            if intervals[i].1 < intervals[i + 1].0 {
                let mid = 0.5 * (intervals[i].1 + intervals[i + 1].0);
                intervals[i].1 = mid - 1.0;
                intervals[i + 1].0 = mid + 1.0;
            }
        }

        for (left, right) in intervals {
            if let Some(region) = self.build_region(left, right) {
                if region.width() > 0.0 {
                    let mut manager = RegionManager::new(region);
                    self.guess_peaks(&mut manager);
                    self.regions.push(manager);
                }
            }
        }
        self.sort_regions();
        debug!("found {} region(s)", self.regions.len());
        self.render_all();
    }

    /// Explicitly create one region over `[left, right]` with peak guesses
    pub fn create_region(&mut self, left: f64, right: f64) -> Option<f64> {
        let region = self.build_region(left, right)?;
        let mut manager = RegionManager::new(region);
        self.guess_peaks(&mut manager);
        let id = manager.id();
        self.regions.push(manager);
        self.sort_regions();
        self.render_all();
        Some(id)
    }

    pub fn delete_roi(&mut self, id: f64) -> bool {
        let Some(idx) = self.region_index(id) else {
            return false;
        };
        self.regions.remove(idx);
        self.render_all();
        true
    }

    pub fn clear_all_rois(&mut self) {
        self.regions.clear();
        self.render_all();
    }

    /// Replace a region's state wholesale (an externally edited region)
    pub fn override_region(&mut self, id: f64, region: Region, reason: &str) -> bool {
        let Some(idx) = self.region_index(id) else {
            return false;
        };
        self.regions[idx].modify_region(region, reason);
        self.sort_regions();
        self.render_all();
        true
    }

    /// Merge two regions into one spanning both ranges and owning the union
    /// of their peak sets. Returns the new region's identity.
    pub fn merge_regions(&mut self, id1: f64, id2: f64) -> Option<f64> {
        let i1 = self.region_index(id1)?;
        let i2 = self.region_index(id2)?;
        if i1 == i2 {
            return None;
        }

        let r1 = self.regions[i1].region().clone();
        let r2 = self.regions[i2].region().clone();
        let mut merged =
            self.build_region(r1.left().min(r2.left()), r1.right().max(r2.right()))?;
        merged.adopt_peaks(r1.peaks().iter().chain(r2.peaks().iter()).cloned());

        let mut manager = RegionManager::new(merged.clone());
        manager.modify_region(merged, format!("Merged regions id1={id1} and id2={id2}"));

        self.regions
            .retain(|r| !(r.id().total_cmp(&id1).is_eq() || r.id().total_cmp(&id2).is_eq()));
        let id = manager.id();
        self.regions.push(manager);
        self.sort_regions();
        self.render_all();
        Some(id)
    }

    /// Insert a peak into a region, implicitly widening the region (with
    /// recomputed edges) when `[left, right]` exceeds its bounds. The peak
    /// is sized from the local residual maximum. Returns the (possibly
    /// changed) region identity.
    pub fn add_peak(&mut self, region_id: f64, left: f64, right: f64) -> Option<f64> {
        let idx = self.region_index(region_id)?;
        let mut region = self.regions[idx].region().clone();

        if (left < region.left()) || (region.right() < right) {
            let l = left.min(region.left());
            let r = right.max(region.right());
            let sub = self.weighted.subset(l, r);
            let samples = self.settings.edge_samples.max(1);

            let lb = if l < region.lb.left() {
                Sum4Edge::new(&sub.left(samples)).ok()?
            } else {
                region.lb
            };
            let rb = if r > region.right() {
                Sum4Edge::new(&sub.right(samples)).ok()?
            } else {
                region.rb
            };
            region.replace_data(sub, lb, rb).ok()?;
            self.regions[idx].modify_region(
                region.clone(),
                "Implicitly expanded region for adding peak",
            );
            self.sort_regions();
            self.render_all();
        }

        let current_id = region.left();
        let height = self.eval.highest_residual(left, right);
        if region.add_peak(left, right, height) {
            let idx = self.region_index(current_id)?;
            self.regions[idx].modify_region(region, "Added peak");
            self.render_all();
        }
        Some(current_id)
    }

    /// Remove peaks by identity across all regions
    pub fn remove_peaks(&mut self, ids: &[f64]) -> bool {
        let mut changed = false;
        for manager in &mut self.regions {
            let mut region = manager.region().clone();
            if region.remove_peaks(ids) {
                manager.modify_region(region, "Peaks removed");
                changed = true;
            }
        }
        if changed {
            self.render_all();
        }
        changed
    }

    /// Recompute one peak's analytic SUM4 summary over new bounds
    pub fn adjust_sum4(&mut self, peak_id: f64, left: f64, right: f64) -> bool {
        let Some(idx) = self.regions.iter().position(|r| r.contains(peak_id)) else {
            return false;
        };
        let mut region = self.regions[idx].region().clone();
        if !region.adjust_sum4(peak_id, left, right) {
            return false;
        }
        self.regions[idx].modify_region(region, format!("SUM4 adjusted on {peak_id}"));
        true
    }

    /// Swap in an externally edited peak model
    pub fn replace_hypermet(&mut self, peak_id: f64, hyp: Peak) -> bool {
        let Some(idx) = self.regions.iter().position(|r| r.contains(peak_id)) else {
            return false;
        };
        let mut region = self.regions[idx].region().clone();
        if !region.replace_hypermet(peak_id, hyp) {
            return false;
        }
        self.regions[idx].modify_region(region, format!("Hypermet adjusted on {peak_id}"));
        self.render_all();
        true
    }

    /// Recompute a region's left edge sample over `[left, right]` and
    /// shrink or grow the region to start at `left`. Returns the new
    /// region identity.
    pub fn adj_lb(&mut self, region_id: f64, left: f64, right: f64) -> Option<f64> {
        let idx = self.region_index(region_id)?;
        let mut region = self.regions[idx].region().clone();

        let lb = Sum4Edge::new(&self.weighted.subset(left, right)).ok()?;
        let rb = region.rb;
        region
            .replace_data(self.weighted.subset(left, region.right()), lb, rb)
            .ok()?;

        let id = region.left();
        self.regions[idx].modify_region(region, "Left baseline adjusted");
        self.sort_regions();
        self.render_all();
        Some(id)
    }

    /// Recompute a region's right edge sample over `[left, right]` and
    /// shrink or grow the region to end at `right`
    pub fn adj_rb(&mut self, region_id: f64, left: f64, right: f64) -> bool {
        let Some(idx) = self.region_index(region_id) else {
            return false;
        };
        let mut region = self.regions[idx].region().clone();

        let Ok(rb) = Sum4Edge::new(&self.weighted.subset(left, right)) else {
            return false;
        };
        let lb = region.lb;
        if region
            .replace_data(self.weighted.subset(region.left(), right), lb, rb)
            .is_err()
        {
            return false;
        }

        self.regions[idx].modify_region(region, "Right baseline adjusted");
        self.sort_regions();
        self.render_all();
        true
    }

    /// Roll one region back to history entry `point`
    pub fn rollback_roi(&mut self, region_id: f64, point: usize) -> bool {
        let Some(idx) = self.region_index(region_id) else {
            return false;
        };
        if !self.regions[idx].rollback(point) {
            return false;
        }
        self.sort_regions();
        self.render_all();
        true
    }

    /// Fit one region through the optimizer
    pub fn refit_region(&mut self, region_id: f64, optimizer: &dyn Optimizer) -> bool {
        let Some(idx) = self.region_index(region_id) else {
            return false;
        };
        let refitted = self.regions[idx].refit(optimizer);
        if refitted {
            self.sort_regions();
            self.render_all();
        }
        refitted
    }

    /// Fit every region in turn; returns how many fits were accepted
    pub fn fit_all(&mut self, optimizer: &dyn Optimizer) -> usize {
        let mut accepted = 0;
        for manager in &mut self.regions {
            if manager.refit(optimizer) {
                accepted += 1;
            }
        }
        self.sort_regions();
        self.render_all();
        accepted
    }

    /// Recompute the merged fit/background/residual arrays by compositing
    /// every region's current state. A full recompute, not an incremental
    /// patch.
    pub fn render_all(&mut self) {
        self.eval.reset();
        for (chan, fit, background) in render_regions(&self.regions) {
            self.eval.merge(&chan, &fit, &background);
        }
    }

    /// Capture the persistable state: settings and every region's model,
    /// but not the raw histogram
    pub fn snapshot(&self) -> FitterSnapshot {
        FitterSnapshot {
            settings: self.settings.clone(),
            live_time_s: self.live_time_s,
            name: self.name.clone(),
            detectors: self.detectors.clone(),
            regions: self
                .regions
                .iter()
                .map(|r| {
                    let region = r.region();
                    RegionSnapshot {
                        left: region.left(),
                        right: region.right(),
                        lb: (region.lb.left(), region.lb.right()),
                        rb: (region.rb.left(), region.rb.right()),
                        background: region.background.clone(),
                        default_peak: region.default_peak.clone(),
                        peaks: region.peaks().to_vec(),
                    }
                })
                .collect(),
        }
    }

    /// Reconstruct a fitter from a snapshot plus the re-supplied spectrum
    pub fn from_snapshot(snapshot: &FitterSnapshot, counts: &[f64]) -> Result<Self, FitterError> {
        let mut fitter = Fitter::new(snapshot.settings.clone());
        fitter.set_data(counts, snapshot.live_time_s)?;
        fitter.name = snapshot.name.clone();
        fitter.detectors = snapshot.detectors.clone();

        for rs in &snapshot.regions {
            let data = fitter.weighted.subset(rs.left, rs.right);
            if data.is_empty() {
                return Err(FitterError::SnapshotMismatch {
                    left: rs.left,
                    right: rs.right,
                });
            }
            let lb = Sum4Edge::new(&fitter.weighted.subset(rs.lb.0, rs.lb.1))?;
            let rb = Sum4Edge::new(&fitter.weighted.subset(rs.rb.0, rs.rb.1))?;
            let region = Region::from_parts(
                data,
                lb,
                rb,
                rs.background.clone(),
                rs.default_peak.clone(),
                rs.peaks.clone(),
            )?;
            fitter.regions.push(RegionManager::new(region));
        }
        fitter.sort_regions();
        fitter.render_all();
        Ok(fitter)
    }

    /// Emit the plain-text analysis report
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "Spectrum \"{}\"", self.name)?;
        writeln!(out, "========================================================")?;
        if !self.detectors.is_empty() {
            writeln!(out, "Detectors")?;
            for d in &self.detectors {
                writeln!(out, "   {d}")?;
            }
        }
        writeln!(out, "Live time(s):   {}", self.live_time_s)?;
        writeln!(out, "Regions:        {}", self.region_count())?;
        writeln!(out, "Peaks:          {}", self.peak_count())?;
        writeln!(out)?;
        writeln!(out, "========================================================")?;
        writeln!(out, "================ Fitter analysis results ===============")?;
        writeln!(out, "========================================================")?;
        writeln!(
            out,
            "{:>15} | {:>15} | {:>15} | {:>20} | {:>20} | {:>5}",
            "center", "energy", "fwhm", "area(hyp)", "area(S4)", "CQI"
        )?;
        for peak in self.peaks() {
            let energy = match &self.energy_cal {
                Some(cal) => format!("{:.3}", peak.peak_energy(cal.as_ref()).value()),
                None => "-".to_string(),
            };
            writeln!(
                out,
                "{:>15.4} | {:>15} | {:>15.4} | {:>20} | {:>20} | {:>5}",
                peak.peak_position().value(),
                energy,
                peak.fwhm().value(),
                peak.area(),
                peak.sum4.peak_area,
                peak.sum4.quality(),
            )?;
        }
        Ok(())
    }

    /// Write the report to a file
    pub fn save_report(&self, path: &str) -> Result<(), FitterError> {
        let mut file = fs::File::create(path)?;
        self.write_report(&mut file)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::calibration::PolyCalibration;
    use crate::optimizer::BfgsOptimizer;
    use crate::test_data::synthetic_spectrum;

    fn two_peak_counts() -> Vec<f64> {
        let (_, y) = synthetic_spectrum(400, &[(100.0, 1000.0, 3.5), (300.0, 800.0, 3.5)], 20.0);
        y
    }

    fn two_peak_fitter() -> Fitter {
        // synthetic data carries no detector tails, so the template peak is
        // pure Gaussian
        let settings =
            FitSettings::default().default_peak(crate::hypermet::Peak::default().gaussian_only());
        let mut fitter = Fitter::new(settings);
        fitter.set_data(&two_peak_counts(), 300.0).unwrap();
        fitter.find_regions();
        fitter
    }

    #[test]
    fn ingestion_trims_to_nonzero_support() {
        let mut counts = vec![0.0; 10];
        counts.extend([5.0, 8.0, 13.0, 8.0, 5.0]);
        counts.extend(vec![0.0; 7]);

        let mut fitter = Fitter::new(FitSettings::default());
        fitter.set_data(&counts, 60.0).unwrap();
        let eval = fitter.fit_evaluation();
        assert_eq!(eval.x.first(), Some(&10.0));
        assert_eq!(eval.x.last(), Some(&14.0));
        assert_eq!(eval.y.len(), 5);

        assert!(matches!(
            fitter.set_data(&[0.0, 0.0], 1.0),
            Err(FitterError::EmptySpectrum)
        ));
    }

    #[test_log::test]
    fn find_regions_discovers_both_peaks() {
        let fitter = two_peak_fitter();
        assert_eq!(fitter.region_count(), 2);
        assert_eq!(fitter.peak_count(), 2);

        let ids = fitter.relevant_regions(0.0, 399.0);
        assert_eq!(ids.len(), 2);
        let first = fitter.region(ids[0]).unwrap().region();
        assert!(first.overlaps(100.0, 100.0));
        assert!((first.peaks()[0].id() - 100.0).abs() < 5.0);
        let second = fitter.region(ids[1]).unwrap().region();
        assert!(second.overlaps(300.0, 300.0));
        assert!((second.peaks()[0].id() - 300.0).abs() < 5.0);
    }

    #[test]
    fn cutoff_discards_low_energy_regions() {
        let mut fitter = Fitter::new(FitSettings::default().finder_cutoff_kev(1e6));
        fitter.set_data(&two_peak_counts(), 300.0).unwrap();
        fitter.set_energy_calibration(Box::new(PolyCalibration::identity((0.0, 400.0))));
        fitter.find_regions();
        assert_eq!(fitter.region_count(), 0);
    }

    #[test]
    fn render_all_composites_every_region() {
        let fitter = two_peak_fitter();
        let eval = fitter.fit_evaluation();

        // inside a region the rendered fit tracks the data
        let i = eval.x.iter().position(|&x| x == 100.0).unwrap();
        assert!(eval.y_fit[i] > 500.0);
        // far outside any region nothing is rendered
        let j = eval.x.iter().position(|&x| x == 200.0).unwrap();
        assert_eq!(eval.y_fit[j], 0.0);
        assert_eq!(eval.y_resid[j], eval.y[j]);
    }

    #[test]
    fn merge_regions_unions_ranges_and_peaks() {
        let mut fitter = two_peak_fitter();
        let ids: Vec<f64> = fitter.regions().iter().map(|r| r.id()).collect();
        let r1 = fitter.region(ids[0]).unwrap().region().clone();
        let r2 = fitter.region(ids[1]).unwrap().region().clone();
        let peaks_before: Vec<f64> = fitter.peaks().iter().map(|p| p.id()).collect();

        let merged_id = fitter.merge_regions(ids[0], ids[1]).unwrap();
        assert_eq!(fitter.region_count(), 1);

        let merged = fitter.region(merged_id).unwrap().region();
        assert_eq!(merged.left(), r1.left().min(r2.left()));
        assert_eq!(merged.right(), r1.right().max(r2.right()));
        let peaks_after: Vec<f64> = merged.peaks().iter().map(|p| p.id()).collect();
        assert_eq!(peaks_before, peaks_after);

        // merging something that no longer exists fails cleanly
        assert!(fitter.merge_regions(ids[0], ids[1]).is_none());
    }

    #[test]
    fn add_peak_widens_region_when_needed() {
        let mut fitter = two_peak_fitter();
        let id = fitter.regions()[0].id();
        let region = fitter.region(id).unwrap().region().clone();
        let old_left = region.left();

        // a range partly outside the region forces expansion
        let new_left = (old_left - 15.0).max(0.0);
        fitter.add_peak(id, new_left, old_left + 5.0);
        let manager = fitter
            .regions()
            .iter()
            .find(|r| r.region().overlaps(100.0, 100.0))
            .unwrap();
        assert!(manager.region().left() <= new_left);
        assert!(manager
            .history()
            .iter()
            .any(|h| h.reason.contains("expanded")));
    }

    #[test]
    fn remove_peaks_touches_only_owning_region() {
        let mut fitter = two_peak_fitter();
        let ids: Vec<f64> = fitter.peaks().iter().map(|p| p.id()).collect();
        assert_eq!(ids.len(), 2);

        assert!(!fitter.remove_peaks(&[99999.0]));
        assert!(fitter.remove_peaks(&[ids[0]]));
        assert_eq!(fitter.peak_count(), 1);
        assert!(!fitter.contains_peak(ids[0]));
        assert!(fitter.contains_peak(ids[1]));
    }

    #[test]
    fn rollback_through_the_fitter() {
        let mut fitter = two_peak_fitter();
        let id = fitter.regions()[0].id();
        let before = fitter.region(id).unwrap().region().clone();

        let peak_id = before.peaks()[0].id();
        assert!(fitter.remove_peaks(&[peak_id]));
        assert_ne!(*fitter.region(id).unwrap().region(), before);

        // entry 1 is the initial guess state
        assert!(fitter.rollback_roi(id, 1));
        assert_eq!(*fitter.region(id).unwrap().region(), before);
        assert!(!fitter.rollback_roi(id, 42));
        assert!(!fitter.rollback_roi(-1.0, 0));
    }

    #[test]
    fn refit_improves_region() {
        let mut fitter = two_peak_fitter();
        let id = fitter.regions()[0].id();
        let optimizer = BfgsOptimizer::default().max_iterations(1000);
        assert!(fitter.refit_region(id, &optimizer));

        // the template width is not fitted here, so the amplitude only has
        // to land in the right neighborhood
        let peak = &fitter.region(id).unwrap().region().peaks()[0];
        assert!((peak.position.val() - 100.0).abs() < 0.5);
        assert!((peak.amplitude.val() - 1000.0).abs() / 1000.0 < 0.1);
    }

    #[test]
    fn snapshot_round_trips_against_resupplied_spectrum() {
        let counts = two_peak_counts();
        let mut fitter = Fitter::new(FitSettings::default());
        fitter.set_data(&counts, 300.0).unwrap();
        fitter.name = "test spectrum".into();
        fitter.detectors = vec!["HPGe1".into()];
        fitter.find_regions();

        let snapshot = fitter.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        // the raw histogram is not embedded
        assert!(!json.contains("y_fit"));

        let parsed: FitterSnapshot = serde_json::from_str(&json).unwrap();
        let restored = Fitter::from_snapshot(&parsed, &counts).unwrap();

        assert_eq!(restored.region_count(), fitter.region_count());
        assert_eq!(restored.peak_count(), fitter.peak_count());
        for (a, b) in restored.regions().iter().zip(fitter.regions().iter()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.region().left(), b.region().left());
            assert_eq!(a.region().right(), b.region().right());
            for (pa, pb) in a.region().peaks().iter().zip(b.region().peaks().iter()) {
                assert_eq!(pa.position.val(), pb.position.val());
                assert_eq!(pa.amplitude.val(), pb.amplitude.val());
                assert_eq!(pa.width.val(), pb.width.val());
            }
        }
        assert_eq!(restored.fit_evaluation().y, fitter.fit_evaluation().y);
    }

    #[test]
    fn report_lists_every_peak() {
        let mut fitter = two_peak_fitter();
        fitter.name = "report me".into();
        fitter.set_energy_calibration(Box::new(PolyCalibration::new(
            vec![0.0, 0.5],
            (0.0, 400.0),
        )));

        let mut out = Vec::new();
        fitter.write_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("report me"));
        assert!(text.contains("Peaks:          2"));
        // both peak centers appear
        assert!(text.lines().count() > 10);
    }

    #[test]
    fn adj_lb_changes_region_identity() {
        let mut fitter = two_peak_fitter();
        let id = fitter.regions()[0].id();
        let right = fitter.region(id).unwrap().region().right();
        assert!(right > 100.0);

        let new_id = fitter.adj_lb(id, id - 5.0, id - 1.0).unwrap();
        assert!(new_id < id);
        assert!(fitter.contains_region(new_id));
        assert!(!fitter.contains_region(id));

        assert!(fitter.adj_rb(new_id, right + 1.0, right + 5.0));
        assert!((fitter.region(new_id).unwrap().region().right() - (right + 5.0)).abs() < 1e-9);
    }
}
