//! Analytic background and peak-area estimation from edge samples.
//!
//! This follows the sum-and-mean approach of M. Lindstrom (1994), "Sum and
//! Mean Standard Programs for Activation Analysis": a fixed-width sample on
//! each flank of a region summarizes the local background, two such samples
//! define a straight line under the peaks, and the net area between data and
//! line gives a fit-independent cross-check of the fitted peak model.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::WeightedData;
use crate::uncertain::UncertainValue;

/// All the ways edge-sample analysis can fail
#[derive(Debug, Clone, Error)]
pub enum Sum4Error {
    #[error("Cannot create an edge sample from empty data")]
    EmptyEdge,
    #[error("Cannot generate background: empty left edge")]
    EmptyLeftEdge,
    #[error("Cannot generate background: empty right edge")]
    EmptyRightEdge,
    #[error("Cannot generate background: right edge must be right of the left edge")]
    EdgesOverlap,
    #[error("Cannot summarize peak region: net area is zero")]
    DegenerateRegion,
}

/// Summary statistics over one fixed-width flanking window.
///
/// Equality is total-order equality on the channel bounds, so a default
/// (unset) edge compares equal to itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sum4Edge {
    #[serde(with = "crate::uncertain::nullable_float")]
    left_chan: f64,
    #[serde(with = "crate::uncertain::nullable_float")]
    right_chan: f64,
    #[serde(with = "crate::uncertain::nullable_float")]
    min: f64,
    #[serde(with = "crate::uncertain::nullable_float")]
    max: f64,
    sum: UncertainValue,
    average: UncertainValue,
}

impl Default for Sum4Edge {
    fn default() -> Self {
        Self {
            left_chan: f64::NAN,
            right_chan: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            sum: UncertainValue::exact(0.0),
            average: UncertainValue::default(),
        }
    }
}

impl PartialEq for Sum4Edge {
    fn eq(&self, other: &Self) -> bool {
        self.left_chan.total_cmp(&other.left_chan).is_eq()
            && self.right_chan.total_cmp(&other.right_chan).is_eq()
            && self.min.total_cmp(&other.min).is_eq()
            && self.max.total_cmp(&other.max).is_eq()
            && self.sum == other.sum
            && self.average == other.average
    }
}

impl Sum4Edge {
    /// Summarize a window of spectrum data
    pub fn new(data: &WeightedData) -> Result<Self, Sum4Error> {
        if data.is_empty() {
            return Err(Sum4Error::EmptyEdge);
        }

        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = UncertainValue::exact(0.0);
        for i in 0..data.len() {
            min = min.min(data.count[i]);
            max = max.max(data.count[i]);
            sum += UncertainValue::new(data.count[i], data.count[i].sqrt());
        }

        let mut edge = Self {
            left_chan: data.first_chan(),
            right_chan: data.last_chan(),
            min,
            max,
            sum,
            average: UncertainValue::default(),
        };
        edge.average = sum / edge.width();
        Ok(edge)
    }

    pub fn left(&self) -> f64 {
        self.left_chan
    }

    pub fn right(&self) -> f64 {
        self.right_chan
    }

    /// Number of bins in the window, 0 for an inverted or non-finite pair
    pub fn width(&self) -> f64 {
        if !self.right_chan.is_finite() || !self.left_chan.is_finite() || (self.right_chan < self.left_chan)
        {
            0.0
        } else {
            self.right_chan - self.left_chan + 1.0
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn sum(&self) -> UncertainValue {
        self.sum
    }

    pub fn average(&self) -> UncertainValue {
        self.average
    }

    pub fn variance(&self) -> f64 {
        self.average.sigma().powi(2)
    }
}

/// A straight-line background derived from two edge samples, anchored at the
/// right end of the left edge
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sum4Background {
    pub base: f64,
    pub slope: f64,
    pub x_offset: f64,
}

impl Sum4Background {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * (x - self.x_offset) + self.base
    }
}

/// Derive the straight-line background under a peak region.
///
/// Fails when either edge is empty or the left edge does not lie strictly
/// left of the right edge.
pub fn sum4_background(lb: &Sum4Edge, rb: &Sum4Edge) -> Result<Sum4Background, Sum4Error> {
    if lb.width() == 0.0 {
        return Err(Sum4Error::EmptyLeftEdge);
    }
    if rb.width() == 0.0 {
        return Err(Sum4Error::EmptyRightEdge);
    }
    if lb.right() >= rb.left() {
        return Err(Sum4Error::EdgesOverlap);
    }

    Ok(Sum4Background {
        x_offset: lb.right(),
        base: lb.average().value(),
        slope: (rb.average().value() - lb.average().value()) / (rb.left() - lb.right()),
    })
}

/// Fit-independent summary of one peak region: gross, background and net
/// areas plus moment-based centroid and width.
///
/// Equality is total-order equality on the channel bounds, so an unset
/// summary compares equal to itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sum4 {
    #[serde(with = "crate::uncertain::nullable_float")]
    pub left_chan: f64,
    #[serde(with = "crate::uncertain::nullable_float")]
    pub right_chan: f64,
    pub gross_area: UncertainValue,
    pub background_area: UncertainValue,
    pub peak_area: UncertainValue,
    pub centroid: UncertainValue,
    pub fwhm: UncertainValue,
}

impl Default for Sum4 {
    fn default() -> Self {
        Self {
            left_chan: f64::NAN,
            right_chan: f64::NAN,
            gross_area: UncertainValue::default(),
            background_area: UncertainValue::default(),
            peak_area: UncertainValue::default(),
            centroid: UncertainValue::default(),
            fwhm: UncertainValue::default(),
        }
    }
}

impl PartialEq for Sum4 {
    fn eq(&self, other: &Self) -> bool {
        self.left_chan.total_cmp(&other.left_chan).is_eq()
            && self.right_chan.total_cmp(&other.right_chan).is_eq()
            && self.gross_area == other.gross_area
            && self.background_area == other.background_area
            && self.peak_area == other.peak_area
            && self.centroid == other.centroid
            && self.fwhm == other.fwhm
    }
}

impl Sum4 {
    /// Summarize the peak region `data` between two flanking edge samples
    pub fn new(data: &WeightedData, lb: &Sum4Edge, rb: &Sum4Edge) -> Result<Self, Sum4Error> {
        let background = sum4_background(lb, rb)?;
        if data.is_empty() {
            return Err(Sum4Error::DegenerateRegion);
        }

        let left_chan = data.first_chan();
        let right_chan = data.last_chan();
        let peak_width = right_chan - left_chan + 1.0;

        let mut gross_area = UncertainValue::exact(0.0);
        for i in 0..data.len() {
            gross_area += UncertainValue::new(data.count[i], data.count[i].sqrt());
        }

        let background_variance = (peak_width / 2.0).powi(2) * (lb.variance() + rb.variance());
        let background_area = UncertainValue::new(
            peak_width * (background.eval(left_chan) + background.eval(right_chan)) / 2.0,
            background_variance.sqrt(),
        );

        let peak_area = gross_area - background_area;

        let mut sum_net = 0.0;
        let mut c_sum_net = 0.0;
        let mut c2_sum_net = 0.0;
        for i in 0..data.len() {
            let net = data.count[i] - background.eval(data.chan[i]);
            sum_net += net;
            c_sum_net += data.chan[i] * net;
            c2_sum_net += data.chan[i].powi(2) * net;
        }
        if sum_net == 0.0 {
            return Err(Sum4Error::DegenerateRegion);
        }

        let centroid = c_sum_net / sum_net;
        let variance = c2_sum_net / sum_net - centroid.powi(2);
        let fwhm = 2.0 * (variance * 4.0f64.ln()).sqrt();

        Ok(Self {
            left_chan,
            right_chan,
            gross_area,
            background_area,
            peak_area,
            centroid: UncertainValue::new(centroid, f64::NAN),
            fwhm: UncertainValue::new(fwhm, f64::NAN),
        })
    }

    pub fn peak_width(&self) -> f64 {
        self.right_chan - self.left_chan + 1.0
    }

    /// Currie detection-quality indicator for the net area: 1 is
    /// quantifiable, 2 detectable, 3 above the critical limit, 4 marginal,
    /// 5 nothing
    pub fn quality(&self) -> u8 {
        let noise = self.background_area.sigma();
        let signal = self.peak_area.value();
        if signal > 2.71 + 4.65 * noise {
            1
        } else if signal > 2.71 + 3.29 * noise {
            2
        } else if signal > 2.33 * noise {
            3
        } else if signal > 0.0 {
            4
        } else {
            5
        }
    }
}
