//! `hypermet` is a library for extracting quantitative peak parameters from
//! one-dimensional count histograms produced by radiation-detection
//! instruments.
//!
//! The candidate finder can be used directly with [`Finder`], a sliding
//! second-difference convolution filter with tunable significance
//! thresholds, see its documentation for more details.
//!
//! For full analysis the [`Fitter`] partitions a spectrum into regions of
//! interest, seeds each with edge samples and peak guesses, and dispatches
//! nonlinear fits of the compositional Hypermet peak shape (Gaussian core,
//! skew tails, step, polynomial background) to an [`Optimizer`] such as
//! [`BfgsOptimizer`]. Every region keeps an edit history with rollback, and
//! the merged spectrum-wide fit/background/residual view is recomputed
//! after every edit.
//!
//! # Usage
//! ```
//! use hypermet::{BfgsOptimizer, FitSettings, Fitter, Peak};
//!
//! // a noiseless peak over a flat background
//! let counts: Vec<f64> = (0..200)
//!     .map(|i| 20.0 + 1000.0 * (-((i as f64 - 100.0) / 3.5f64).powi(2)).exp())
//!     .collect();
//!
//! let settings = FitSettings::default().default_peak(Peak::default().gaussian_only());
//! let mut fitter = Fitter::new(settings);
//! fitter.set_data(&counts, 300.0).unwrap();
//! fitter.find_regions();
//! assert_eq!(fitter.region_count(), 1);
//!
//! let id = fitter.regions()[0].id();
//! let optimizer = BfgsOptimizer::default();
//! assert!(fitter.refit_region(id, &optimizer));
//! for peak in fitter.peaks() {
//!     println!("{} +- {}", peak.peak_position(), peak.area());
//! }
//! ```
#![allow(unused_imports)]
pub mod background;
pub mod calibration;
pub mod data;
pub mod finder;
pub mod fitter;
pub mod hypermet;
pub mod optimizer;
pub mod param;
pub mod region;
pub mod roi;
pub mod search;
pub mod settings;
pub mod sum4;
pub mod uncertain;

#[cfg(test)]
mod test_data;

pub use crate::background::PolyBackground;
pub use crate::calibration::{
    EnergyCalibration, FwhmCalibration, PolyCalibration, SqrtFwhmCalibration,
};
pub use crate::data::{DataError, WeightPolicy, WeightedData};
pub use crate::finder::{DetectedPeak, Finder, FinderError, KonSettings};
pub use crate::fitter::{FitEvaluation, Fitter, FitterError, FitterSnapshot, RegionSnapshot};
pub use crate::hypermet::{Components, Peak, Side, Skew, Step};
pub use crate::optimizer::{
    BfgsOptimizer, CancelToken, FitObjective, FitResult, GradientSelection, Optimizer,
};
pub use crate::param::{FitParam, Transform};
pub use crate::region::{Region, RegionError};
pub use crate::roi::RegionManager;
pub use crate::settings::FitSettings;
pub use crate::sum4::{sum4_background, Sum4, Sum4Background, Sum4Edge, Sum4Error};
pub use crate::uncertain::UncertainValue;
