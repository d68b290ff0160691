//! Global fit configuration.
use serde::{Deserialize, Serialize};

use crate::data::WeightPolicy;
use crate::finder::KonSettings;
use crate::hypermet::Peak;

/// Everything the fitter needs to know besides the spectrum itself:
/// detection thresholds, the weighting policy, edge-sample width, the
/// low-energy search cutoff and the template peak supplying width/tail/step
/// defaults to newly created peaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    pub kon: KonSettings,
    pub weight_policy: WeightPolicy,
    /// Bins per SUM4 edge sample on each flank of a region
    pub edge_samples: usize,
    /// Regions whose right edge maps below this energy are discarded
    pub finder_cutoff_kev: f64,
    pub default_peak: Peak,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            kon: KonSettings::default(),
            weight_policy: WeightPolicy::default(),
            edge_samples: 4,
            finder_cutoff_kev: 0.0,
            default_peak: Peak::default(),
        }
    }
}

impl FitSettings {
    pub fn kon(mut self, kon: KonSettings) -> Self {
        self.kon = kon;
        self
    }

    pub fn weight_policy(mut self, weight_policy: WeightPolicy) -> Self {
        self.weight_policy = weight_policy;
        self
    }

    pub fn edge_samples(mut self, edge_samples: usize) -> Self {
        self.edge_samples = edge_samples;
        self
    }

    pub fn finder_cutoff_kev(mut self, cutoff: f64) -> Self {
        self.finder_cutoff_kev = cutoff;
        self
    }

    pub fn default_peak(mut self, default_peak: Peak) -> Self {
        self.default_peak = default_peak;
        self
    }
}
