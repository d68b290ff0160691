//! Count histograms with per-bin statistical weights.
//!
//! All fitting in this crate happens against a [`WeightedData`]: an
//! equally-spaced channel axis, the observed counts, and one statistical
//! weight per bin chosen by a [`WeightPolicy`]. Regions hold sub-ranges of
//! the ingested spectrum as independent clones.
use num_traits::Float;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All the ways histogram construction can fail
#[derive(Debug, Clone, Error)]
pub enum DataError {
    #[error("The channel and count arrays do not match in length ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error("The histogram is empty")]
    Empty,
    #[error("The channel axis is not sorted")]
    ChannelsNotSorted,
}

/// Check if the values in `it` are monotonically ascending or flat
pub fn is_increasing<F: Float + PartialOrd>(it: &[F]) -> bool {
    let (ascending, _) = it
        .iter()
        .fold((true, F::neg_infinity()), |(ascending, last_val), val| {
            if !ascending {
                (false, last_val)
            } else {
                ((last_val <= *val), *val)
            }
        });
    ascending
}

/// How the statistical weight of a bin is estimated from its count
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightPolicy {
    /// Poisson baseline, `sqrt(y)`, clamped below at 1
    #[default]
    Sqrt,
    /// Phillips-Marlow low-count correction: `sqrt(y)` for `y >= 25`, else
    /// a three-bin neighborhood estimate
    PhillipsMarlow,
    /// Revay's student correction, `sqrt(y + 1)`
    RevayStudent,
}

impl WeightPolicy {
    /// Weight of bin `i` of `counts` under this policy
    pub fn weight(&self, counts: &[f64], i: usize) -> f64 {
        match self {
            WeightPolicy::Sqrt => counts[i].sqrt().max(1.0),
            WeightPolicy::PhillipsMarlow => {
                let k0 = counts[i];
                if k0 >= 25.0 {
                    k0.sqrt()
                } else {
                    let mut k1 = 1.0;
                    if (i > 0) && ((i + 1) < counts.len()) {
                        k1 = counts[i - 1] + counts[i] + counts[i + 1] / 3.0;
                    }
                    k1.sqrt().max(1.0)
                }
            }
            WeightPolicy::RevayStudent => (counts[i] + 1.0).sqrt(),
        }
    }
}

/// A contiguous slice of spectrum with channel, count and weight per bin
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedData {
    pub chan: Vec<f64>,
    pub count: Vec<f64>,
    pub weight: Vec<f64>,
    pub policy: WeightPolicy,
}

impl WeightedData {
    /// Build a weighted histogram from paired channel/count arrays.
    ///
    /// Fails on mismatched lengths, empty input, or an unsorted channel axis.
    pub fn new(chan: Vec<f64>, count: Vec<f64>, policy: WeightPolicy) -> Result<Self, DataError> {
        if chan.len() != count.len() {
            return Err(DataError::LengthMismatch {
                x: chan.len(),
                y: count.len(),
            });
        }
        if chan.is_empty() {
            return Err(DataError::Empty);
        }
        if !is_increasing(&chan) {
            return Err(DataError::ChannelsNotSorted);
        }
        let weight = (0..count.len()).map(|i| policy.weight(&count, i)).collect();
        Ok(Self {
            chan,
            count,
            weight,
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.is_empty()
    }

    /// First channel of the slice, NaN when empty
    pub fn first_chan(&self) -> f64 {
        self.chan.first().copied().unwrap_or(f64::NAN)
    }

    /// Last channel of the slice, NaN when empty
    pub fn last_chan(&self) -> f64 {
        self.chan.last().copied().unwrap_or(f64::NAN)
    }

    /// Clone the sub-range with channels in `[from, to]` (inclusive)
    pub fn subset(&self, from: f64, to: f64) -> Self {
        let (lo, hi) = (from.min(to), from.max(to));
        let mut out = Self {
            policy: self.policy,
            ..Default::default()
        };
        for i in 0..self.len() {
            if (self.chan[i] >= lo) && (self.chan[i] <= hi) {
                out.chan.push(self.chan[i]);
                out.count.push(self.count[i]);
                out.weight.push(self.weight[i]);
            }
        }
        out
    }

    /// Clone the leftmost `size` bins (or fewer when the slice is shorter)
    pub fn left(&self, size: usize) -> Self {
        let size = size.min(self.len());
        Self {
            chan: self.chan[..size].to_vec(),
            count: self.count[..size].to_vec(),
            weight: self.weight[..size].to_vec(),
            policy: self.policy,
        }
    }

    /// Clone the rightmost `size` bins (or fewer when the slice is shorter)
    pub fn right(&self, size: usize) -> Self {
        let size = size.min(self.len());
        let start = self.len() - size;
        Self {
            chan: self.chan[start..].to_vec(),
            count: self.count[start..].to_vec(),
            weight: self.weight[start..].to_vec(),
            policy: self.policy,
        }
    }

    /// Largest count in the slice, 0 when empty
    pub fn count_max(&self) -> f64 {
        self.count.iter().fold(0.0f64, |a, b| a.max(*b))
    }

    /// Smallest count in the slice, 0 when empty
    pub fn count_min(&self) -> f64 {
        if self.count.is_empty() {
            0.0
        } else {
            self.count.iter().fold(f64::INFINITY, |a, b| a.min(*b))
        }
    }
}
