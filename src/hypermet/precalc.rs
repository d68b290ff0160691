use serde::{Deserialize, Serialize};

use nalgebra::DVector;

use crate::param::FitParam;

/// Which flank of the peak a tail or step attaches to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Left,
    Right,
}

/// Mirror the spread for right-sided components
#[inline]
pub fn flip(side: Side, spread: f64) -> f64 {
    match side {
        Side::Left => spread,
        Side::Right => -spread,
    }
}

/// Shared per-evaluation quantities of one peak.
///
/// Computed once per channel from the peak's position, amplitude and width,
/// then consumed by every sub-component so that gradient contributions for
/// the shared parameters land on consistent indices.
#[derive(Debug, Clone, Copy)]
pub struct PrecalcVals {
    pub ampl: f64,
    pub half_ampl: f64,
    pub width: f64,
    /// `(channel - position) / width`
    pub spread: f64,

    pub amp_grad: f64,
    pub width_grad: f64,
    pub pos_grad: f64,

    pub i_amp: i32,
    pub i_width: i32,
    pub i_pos: i32,
}

impl PrecalcVals {
    /// Precalculate from the current parameter state
    pub fn new(chan: f64, position: &FitParam, amplitude: &FitParam, width: &FitParam) -> Self {
        let ampl = amplitude.val();
        let w = width.val();
        Self {
            ampl,
            half_ampl: 0.5 * ampl,
            width: w,
            spread: (chan - position.val()) / w,
            amp_grad: amplitude.grad(),
            width_grad: width.grad(),
            pos_grad: position.grad(),
            i_amp: amplitude.index(),
            i_width: width.index(),
            i_pos: position.index(),
        }
    }

    /// Precalculate from a candidate fit vector
    pub fn new_at(
        chan: f64,
        fit: &DVector<f64>,
        position: &FitParam,
        amplitude: &FitParam,
        width: &FitParam,
    ) -> Self {
        let ampl = amplitude.val_from(fit);
        let w = width.val_from(fit);
        Self {
            ampl,
            half_ampl: 0.5 * ampl,
            width: w,
            spread: (chan - position.val_from(fit)) / w,
            amp_grad: amplitude.grad_from(fit),
            width_grad: width.grad_from(fit),
            pos_grad: position.grad_from(fit),
            i_amp: amplitude.index(),
            i_width: width.index(),
            i_pos: position.index(),
        }
    }
}
