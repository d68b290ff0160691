//! The Hypermet peak shape: a Gaussian core with optional exponential skew
//! tails, a step, and a long background tail, all sharing one position,
//! width and amplitude.
//!
//! Every sub-component reads a shared [`PrecalcVals`] computed once per
//! evaluation, so the chain rule over the shared parameters is applied
//! identically everywhere and gradient contributions accumulate instead of
//! overwriting each other.
mod peak;
mod precalc;
mod skew;
mod step;

pub use peak::{Components, Peak};
pub use precalc::{flip, PrecalcVals, Side};
pub use skew::Skew;
pub use step::Step;
