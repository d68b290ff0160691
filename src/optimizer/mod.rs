//! The nonlinear solver contract and its BFGS implementation.
//!
//! Anything exposing a variable vector, a scalar objective and a gradient
//! can be minimized; the region model implements [`FitObjective`] over its
//! weighted chi-square. Solvers are interchangeable behind the
//! [`Optimizer`] trait, and the gradient source (analytic vs finite
//! difference) is itself selectable, so model gradient bugs can be isolated
//! from solver behavior.
mod bfgs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

pub use bfgs::BfgsOptimizer;

/// An objective function over an unconstrained variable vector
pub trait FitObjective {
    /// The current variable vector, one slot per indexed parameter
    fn variables(&self) -> DVector<f64>;

    /// The scalar objective at a candidate variable vector
    fn eval(&self, fit: &DVector<f64>) -> f64;

    /// The objective at `fit` while writing its gradient into `grads`.
    ///
    /// `grads` arrives zeroed and sized to the variable count.
    fn eval_grad(&self, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64;
}

/// Where the solver gets its gradients
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GradientSelection {
    /// Use the objective's analytic gradient
    Analytical,
    /// Ignore the analytic gradient and use central differences with the
    /// given step
    FiniteDifference { epsilon: f64 },
}

impl Default for GradientSelection {
    fn default() -> Self {
        Self::Analytical
    }
}

/// Cooperative cancellation flag shared between a caller and a running
/// solver.
///
/// The solver polls between iterations, never mid-iteration, and returns
/// its best-so-far result when the flag is raised.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// What a minimization run produced.
///
/// Non-convergence is not an error: the result carries the achieved
/// objective and iteration count and the caller decides whether to accept.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub variables: DVector<f64>,
    /// Approximate inverse Hessian at the optimum, for uncertainty
    /// propagation
    pub inv_hessian: DMatrix<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// An interchangeable local minimizer
pub trait Optimizer {
    fn minimize(&self, objective: &dyn FitObjective) -> FitResult;
}
