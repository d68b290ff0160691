use log::{debug, trace};
use nalgebra::{DMatrix, DVector};

use super::{CancelToken, FitObjective, FitResult, GradientSelection, Optimizer};

/// Quasi-Newton minimizer with BFGS inverse-Hessian updates and a
/// backtracking line search.
///
/// Convergence is declared on a relative decrease of the objective below
/// `tolerance` or a gradient norm below `min_g_norm`; otherwise the run
/// ends at `max_iterations` with `converged == false`. A raised
/// [`CancelToken`] ends the run between iterations with the best result so
/// far.
#[derive(Debug, Clone)]
pub struct BfgsOptimizer {
    pub tolerance: f64,
    pub min_g_norm: f64,
    pub max_iterations: usize,
    pub gradient: GradientSelection,
    pub cancel: CancelToken,
}

impl Default for BfgsOptimizer {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            min_g_norm: 1e-7,
            max_iterations: 500,
            gradient: GradientSelection::Analytical,
            cancel: CancelToken::new(),
        }
    }
}

impl BfgsOptimizer {
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn gradient(mut self, gradient: GradientSelection) -> Self {
        self.gradient = gradient;
        self
    }

    /// Objective and gradient under the configured gradient selection
    fn eval_grad(
        &self,
        objective: &dyn FitObjective,
        x: &DVector<f64>,
        grads: &mut DVector<f64>,
    ) -> f64 {
        match self.gradient {
            GradientSelection::Analytical => {
                grads.fill(0.0);
                objective.eval_grad(x, grads)
            }
            GradientSelection::FiniteDifference { epsilon } => {
                let f = objective.eval(x);
                let mut probe = x.clone();
                for i in 0..x.len() {
                    let h = epsilon * (1.0 + x[i].abs());
                    probe[i] = x[i] + h;
                    let up = objective.eval(&probe);
                    probe[i] = x[i] - h;
                    let down = objective.eval(&probe);
                    probe[i] = x[i];
                    grads[i] = (up - down) / (2.0 * h);
                }
                f
            }
        }
    }

    /// Backtracking Armijo line search along `direction`; returns the
    /// accepted step and objective, or None when no decrease is found
    fn line_search(
        &self,
        objective: &dyn FitObjective,
        x: &DVector<f64>,
        f: f64,
        g: &DVector<f64>,
        direction: &DVector<f64>,
    ) -> Option<(f64, f64)> {
        let slope = g.dot(direction);
        if slope >= 0.0 {
            return None;
        }
        let mut alpha = 1.0;
        for _ in 0..48 {
            let candidate = x + direction * alpha;
            let f_new = objective.eval(&candidate);
            if f_new.is_finite() && (f_new <= f + 1e-4 * alpha * slope) {
                return Some((alpha, f_new));
            }
            alpha *= 0.5;
        }
        None
    }
}

impl Optimizer for BfgsOptimizer {
    fn minimize(&self, objective: &dyn FitObjective) -> FitResult {
        let mut x = objective.variables();
        let n = x.len();
        if n == 0 {
            return FitResult {
                value: objective.eval(&x),
                variables: x,
                inv_hessian: DMatrix::identity(0, 0),
                iterations: 0,
                converged: true,
            };
        }

        let mut inv_hessian = DMatrix::<f64>::identity(n, n);
        let mut g = DVector::from_element(n, 0.0);
        let mut f = self.eval_grad(objective, &x, &mut g);

        let mut iterations = 0;
        let mut converged = false;

        for iter in 0..self.max_iterations {
            iterations = iter + 1;

            if self.cancel.cancelled() {
                debug!("BFGS cancelled after {iter} iteration(s), f={f}");
                break;
            }

            if g.norm() < self.min_g_norm {
                converged = true;
                break;
            }

            let mut direction = -(&inv_hessian * &g);
            if direction.dot(&g) >= 0.0 {
                // curvature information went stale, restart from steepest
                // descent
                inv_hessian = DMatrix::identity(n, n);
                direction = -g.clone();
            }

            let Some((alpha, f_new)) = self.line_search(objective, &x, f, &g, &direction) else {
                converged = true;
                break;
            };

            let x_new = &x + &direction * alpha;
            let mut g_new = DVector::from_element(n, 0.0);
            let f_check = self.eval_grad(objective, &x_new, &mut g_new);
            trace!("{iter}: f {f} -> {f_new} (step {alpha})");

            let s = &x_new - &x;
            let yv = &g_new - &g;
            let sy = s.dot(&yv);
            if sy > 1e-12 {
                // BFGS update: H <- (I - s yᵀ/sy) H (I - y sᵀ/sy) + s sᵀ/sy
                let rho = 1.0 / sy;
                let identity = DMatrix::<f64>::identity(n, n);
                let left = &identity - &s * yv.transpose() * rho;
                let right = &identity - &yv * s.transpose() * rho;
                inv_hessian = &left * inv_hessian * &right + &s * s.transpose() * rho;
            }

            let decrease = (f - f_new).abs();
            x = x_new;
            g = g_new;
            f = f_check;

            if decrease < self.tolerance * (f.abs() + self.tolerance) {
                converged = true;
                break;
            }
        }

        debug!("BFGS finished: f={f}, iterations={iterations}, converged={converged}");
        FitResult {
            variables: x,
            inv_hessian,
            value: f,
            iterations,
            converged,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Convex bowl centered on a target vector
    struct Quadratic {
        start: DVector<f64>,
        target: DVector<f64>,
    }

    impl FitObjective for Quadratic {
        fn variables(&self) -> DVector<f64> {
            self.start.clone()
        }

        fn eval(&self, fit: &DVector<f64>) -> f64 {
            (fit - &self.target).norm_squared()
        }

        fn eval_grad(&self, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
            let delta = fit - &self.target;
            *grads += 2.0 * &delta;
            delta.norm_squared()
        }
    }

    /// The classic banana valley, minimum at (1, 1)
    struct Rosenbrock {
        start: DVector<f64>,
    }

    impl FitObjective for Rosenbrock {
        fn variables(&self) -> DVector<f64> {
            self.start.clone()
        }

        fn eval(&self, fit: &DVector<f64>) -> f64 {
            let (a, b) = (fit[0], fit[1]);
            100.0 * (b - a * a).powi(2) + (1.0 - a).powi(2)
        }

        fn eval_grad(&self, fit: &DVector<f64>, grads: &mut DVector<f64>) -> f64 {
            let (a, b) = (fit[0], fit[1]);
            grads[0] += -400.0 * a * (b - a * a) - 2.0 * (1.0 - a);
            grads[1] += 200.0 * (b - a * a);
            self.eval(fit)
        }
    }

    #[test]
    fn quadratic_converges_in_few_iterations() {
        let problem = Quadratic {
            start: DVector::from_vec(vec![5.0, -3.0, 0.5]),
            target: DVector::from_vec(vec![1.0, 2.0, 3.0]),
        };
        let result = BfgsOptimizer::default().minimize(&problem);
        assert!(result.converged);
        assert!(result.value < 1e-9, "final value {}", result.value);
        for i in 0..3 {
            assert!((result.variables[i] - problem.target[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn rosenbrock_reaches_the_minimum() {
        let problem = Rosenbrock {
            start: DVector::from_vec(vec![-1.2, 1.0]),
        };
        let optimizer = BfgsOptimizer::default().max_iterations(2000);
        let result = optimizer.minimize(&problem);
        assert!(result.converged);
        assert!((result.variables[0] - 1.0).abs() < 1e-3);
        assert!((result.variables[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn finite_difference_backend_agrees() {
        let problem = Quadratic {
            start: DVector::from_vec(vec![4.0, 4.0]),
            target: DVector::from_vec(vec![-1.0, 2.0]),
        };
        let optimizer = BfgsOptimizer::default()
            .gradient(GradientSelection::FiniteDifference { epsilon: 1e-7 });
        let result = optimizer.minimize(&problem);
        assert!(result.converged);
        assert!((result.variables[0] + 1.0).abs() < 1e-3);
        assert!((result.variables[1] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn gradient_near_zero_at_optimum() {
        let problem = Quadratic {
            start: DVector::from_vec(vec![2.0]),
            target: DVector::from_vec(vec![0.25]),
        };
        let result = BfgsOptimizer::default().minimize(&problem);
        let mut grads = DVector::from_element(1, 0.0);
        problem.eval_grad(&result.variables, &mut grads);
        assert!(grads.norm() < 1e-5);
    }

    #[test]
    fn cancellation_returns_best_so_far() {
        let problem = Rosenbrock {
            start: DVector::from_vec(vec![-1.2, 1.0]),
        };
        let optimizer = BfgsOptimizer::default();
        optimizer.cancel.cancel();
        let result = optimizer.minimize(&problem);
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
        // untouched starting point comes back as a valid result
        assert_eq!(result.variables[0], -1.2);
    }

    #[test]
    fn empty_problem_is_trivially_converged() {
        struct Empty;
        impl FitObjective for Empty {
            fn variables(&self) -> DVector<f64> {
                DVector::from_vec(vec![])
            }
            fn eval(&self, _fit: &DVector<f64>) -> f64 {
                7.0
            }
            fn eval_grad(&self, _fit: &DVector<f64>, _grads: &mut DVector<f64>) -> f64 {
                7.0
            }
        }
        let result = BfgsOptimizer::default().minimize(&Empty);
        assert!(result.converged);
        assert_eq!(result.value, 7.0);
        assert_eq!(result.iterations, 0);
    }
}
