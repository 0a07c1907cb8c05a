//! Levenberg-Marquardt nonlinear least squares
//!
//! Minimises `Σ rᵢ(p)²` for a problem supplying residuals (already divided
//! by their uncertainties when weights are known) and, optionally, an
//! analytic Jacobian. Damping follows Marquardt's diagonal scaling: the
//! normal matrix `JᵀJ` has `λ·diag(JᵀJ)` added before each Cholesky solve,
//! `λ` shrinking after accepted steps and growing after rejected ones.
//!
//! Parameter uncertainties are the square roots of the diagonal of
//! `(JᵀJ)⁻¹` at the solution, optionally scaled by the reduced chi-squared
//! when the residuals were not weighted by real uncertainties.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative forward-difference step, roughly sqrt(f64::EPSILON)
const FD_STEP: f64 = 1.49e-8;

/// Floor for the damping term of parameters the residuals barely depend on
const DIAG_FLOOR: f64 = 1e-12;

const LAMBDA_MIN: f64 = 1e-15;
const LAMBDA_MAX: f64 = 1e16;

/// Errors that prevent a fit from starting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LmError {
    #[error("invalid problem: {0}")]
    InvalidProblem(String),

    #[error("residuals at the initial guess are not finite")]
    NonFiniteStart,
}

/// A least-squares problem: residual vector as a function of parameters.
pub trait LeastSquaresProblem {
    /// Number of free parameters
    fn num_params(&self) -> usize;

    /// Number of residuals (data points)
    fn num_residuals(&self) -> usize;

    /// Fill `out` with the residuals at `params`.
    fn residuals(&self, params: &[f64], out: &mut [f64]);

    /// Fill `jac` (num_residuals × num_params) with ∂rᵢ/∂pⱼ.
    ///
    /// Defaults to forward differences of [`residuals`](Self::residuals).
    fn jacobian(&self, params: &[f64], jac: &mut DMatrix<f64>) {
        forward_difference_jacobian(self, params, jac);
    }
}

/// Forward-difference Jacobian of the residuals of `problem`.
pub fn forward_difference_jacobian<P>(problem: &P, params: &[f64], jac: &mut DMatrix<f64>)
where
    P: LeastSquaresProblem + ?Sized,
{
    let m = problem.num_residuals();
    let mut base = vec![0.0; m];
    let mut shifted = vec![0.0; m];
    problem.residuals(params, &mut base);

    let mut probe = params.to_vec();
    for j in 0..params.len() {
        let h = FD_STEP * params[j].abs().max(1.0);
        probe[j] = params[j] + h;
        problem.residuals(&probe, &mut shifted);
        for i in 0..m {
            jac[(i, j)] = (shifted[i] - base[i]) / h;
        }
        probe[j] = params[j];
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmConfig {
    /// Maximum number of Jacobian evaluations
    pub max_iterations: usize,
    /// Stop when an accepted step reduces the cost by less than this fraction
    pub ftol: f64,
    /// Stop when the step norm is below `xtol × (‖p‖ + xtol)`
    pub xtol: f64,
    /// Stop when the largest gradient component falls below this value
    pub gtol: f64,
    /// Starting damping factor
    pub initial_lambda: f64,
    /// Scale uncertainties by sqrt(χ²/dof)
    pub scale_errors: bool,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-12,
            initial_lambda: 1e-3,
            scale_errors: false,
        }
    }
}

/// Why the optimizer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Relative cost reduction fell below `ftol`
    CostTolerance,
    /// Step size fell below `xtol`
    StepTolerance,
    /// Gradient fell below `gtol`
    GradientTolerance,
    /// No damped step could reduce the cost any further
    NoFurtherReduction,
    /// Iteration budget exhausted
    MaxIterations,
}

impl Termination {
    /// Every termination except running out of iterations counts as converged.
    pub fn is_converged(self) -> bool {
        !matches!(self, Termination::MaxIterations)
    }
}

/// Result of a Levenberg-Marquardt fit
#[derive(Debug, Clone)]
pub struct LmFit {
    /// Best-fit parameters
    pub params: Vec<f64>,
    /// 1σ uncertainties (NaN when the covariance is singular)
    pub errors: Vec<f64>,
    /// Sum of squared residuals at the solution
    pub chi_squared: f64,
    /// Degrees of freedom (residuals minus parameters)
    pub dof: usize,
    /// Number of outer iterations performed
    pub iterations: usize,
    /// Stopping reason
    pub termination: Termination,
    /// Shorthand for `termination.is_converged()`
    pub converged: bool,
}

fn sum_of_squares(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

/// Minimise the squared residuals of `problem` starting from `initial`.
///
/// # Arguments
/// * `problem` - Residual (and optionally Jacobian) provider
/// * `initial` - Starting parameter vector, length `problem.num_params()`
/// * `config` - Tolerances and iteration budget
///
/// # Returns
/// * `Ok(LmFit)` - Solution; check `converged` before trusting it
/// * `Err(LmError)` - Mis-dimensioned problem or non-finite starting point
pub fn levenberg_marquardt<P: LeastSquaresProblem>(
    problem: &P,
    initial: &[f64],
    config: &LmConfig,
) -> Result<LmFit, LmError> {
    let n = problem.num_params();
    let m = problem.num_residuals();

    if n == 0 {
        return Err(LmError::InvalidProblem("no free parameters".to_string()));
    }
    if initial.len() != n {
        return Err(LmError::InvalidProblem(format!(
            "initial guess has {} values, problem has {} parameters",
            initial.len(),
            n
        )));
    }
    if m < n {
        return Err(LmError::InvalidProblem(format!(
            "{m} residuals cannot constrain {n} parameters"
        )));
    }

    let mut params = DVector::from_column_slice(initial);
    let mut residuals = vec![0.0; m];
    problem.residuals(params.as_slice(), &mut residuals);
    let mut cost = sum_of_squares(&residuals);
    if !cost.is_finite() {
        return Err(LmError::NonFiniteStart);
    }

    let mut lambda = config.initial_lambda;
    let mut jac = DMatrix::<f64>::zeros(m, n);
    let mut trial_residuals = vec![0.0; m];
    let mut termination = Termination::MaxIterations;
    let mut iterations = 0;

    'outer: while iterations < config.max_iterations {
        iterations += 1;
        problem.jacobian(params.as_slice(), &mut jac);

        let r = DVector::from_column_slice(&residuals);
        let jtj = jac.tr_mul(&jac);
        let gradient = jac.tr_mul(&r);

        if gradient.amax() <= config.gtol {
            termination = Termination::GradientTolerance;
            break;
        }

        loop {
            let mut damped = jtj.clone();
            for k in 0..n {
                damped[(k, k)] += lambda * jtj[(k, k)].max(DIAG_FLOOR);
            }

            if let Some(cholesky) = damped.cholesky() {
                let step = cholesky.solve(&(-&gradient));
                let trial = &params + &step;
                problem.residuals(trial.as_slice(), &mut trial_residuals);
                let trial_cost = sum_of_squares(&trial_residuals);

                if trial_cost.is_finite() && trial_cost < cost {
                    let reduction = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                    let small_step =
                        step.norm() <= config.xtol * (params.norm() + config.xtol);

                    params = trial;
                    std::mem::swap(&mut residuals, &mut trial_residuals);
                    cost = trial_cost;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);

                    if reduction <= config.ftol {
                        termination = Termination::CostTolerance;
                        break 'outer;
                    }
                    if small_step {
                        termination = Termination::StepTolerance;
                        break 'outer;
                    }
                    continue 'outer;
                }
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                termination = Termination::NoFurtherReduction;
                break 'outer;
            }
        }
    }

    let dof = m - n;
    problem.jacobian(params.as_slice(), &mut jac);
    let covariance = jac.tr_mul(&jac).try_inverse();

    let error_scale = if config.scale_errors && dof > 0 {
        (cost / dof as f64).sqrt()
    } else {
        1.0
    };

    let errors = match covariance {
        Some(cov) => (0..n)
            .map(|k| {
                let var = cov[(k, k)];
                if var >= 0.0 {
                    var.sqrt() * error_scale
                } else {
                    f64::NAN
                }
            })
            .collect(),
        None => vec![f64::NAN; n],
    };

    Ok(LmFit {
        params: params.iter().copied().collect(),
        errors,
        chi_squared: cost,
        dof,
        iterations,
        termination,
        converged: termination.is_converged(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// y = a·exp(-(x-b)²/(2c²)) sampled without noise
    struct GaussianProblem {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl GaussianProblem {
        fn new(a: f64, b: f64, c: f64) -> Self {
            let x: Vec<f64> = (0..60).map(|i| -3.0 + 0.1 * i as f64).collect();
            let y = x
                .iter()
                .map(|&xi| a * (-(xi - b).powi(2) / (2.0 * c * c)).exp())
                .collect();
            Self { x, y }
        }
    }

    impl LeastSquaresProblem for GaussianProblem {
        fn num_params(&self) -> usize {
            3
        }

        fn num_residuals(&self) -> usize {
            self.x.len()
        }

        fn residuals(&self, p: &[f64], out: &mut [f64]) {
            for (i, (&xi, &yi)) in self.x.iter().zip(&self.y).enumerate() {
                out[i] = yi - p[0] * (-(xi - p[1]).powi(2) / (2.0 * p[2] * p[2])).exp();
            }
        }
    }

    /// Straight line with unit weights, solvable in closed form
    struct LineProblem {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquaresProblem for LineProblem {
        fn num_params(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            self.x.len()
        }

        fn residuals(&self, p: &[f64], out: &mut [f64]) {
            for i in 0..self.x.len() {
                out[i] = self.y[i] - (p[0] + p[1] * self.x[i]);
            }
        }

        fn jacobian(&self, _p: &[f64], jac: &mut DMatrix<f64>) {
            for i in 0..self.x.len() {
                jac[(i, 0)] = -1.0;
                jac[(i, 1)] = -self.x[i];
            }
        }
    }

    #[test]
    fn test_recovers_noise_free_gaussian() {
        let problem = GaussianProblem::new(1.3, 0.4, 0.7);
        let fit = levenberg_marquardt(&problem, &[1.0, 0.0, 1.0], &LmConfig::default()).unwrap();

        assert!(fit.converged, "termination: {:?}", fit.termination);
        assert_relative_eq!(fit.params[0], 1.3, epsilon = 1e-6);
        assert_relative_eq!(fit.params[1], 0.4, epsilon = 1e-6);
        assert_relative_eq!(fit.params[2].abs(), 0.7, epsilon = 1e-6);
        assert!(fit.chi_squared < 1e-12);
    }

    #[test]
    fn test_line_errors_match_closed_form() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &xi)| 2.0 + 0.5 * xi + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        let problem = LineProblem {
            x: x.clone(),
            y,
        };

        let fit = levenberg_marquardt(&problem, &[0.0, 0.0], &LmConfig::default()).unwrap();
        assert!(fit.converged);

        // Unit weights: var(slope) = 1 / Σ(x - x̄)²
        let mean = x.iter().sum::<f64>() / x.len() as f64;
        let sxx: f64 = x.iter().map(|v| (v - mean).powi(2)).sum();
        assert_relative_eq!(fit.errors[1], (1.0 / sxx).sqrt(), epsilon = 1e-9);
        assert_eq!(fit.dof, 8);
    }

    #[test]
    fn test_scaled_errors_use_reduced_chi_squared() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &xi)| 1.0 + xi + if i % 2 == 0 { 0.2 } else { -0.2 })
            .collect();
        let problem = LineProblem { x, y };

        let unscaled = levenberg_marquardt(&problem, &[0.0, 0.0], &LmConfig::default()).unwrap();
        let config = LmConfig {
            scale_errors: true,
            ..Default::default()
        };
        let scaled = levenberg_marquardt(&problem, &[0.0, 0.0], &config).unwrap();

        let factor = (unscaled.chi_squared / unscaled.dof as f64).sqrt();
        assert_relative_eq!(scaled.errors[0], unscaled.errors[0] * factor, epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_wrong_guess_length() {
        let problem = GaussianProblem::new(1.0, 0.0, 1.0);
        let err = levenberg_marquardt(&problem, &[1.0], &LmConfig::default()).unwrap_err();
        assert!(matches!(err, LmError::InvalidProblem(_)));
    }

    #[test]
    fn test_non_finite_start_is_error() {
        let problem = GaussianProblem::new(1.0, 0.0, 1.0);
        let err =
            levenberg_marquardt(&problem, &[f64::NAN, 0.0, 1.0], &LmConfig::default()).unwrap_err();
        assert_eq!(err, LmError::NonFiniteStart);
    }

    #[test]
    fn test_iteration_budget_reports_not_converged() {
        let problem = GaussianProblem::new(1.3, 0.4, 0.7);
        let config = LmConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let fit = levenberg_marquardt(&problem, &[0.2, -1.0, 2.0], &config).unwrap();
        assert_eq!(fit.termination, Termination::MaxIterations);
        assert!(!fit.converged);
    }
}
