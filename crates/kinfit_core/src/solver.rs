//! Constrained least-squares solver.
//!
//! Minimizes `chi^2 = Σ ((x_i - x0_i) / σ_i)^2` over the measured variables
//! subject to `g(x) = 0`, by iterating the linearized Lagrange-multiplier
//! (KKT) system
//!
//! ```text
//! [ W  Aᵀ ] [ Δx ]   [ W (x0 - x) ]
//! [ A  0  ] [ λ  ] = [   -g(x)    ]
//! ```
//!
//! with `W = diag(1/σ²)` (zero rows for unmeasured variables) and `A` the
//! constraint Jacobian. The upper-left block of the inverted KKT matrix at the
//! solution is the covariance of the fitted variables.

use anyhow::{anyhow, bail, Context};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, warn};

use crate::autodiff::{self, Dual};
use crate::settings::SolverSettings;
use crate::traits::ConstraintSystem;
use crate::variable::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Success,
    /// Iteration budget exhausted with constraints still violated, or the
    /// linearized system became singular.
    NoConvergence,
    /// Iteration budget exhausted with constraints met but chi^2 still moving.
    TooManyIterations,
    /// A variable left its domain, or a residual became non-finite.
    UnphysicalRegion,
}

/// Outcome of one fit attempt. Pulls follow the fitter's variable order,
/// `NaN` for unmeasured variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub status: FitStatus,
    pub chi_square: f64,
    pub ndof: i32,
    pub probability: f64,
    pub iterations: usize,
    pub pulls: Vec<f64>,
}

impl FitResult {
    pub fn is_success(&self) -> bool {
        self.status == FitStatus::Success
    }
}

/// Upper-tail chi^2 probability; `NaN` when there are no degrees of freedom.
pub fn chi2_probability(chi2: f64, ndof: i32) -> f64 {
    if ndof <= 0 || !chi2.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(ndof as f64) {
        Ok(dist) => dist.sf(chi2.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// One solver input: central value, sigma (0 = unmeasured) and domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverVariable {
    pub value: f64,
    pub sigma: f64,
    pub domain: Domain,
}

/// Residuals plus their Jacobian, as seen by a [`Solver`].
pub trait ConstraintProblem {
    fn dimension(&self) -> usize;
    fn constraint_count(&self) -> usize;
    fn evaluate(&self, x: &[f64], out: &mut [f64]);
    fn linearize(&self, x: &[f64]) -> DMatrix<f64>;
}

/// Any constraint system written generically over the scalar type is a
/// problem: values through `f64`, Jacobian columns through dual numbers.
impl<S> ConstraintProblem for S
where
    S: ConstraintSystem<f64> + ConstraintSystem<Dual>,
{
    fn dimension(&self) -> usize {
        <S as ConstraintSystem<f64>>::dimension(self)
    }

    fn constraint_count(&self) -> usize {
        <S as ConstraintSystem<f64>>::constraint_count(self)
    }

    fn evaluate(&self, x: &[f64], out: &mut [f64]) {
        <S as ConstraintSystem<f64>>::apply(self, x, out)
    }

    fn linearize(&self, x: &[f64]) -> DMatrix<f64> {
        autodiff::jacobian(self, x)
    }
}

/// Everything the fitters read back from a solve.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub result: FitResult,
    pub values: Vec<f64>,
    /// Post-fit sigmas (sqrt of the covariance diagonal).
    pub sigmas: Vec<f64>,
    pub covariance: DMatrix<f64>,
}

/// The numerical engine behind the fitters.
pub trait Solver: Send {
    fn solve(&self, problem: &dyn ConstraintProblem, variables: &[SolverVariable])
        -> SolverOutcome;
}

/// Iterated Lagrange-multiplier solver.
#[derive(Debug, Clone, Copy, Default)]
pub struct LagrangeSolver {
    pub settings: SolverSettings,
}

impl LagrangeSolver {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }
}

impl Solver for LagrangeSolver {
    fn solve(
        &self,
        problem: &dyn ConstraintProblem,
        variables: &[SolverVariable],
    ) -> SolverOutcome {
        let settings = &self.settings;
        let n = variables.len();
        let m = problem.constraint_count();
        debug_assert_eq!(problem.dimension(), n);

        let x0: Vec<f64> = variables.iter().map(|v| v.value).collect();
        let weights: Vec<f64> = variables
            .iter()
            .map(|v| if v.sigma > 0.0 { 1.0 / (v.sigma * v.sigma) } else { 0.0 })
            .collect();
        let unmeasured = variables.iter().filter(|v| v.sigma == 0.0).count();
        let ndof = m as i32 - unmeasured as i32;

        let mut x = x0.clone();
        let mut g = vec![0.0; m];
        let mut chi2 = 0.0;
        let mut previous_chi2: Option<f64> = None;
        let mut iterations = 0usize;
        let mut jac = DMatrix::zeros(m, n);

        let status = if let Some(i) = outside_domain(variables, &x) {
            debug!(variable = i, value = x[i], "start value outside domain");
            FitStatus::UnphysicalRegion
        } else {
            loop {
                problem.evaluate(&x, &mut g);
                if g.iter().any(|v| !v.is_finite()) {
                    break FitStatus::UnphysicalRegion;
                }
                chi2 = chi_square(&x, &x0, &weights);
                let constraints_met = max_abs(&g) <= settings.constraint_tolerance;
                jac = problem.linearize(&x);

                if let Some(prev) = previous_chi2 {
                    if constraints_met && (chi2 - prev).abs() <= settings.chi2_tolerance {
                        break FitStatus::Success;
                    }
                }
                if iterations >= settings.max_iterations {
                    break if constraints_met {
                        FitStatus::TooManyIterations
                    } else {
                        FitStatus::NoConvergence
                    };
                }

                let step = match kkt_step(&jac, &weights, &x, &x0, &g) {
                    Ok(step) => step,
                    Err(err) => {
                        warn!("constrained fit step failed: {err:#}");
                        break FitStatus::NoConvergence;
                    }
                };
                for (xi, dx) in x.iter_mut().zip(step.iter()) {
                    *xi += dx;
                }
                iterations += 1;
                previous_chi2 = Some(chi2);

                if let Some(i) = outside_domain(variables, &x) {
                    debug!(variable = i, value = x[i], iterations, "left physical domain");
                    break FitStatus::UnphysicalRegion;
                }
            }
        };

        let (status, covariance) = if status == FitStatus::Success {
            match kkt_covariance(&jac, &weights) {
                Ok(cov) => (status, cov),
                Err(err) => {
                    warn!("covariance after fit unavailable: {err:#}");
                    (FitStatus::NoConvergence, DMatrix::from_element(n, n, f64::NAN))
                }
            }
        } else {
            (status, DMatrix::from_element(n, n, f64::NAN))
        };

        let sigmas: Vec<f64> = (0..n).map(|i| covariance[(i, i)].max(0.0).sqrt()).collect();
        let pulls: Vec<f64> = (0..n)
            .map(|i| pull(variables[i].sigma, covariance[(i, i)], x0[i], x[i]))
            .collect();
        let probability = if status == FitStatus::Success {
            chi2_probability(chi2, ndof)
        } else {
            0.0
        };

        debug!(?status, chi2, ndof, iterations, "constrained fit finished");

        SolverOutcome {
            result: FitResult {
                status,
                chi_square: chi2,
                ndof,
                probability,
                iterations,
                pulls,
            },
            values: x,
            sigmas,
            covariance,
        }
    }
}

/// `(before - after) / sqrt(σ_before² - σ_after²)`; `NaN` for unmeasured
/// variables, 0 where the fit did not shrink the variance.
fn pull(sigma_before: f64, variance_after: f64, before: f64, after: f64) -> f64 {
    if sigma_before <= 0.0 || !variance_after.is_finite() {
        return f64::NAN;
    }
    let variance_before = sigma_before * sigma_before;
    let denom = variance_before - variance_after;
    if denom <= 1e-12 * variance_before {
        return 0.0;
    }
    (before - after) / denom.sqrt()
}

fn chi_square(x: &[f64], x0: &[f64], weights: &[f64]) -> f64 {
    x.iter()
        .zip(x0)
        .zip(weights)
        .map(|((xi, x0i), w)| w * (xi - x0i) * (xi - x0i))
        .sum()
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc, v| acc.max(v.abs()))
}

fn outside_domain(variables: &[SolverVariable], x: &[f64]) -> Option<usize> {
    (0..x.len()).find(|&i| !variables[i].domain.contains(x[i]))
}

fn kkt_matrix(jac: &DMatrix<f64>, weights: &[f64]) -> DMatrix<f64> {
    let n = weights.len();
    let m = jac.nrows();
    let mut k = DMatrix::zeros(n + m, n + m);
    for (i, w) in weights.iter().enumerate() {
        k[(i, i)] = *w;
    }
    for row in 0..m {
        for col in 0..n {
            k[(n + row, col)] = jac[(row, col)];
            k[(col, n + row)] = jac[(row, col)];
        }
    }
    k
}

fn kkt_step(
    jac: &DMatrix<f64>,
    weights: &[f64],
    x: &[f64],
    x0: &[f64],
    g: &[f64],
) -> anyhow::Result<Vec<f64>> {
    let n = weights.len();
    let m = g.len();
    let k = kkt_matrix(jac, weights);
    let mut rhs = DVector::zeros(n + m);
    for i in 0..n {
        rhs[i] = weights[i] * (x0[i] - x[i]);
    }
    for (row, gi) in g.iter().enumerate() {
        rhs[n + row] = -gi;
    }
    let solution = k
        .lu()
        .solve(&rhs)
        .ok_or_else(|| anyhow!("KKT matrix is singular"))
        .context("Failed to solve linearized constraint system")?;
    if solution.iter().any(|v| !v.is_finite()) {
        bail!("linearized step is not finite");
    }
    Ok(solution.rows(0, n).iter().copied().collect())
}

fn kkt_covariance(jac: &DMatrix<f64>, weights: &[f64]) -> anyhow::Result<DMatrix<f64>> {
    let n = weights.len();
    let inverse = kkt_matrix(jac, weights)
        .try_inverse()
        .ok_or_else(|| anyhow!("KKT matrix is singular at the solution"))?;
    Ok(inverse.view((0, 0), (n, n)).into_owned())
}
