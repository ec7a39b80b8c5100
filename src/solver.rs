// Position solver using least-squares optimization
//
// Hyperbolic TDOA: for every anchor n other than the time reference (index 0),
//   r_n = c * (t_n - t_0) - (|P_n - S| - |P_0 - S|)
// is minimized over the tag position S = (x, y) by Levenberg-Marquardt with
// the analytic Jacobian.

use nalgebra as na;
use na::{DMatrix, DVector, Vector2};
use tracing::debug;

use crate::constants::{
    C, MIN_ANCHOR_RANGE, SOLVER_GRADIENT_TOLERANCE, SOLVER_MAX_ITERATIONS, SOLVER_MAX_RANGE,
    SOLVER_MAX_RMS_RESIDUAL, SOLVER_RESIDUAL_TOLERANCE, SOLVER_STEP_TOLERANCE,
};
use crate::error::{PositionError, Result};
use crate::geometry::distance;

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;

/// Solver settings
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Signal propagation speed (m/s)
    pub propagation_speed: f64,
    pub max_iterations: usize,
    pub residual_tolerance: f64,
    pub gradient_tolerance: f64,
    pub step_tolerance: f64,
    /// Estimates closer than this to an anchor are rejected (m)
    pub min_anchor_range: f64,
    /// Converged points with a larger RMS residual are rejected (m)
    pub max_rms_residual: f64,
    /// Converged points further than this from the anchor centroid are rejected (m)
    pub max_range: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            propagation_speed: C,
            max_iterations: SOLVER_MAX_ITERATIONS,
            residual_tolerance: SOLVER_RESIDUAL_TOLERANCE,
            gradient_tolerance: SOLVER_GRADIENT_TOLERANCE,
            step_tolerance: SOLVER_STEP_TOLERANCE,
            min_anchor_range: MIN_ANCHOR_RANGE,
            max_rms_residual: SOLVER_MAX_RMS_RESIDUAL,
            max_range: SOLVER_MAX_RANGE,
        }
    }
}

/// Converged position
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub position: [f64; 2],
    /// Root mean square of the range-difference residuals (m)
    pub rms_residual: f64,
    /// Dilution of precision, sqrt(trace((J^T J)^-1))
    pub dop: f64,
    pub iterations: usize,
}

/// Least-squares problem for one set of arrival times
struct TdoaProblem<'a> {
    anchors: &'a [[f64; 2]],
    /// c * (t_n - t_0) for n = 1..N
    range_differences: Vec<f64>,
    min_anchor_range: f64,
    max_rms_residual: f64,
    max_range: f64,
}

impl<'a> TdoaProblem<'a> {
    fn new(anchors: &'a [[f64; 2]], times: &[f64], config: &SolverConfig) -> Result<Self> {
        if anchors.len() != times.len() {
            return Err(PositionError::DegenerateGeometry(format!(
                "{} anchors but {} arrival times",
                anchors.len(),
                times.len()
            )));
        }
        if anchors.len() < 3 {
            return Err(PositionError::DegenerateGeometry(format!(
                "2-D TDOA needs at least 3 anchors, got {}",
                anchors.len()
            )));
        }
        if let Some(i) = times.iter().position(|t| !t.is_finite()) {
            return Err(PositionError::NonFiniteCorrectedTime {
                anchor_id: format!("#{}", i),
            });
        }

        let range_differences = times[1..]
            .iter()
            .map(|t| config.propagation_speed * (t - times[0]))
            .collect();

        Ok(TdoaProblem {
            anchors,
            range_differences,
            min_anchor_range: config.min_anchor_range,
            max_rms_residual: config.max_rms_residual,
            max_range: config.max_range,
        })
    }

    fn residuals(&self, s: &Vector2<f64>) -> DVector<f64> {
        let s = [s.x, s.y];
        let rho_0 = distance(self.anchors[0], s);
        DVector::from_iterator(
            self.range_differences.len(),
            self.anchors[1..]
                .iter()
                .zip(&self.range_differences)
                .map(|(p, d)| d - (distance(*p, s) - rho_0)),
        )
    }

    /// Jacobian of the modelled range differences |P_n - S| - |P_0 - S|.
    fn jacobian(&self, s: &Vector2<f64>) -> Result<DMatrix<f64>> {
        let ranges: Vec<f64> = self
            .anchors
            .iter()
            .map(|p| distance(*p, [s.x, s.y]))
            .collect();

        if let Some(i) = ranges.iter().position(|&rho| rho < self.min_anchor_range) {
            return Err(PositionError::DegenerateGeometry(format!(
                "estimate ({:.3}, {:.3}) coincides with anchor #{}",
                s.x, s.y, i
            )));
        }

        let p0 = self.anchors[0];
        let rho_0 = ranges[0];
        let mut jacobian = DMatrix::zeros(self.anchors.len() - 1, 2);
        for (row, (p, rho)) in self.anchors[1..].iter().zip(&ranges[1..]).enumerate() {
            jacobian[(row, 0)] = (s.x - p[0]) / rho - (s.x - p0[0]) / rho_0;
            jacobian[(row, 1)] = (s.y - p[1]) / rho - (s.y - p0[1]) / rho_0;
        }

        if jacobian.iter().any(|v| !v.is_finite()) {
            return Err(PositionError::DegenerateGeometry(
                "non-finite Jacobian".to_string(),
            ));
        }
        Ok(jacobian)
    }

    /// Validate the converged point and compute its quality figures.
    fn finish(&self, x: Vector2<f64>, iterations: usize) -> Result<Solution> {
        // A vanishing gradient far from the anchors is a plateau, not a fix
        let residuals = self.residuals(&x);
        let rms_residual = (residuals.norm_squared() / residuals.len() as f64).sqrt();
        let range = distance(centroid(self.anchors), [x.x, x.y]);
        if !(rms_residual <= self.max_rms_residual && range <= self.max_range) {
            debug!(
                x = x.x,
                y = x.y,
                rms_residual,
                range,
                "Rejecting stationary point as a fix"
            );
            return Err(PositionError::ConvergenceFailure { iterations });
        }

        let jacobian = self.jacobian(&x)?;
        let jtj = jacobian.transpose() * &jacobian;
        let covariance = jtj.try_inverse().ok_or_else(|| {
            PositionError::DegenerateGeometry(format!(
                "singular geometry at ({:.3}, {:.3})",
                x.x, x.y
            ))
        })?;
        let dop = covariance.trace().sqrt();
        if !dop.is_finite() {
            return Err(PositionError::DegenerateGeometry(
                "non-finite dilution of precision".to_string(),
            ));
        }

        Ok(Solution {
            position: [x.x, x.y],
            rms_residual,
            dop,
            iterations,
        })
    }
}

/// Solve for the tag position starting from the anchor centroid.
///
/// `times[i]` is the corrected arrival time (s) at `anchors[i]`; index 0 is
/// the time reference.
pub fn solve(anchors: &[[f64; 2]], times: &[f64], config: &SolverConfig) -> Result<Solution> {
    solve_from(anchors, times, centroid(anchors), config)
}

fn centroid(anchors: &[[f64; 2]]) -> [f64; 2] {
    let n = anchors.len().max(1) as f64;
    let (sx, sy) = anchors
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    [sx / n, sy / n]
}

/// Solve for the tag position from an explicit initial guess.
pub fn solve_from(
    anchors: &[[f64; 2]],
    times: &[f64],
    initial_guess: [f64; 2],
    config: &SolverConfig,
) -> Result<Solution> {
    let problem = TdoaProblem::new(anchors, times, config)?;

    let mut x = Vector2::new(initial_guess[0], initial_guess[1]);
    let mut residuals = problem.residuals(&x);
    let mut cost = residuals.norm_squared();
    let mut lambda = INITIAL_DAMPING;

    for iteration in 0..config.max_iterations {
        let jacobian = problem.jacobian(&x)?;
        let gradient = jacobian.transpose() * &residuals;

        if residuals.norm() < config.residual_tolerance || gradient.norm() < config.gradient_tolerance {
            return problem.finish(x, iteration);
        }

        // Levenberg-Marquardt: (J^T J + λI) Δx = J^T r
        let jtj = jacobian.transpose() * &jacobian;
        loop {
            let mut damped = jtj.clone();
            for i in 0..2 {
                damped[(i, i)] += lambda;
            }

            let Some(inverse) = damped.try_inverse() else {
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    return Err(PositionError::DegenerateGeometry(
                        "singular normal equations".to_string(),
                    ));
                }
                continue;
            };

            let step = inverse * &gradient;
            let candidate = x + Vector2::new(step[0], step[1]);
            let candidate_residuals = problem.residuals(&candidate);
            let candidate_cost = candidate_residuals.norm_squared();

            if candidate_cost.is_finite() && candidate_cost < cost {
                x = candidate;
                residuals = candidate_residuals;
                cost = candidate_cost;
                lambda = (lambda * 0.1).max(MIN_DAMPING);

                if step.norm() < config.step_tolerance * (1.0 + x.norm()) {
                    return problem.finish(x, iteration + 1);
                }
                break;
            }

            lambda *= 10.0;
            if lambda > MAX_DAMPING {
                // Cost is flat to machine precision around x
                if step.norm() < config.step_tolerance * (1.0 + x.norm()) {
                    return problem.finish(x, iteration + 1);
                }
                return Err(PositionError::ConvergenceFailure {
                    iterations: iteration + 1,
                });
            }
        }
    }

    Err(PositionError::ConvergenceFailure {
        iterations: config.max_iterations,
    })
}
