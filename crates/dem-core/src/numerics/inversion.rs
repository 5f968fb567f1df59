//! Regularized DEM inversion.
//!
//! The pipeline only depends on [`InversionOperator`]; [`RegularizedInversion`]
//! is the operator shipped with the crate. It solves the zeroth-order
//! Tikhonov problem
//!
//! `min ||A x - b||^2 + lambda ||L x||^2`
//!
//! where `A` is the error-weighted response on the working grid, `b` the
//! error-weighted intensities and `L` a diagonal weight taken from the
//! minimum emission-measure loci. `lambda` follows the discrepancy principle
//! (`chi^2 = tweak * lines`). A negative solution grows `tweak` by the growth
//! factor and solves again.
//!
//! Because there are far fewer lines than temperature bins, every solve goes
//! through the `lines x lines` system `(A W A^T + lambda I) u = b` with
//! `W = L^-2` and `x = W A^T u`.

use super::interpolation::{InterpolationError, interpolate_linear};
use super::linalg::{DenseMatrix, LuError, lu_factorize, lu_solve};
use super::stable_sum_iter;
use serde::{Deserialize, Serialize};

const BISECTION_STEPS: usize = 60;
const LAMBDA_DECADES_BELOW: f64 = 20.0;
const LAMBDA_DECADES_ABOVE: f64 = 10.0;
const MIN_RESOLUTION_DIAGONAL: f64 = 1.0e-3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InversionError {
    #[error("inversion needs at least one line and two target temperatures")]
    EmptyProblem,
    #[error("inversion length mismatch: intensities={intensities}, errors={errors}")]
    LengthMismatch { intensities: usize, errors: usize },
    #[error(
        "response matrix is {rows}x{cols}, expected {temperatures} temperatures x {lines} lines"
    )]
    ResponseShape {
        rows: usize,
        cols: usize,
        temperatures: usize,
        lines: usize,
    },
    #[error("intensity error at index {index} must be finite and > 0, got {value}")]
    InvalidError { index: usize, value: f64 },
    #[error("target temperatures must be positive and increasing at index {index}")]
    InvalidTargetTemperatures { index: usize },
    #[error(transparent)]
    Interpolation(#[from] InterpolationError),
    #[error(transparent)]
    Linear(#[from] LuError),
    #[error("no non-negative solution within {iterations} regularization iterations")]
    NotConverged { iterations: usize },
    #[error("inversion produced a non-finite solution")]
    NonFiniteSolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub regularization_tweak: f64,
    pub growth_factor: f64,
    /// Solve for the emission measure per bin instead of the DEM itself.
    pub emission_measure_mode: bool,
    /// Weight the regularization by the minimum emission-measure loci.
    pub minimum_loci: bool,
    pub enforce_positivity: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            regularization_tweak: 0.001,
            growth_factor: 1.05,
            emission_measure_mode: true,
            minimum_loci: true,
            enforce_positivity: true,
        }
    }
}

/// Inputs of one inversion. `response` is `temperatures x lines`, sampled at
/// `response_log_temperatures`; `target_temperatures` are the working-grid
/// bin edges (linear kelvin).
#[derive(Debug, Clone, Copy)]
pub struct InversionProblem<'a> {
    pub intensities: &'a [f64],
    pub errors: &'a [f64],
    pub response: &'a DenseMatrix,
    pub response_log_temperatures: &'a [f64],
    pub target_temperatures: &'a [f64],
    pub settings: &'a SolverSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InversionSolution {
    pub dem: Vec<f64>,
    pub dem_error: Vec<f64>,
    pub log_temperature_error: Vec<f64>,
    pub chi_square: f64,
    pub reconstructed_intensities: Vec<f64>,
}

pub trait InversionOperator: Sync {
    fn invert(&self, problem: &InversionProblem<'_>) -> Result<InversionSolution, InversionError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegularizedInversion;

impl InversionOperator for RegularizedInversion {
    fn invert(&self, problem: &InversionProblem<'_>) -> Result<InversionSolution, InversionError> {
        let system = WeightedSystem::build(problem)?;
        let settings = problem.settings;
        let gram = system.gram();
        let lambda_scale = (0..gram.nrows()).map(|i| gram[(i, i)]).sum::<f64>() / gram.nrows() as f64;
        let lambda_scale = if lambda_scale > 0.0 { lambda_scale } else { 1.0 };
        let lambda_bounds = (
            lambda_scale * 10f64.powf(-LAMBDA_DECADES_BELOW),
            lambda_scale * 10f64.powf(LAMBDA_DECADES_ABOVE),
        );

        let mut tweak = settings.regularization_tweak;
        for _ in 0..settings.max_iterations.max(1) {
            let target = tweak * system.lines() as f64;
            let (lambda, dual) = discrepancy_lambda(&gram, &system.rhs, target, lambda_bounds)?;
            let solution = system.primal(&dual);

            if solution.iter().any(|value| !value.is_finite()) {
                return Err(InversionError::NonFiniteSolution);
            }
            let negative = solution.iter().any(|value| *value < 0.0);
            if !settings.enforce_positivity || !negative {
                return system.finish(&gram, lambda, solution, &dual);
            }
            if lambda >= lambda_bounds.1 {
                break;
            }
            tweak *= settings.growth_factor;
        }

        Err(InversionError::NotConverged {
            iterations: settings.max_iterations,
        })
    }
}

/// Error-weighted response `A` (lines x bins), weighted data `b` and the
/// regularization weights `W = L^-2`.
struct WeightedSystem<'a> {
    weighted_response: DenseMatrix,
    rhs: Vec<f64>,
    weights: Vec<f64>,
    bin_widths: Vec<f64>,
    log_bin_widths: Vec<f64>,
    problem: &'a InversionProblem<'a>,
}

impl<'a> WeightedSystem<'a> {
    fn build(problem: &'a InversionProblem<'a>) -> Result<Self, InversionError> {
        validate(problem)?;
        let lines = problem.intensities.len();
        let log_edges: Vec<f64> = problem
            .target_temperatures
            .iter()
            .map(|t| t.log10())
            .collect();
        let bins = log_edges.len() - 1;
        let log_centres: Vec<f64> = log_edges.windows(2).map(|p| 0.5 * (p[0] + p[1])).collect();
        let bin_widths: Vec<f64> = problem
            .target_temperatures
            .windows(2)
            .map(|p| p[1] - p[0])
            .collect();
        let log_bin_widths: Vec<f64> = log_edges.windows(2).map(|p| p[1] - p[0]).collect();

        let mut kernel = DenseMatrix::zeros(lines, bins);
        let mut column = vec![0.0; problem.response.nrows()];
        for line in 0..lines {
            for (row, value) in column.iter_mut().enumerate() {
                *value = problem.response[(row, line)];
            }
            for bin in 0..bins {
                let response =
                    interpolate_linear(log_centres[bin], problem.response_log_temperatures, &column)?;
                let measure = if problem.settings.emission_measure_mode {
                    1.0
                } else {
                    bin_widths[bin]
                };
                kernel[(line, bin)] = response.max(0.0) * measure;
            }
        }

        let weights = regularization_weights(&kernel, problem.intensities, problem.settings);

        let mut weighted_response = kernel;
        let mut rhs = vec![0.0; lines];
        for line in 0..lines {
            let error = problem.errors[line];
            rhs[line] = problem.intensities[line] / error;
            for bin in 0..bins {
                weighted_response[(line, bin)] /= error;
            }
        }

        Ok(Self {
            weighted_response,
            rhs,
            weights,
            bin_widths,
            log_bin_widths,
            problem,
        })
    }

    fn lines(&self) -> usize {
        self.weighted_response.nrows()
    }

    fn bins(&self) -> usize {
        self.weighted_response.ncols()
    }

    /// `G = A W A^T`.
    fn gram(&self) -> DenseMatrix {
        let lines = self.lines();
        let a = &self.weighted_response;
        let mut gram = DenseMatrix::zeros(lines, lines);
        for row in 0..lines {
            for col in 0..=row {
                let value = stable_sum_iter(
                    (0..self.bins()).map(|bin| a[(row, bin)] * self.weights[bin] * a[(col, bin)]),
                );
                gram[(row, col)] = value;
                gram[(col, row)] = value;
            }
        }
        gram
    }

    /// `x = W A^T u`.
    fn primal(&self, dual: &[f64]) -> Vec<f64> {
        let a = &self.weighted_response;
        (0..self.bins())
            .map(|bin| {
                self.weights[bin]
                    * stable_sum_iter((0..self.lines()).map(|line| a[(line, bin)] * dual[line]))
            })
            .collect()
    }

    fn finish(
        &self,
        gram: &DenseMatrix,
        lambda: f64,
        solution: Vec<f64>,
        dual: &[f64],
    ) -> Result<InversionSolution, InversionError> {
        let lines = self.lines();
        let bins = self.bins();
        let a = &self.weighted_response;

        let shifted = shifted_gram(gram, lambda);
        let inverse = lu_factorize(&shifted)?.invert()?;

        // F = W A^T (G + lambda I)^-1; covariance diagonal is sum_j F_ij^2 and
        // the resolution-matrix diagonal is sum_j F_ij A_ji.
        let mut dem = Vec::with_capacity(bins);
        let mut dem_error = Vec::with_capacity(bins);
        let mut log_temperature_error = Vec::with_capacity(bins);
        for bin in 0..bins {
            let mut variance = 0.0;
            let mut resolution = 0.0;
            for j in 0..lines {
                let f = self.weights[bin]
                    * stable_sum_iter((0..lines).map(|k| a[(k, bin)] * inverse[(k, j)]));
                variance += f * f;
                resolution += f * a[(j, bin)];
            }

            let to_dem = if self.problem.settings.emission_measure_mode {
                1.0 / self.bin_widths[bin]
            } else {
                1.0
            };
            dem.push(solution[bin] * to_dem);
            dem_error.push(variance.sqrt() * to_dem);
            log_temperature_error.push(
                0.5 * self.log_bin_widths[bin] / resolution.clamp(MIN_RESOLUTION_DIAGONAL, 1.0),
            );
        }

        let reconstructed_intensities = (0..lines)
            .map(|line| {
                self.problem.errors[line]
                    * stable_sum_iter((0..bins).map(|bin| a[(line, bin)] * solution[bin]))
            })
            .collect();
        let chi_square = lambda * lambda * stable_sum_iter(dual.iter().map(|u| u * u));

        Ok(InversionSolution {
            dem,
            dem_error,
            log_temperature_error,
            chi_square,
            reconstructed_intensities,
        })
    }
}

fn validate(problem: &InversionProblem<'_>) -> Result<(), InversionError> {
    let lines = problem.intensities.len();
    if lines == 0 || problem.target_temperatures.len() < 2 {
        return Err(InversionError::EmptyProblem);
    }
    if problem.errors.len() != lines {
        return Err(InversionError::LengthMismatch {
            intensities: lines,
            errors: problem.errors.len(),
        });
    }
    if problem.response.ncols() != lines
        || problem.response.nrows() != problem.response_log_temperatures.len()
    {
        return Err(InversionError::ResponseShape {
            rows: problem.response.nrows(),
            cols: problem.response.ncols(),
            temperatures: problem.response_log_temperatures.len(),
            lines,
        });
    }
    if let Some((index, value)) = problem
        .errors
        .iter()
        .copied()
        .enumerate()
        .find(|(_, value)| !value.is_finite() || *value <= 0.0)
    {
        return Err(InversionError::InvalidError { index, value });
    }
    if problem.target_temperatures[0] <= 0.0 {
        return Err(InversionError::InvalidTargetTemperatures { index: 0 });
    }
    if let Some(index) = problem
        .target_temperatures
        .windows(2)
        .position(|pair| pair[1] <= pair[0])
    {
        return Err(InversionError::InvalidTargetTemperatures { index: index + 1 });
    }
    Ok(())
}

/// `W_i = loci_i^2` where `loci_i = min_j b_j / K_ji` over lines that respond
/// in bin `i`; bins no line reaches fall back to the largest loci value.
fn regularization_weights(
    kernel: &DenseMatrix,
    intensities: &[f64],
    settings: &SolverSettings,
) -> Vec<f64> {
    let bins = kernel.ncols();
    if !settings.minimum_loci {
        return vec![1.0; bins];
    }

    let loci: Vec<Option<f64>> = (0..bins)
        .map(|bin| {
            (0..kernel.nrows())
                .filter(|line| kernel[(*line, bin)] > 0.0)
                .map(|line| intensities[line].abs() / kernel[(line, bin)])
                .filter(|value| value.is_finite() && *value > 0.0)
                .min_by(f64::total_cmp)
        })
        .collect();
    let fallback = loci
        .iter()
        .flatten()
        .copied()
        .max_by(f64::total_cmp)
        .unwrap_or(1.0);

    loci.into_iter()
        .map(|value| value.unwrap_or(fallback).powi(2))
        .collect()
}

fn shifted_gram(gram: &DenseMatrix, lambda: f64) -> DenseMatrix {
    let mut shifted = gram.clone();
    for i in 0..shifted.nrows() {
        shifted[(i, i)] += lambda;
    }
    shifted
}

/// Bisects `log10(lambda)` for `chi^2(lambda) = target`; chi-square grows
/// monotonically with lambda. Returns the lambda and the dual vector `u`.
fn discrepancy_lambda(
    gram: &DenseMatrix,
    rhs: &[f64],
    target: f64,
    bounds: (f64, f64),
) -> Result<(f64, Vec<f64>), InversionError> {
    let evaluate = |lambda: f64| -> Result<(f64, Vec<f64>), InversionError> {
        let dual = lu_solve(&shifted_gram(gram, lambda), rhs)?;
        let chi_square = lambda * lambda * stable_sum_iter(dual.iter().map(|u| u * u));
        Ok((chi_square, dual))
    };

    let (low_chi, low_dual) = evaluate(bounds.0)?;
    if low_chi >= target {
        return Ok((bounds.0, low_dual));
    }
    let (high_chi, high_dual) = evaluate(bounds.1)?;
    if high_chi <= target {
        return Ok((bounds.1, high_dual));
    }

    let mut low = bounds.0.log10();
    let mut high = bounds.1.log10();
    let mut best = (bounds.1, high_dual);
    for _ in 0..BISECTION_STEPS {
        let middle = 0.5 * (low + high);
        let lambda = 10f64.powf(middle);
        let (chi_square, dual) = evaluate(lambda)?;
        if chi_square > target {
            high = middle;
        } else {
            low = middle;
        }
        best = (lambda, dual);
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::{
        InversionError, InversionOperator, InversionProblem, RegularizedInversion, SolverSettings,
    };
    use crate::numerics::linalg::DenseMatrix;

    fn gaussian_response(log_temperatures: &[f64], peaks: &[f64]) -> DenseMatrix {
        let mut response = DenseMatrix::zeros(log_temperatures.len(), peaks.len());
        for (row, log_t) in log_temperatures.iter().enumerate() {
            for (col, peak) in peaks.iter().enumerate() {
                response[(row, col)] = (-((log_t - peak) / 0.15).powi(2)).exp();
            }
        }
        response
    }

    fn log_axis(first: f64, count: usize, step: f64) -> Vec<f64> {
        (0..count).map(|i| first + i as f64 * step).collect()
    }

    fn target_edges() -> Vec<f64> {
        log_axis(5.45, 12, 0.1)
            .into_iter()
            .map(|log_t| 10f64.powf(log_t))
            .collect()
    }

    #[test]
    fn single_line_solution_meets_discrepancy_target() {
        let response_log_t = log_axis(5.0, 21, 0.1);
        let response = gaussian_response(&response_log_t, &[6.0]);
        let settings = SolverSettings::default();
        let intensities = [100.0];
        let errors = [5.0];
        let targets = target_edges();

        let solution = RegularizedInversion
            .invert(&InversionProblem {
                intensities: &intensities,
                errors: &errors,
                response: &response,
                response_log_temperatures: &response_log_t,
                target_temperatures: &targets,
                settings: &settings,
            })
            .expect("inversion should converge");

        assert_eq!(solution.dem.len(), 11);
        assert_eq!(solution.dem_error.len(), 11);
        assert_eq!(solution.log_temperature_error.len(), 11);
        assert!(solution.dem.iter().all(|value| *value >= 0.0));
        assert!(solution.chi_square <= 0.001 * (1.0 + 1.0e-6));
        assert!((solution.reconstructed_intensities[0] - 100.0).abs() < 0.5);
    }

    #[test]
    fn positivity_is_enforced_for_multi_line_problems() {
        let response_log_t = log_axis(5.0, 21, 0.1);
        let response = gaussian_response(&response_log_t, &[5.6, 5.9, 6.2, 6.5]);
        let settings = SolverSettings::default();
        let intensities = [40.0, 300.0, 20.0, 250.0];
        let errors = [4.0, 15.0, 3.0, 12.0];
        let targets = target_edges();

        let solution = RegularizedInversion
            .invert(&InversionProblem {
                intensities: &intensities,
                errors: &errors,
                response: &response,
                response_log_temperatures: &response_log_t,
                target_temperatures: &targets,
                settings: &settings,
            })
            .expect("inversion should converge");

        assert!(solution.dem.iter().all(|value| *value >= 0.0));
        assert!(solution.chi_square.is_finite());
        assert_eq!(solution.reconstructed_intensities.len(), 4);
    }

    #[test]
    fn non_positive_errors_are_rejected() {
        let response_log_t = log_axis(5.0, 21, 0.1);
        let response = gaussian_response(&response_log_t, &[6.0]);
        let settings = SolverSettings::default();
        let targets = target_edges();

        let error = RegularizedInversion
            .invert(&InversionProblem {
                intensities: &[10.0],
                errors: &[0.0],
                response: &response,
                response_log_temperatures: &response_log_t,
                target_temperatures: &targets,
                settings: &settings,
            })
            .expect_err("zero error must be rejected");
        assert_eq!(error, InversionError::InvalidError { index: 0, value: 0.0 });
    }

    #[test]
    fn response_shape_must_match_line_count() {
        let response_log_t = log_axis(5.0, 21, 0.1);
        let response = gaussian_response(&response_log_t, &[6.0, 6.2]);
        let settings = SolverSettings::default();
        let targets = target_edges();

        let error = RegularizedInversion
            .invert(&InversionProblem {
                intensities: &[10.0],
                errors: &[1.0],
                response: &response,
                response_log_temperatures: &response_log_t,
                target_temperatures: &targets,
                settings: &settings,
            })
            .expect_err("shape mismatch");
        assert!(matches!(error, InversionError::ResponseShape { .. }));
    }
}
