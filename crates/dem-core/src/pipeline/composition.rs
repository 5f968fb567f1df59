//! First-ionization-potential bias maps.
//!
//! For a ratio of a low-FIP line `L` and a high-FIP line `H`, each pixel's
//! DEM is rescaled so that it reproduces the observed `L`, then used to
//! predict `H`. The bias is `predicted(H) / observed(H)`.

use super::artifacts::write_json_artifact;
use super::estimator::{check_table_grid, emissivity_failure, forward_failure};
use crate::config::RunContext;
use crate::domain::{
    CombinedResult, CompositionResult, DemError, DemResult, Frame, Observation, RatioDefinition,
};
use crate::emissivity::{EmissivityError, EmissivityProvider};
use crate::numerics::predict_intensity;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{info, warn};

pub const BIAS_MEASUREMENT: &str = "FIP Bias";

/// Bias map with the observation header, relabelled for the ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionMap {
    pub bias: Frame,
    pub meta: Map<String, Value>,
}

#[derive(Debug)]
pub enum RatioOutcome {
    Completed {
        label: String,
        artifact: PathBuf,
        map_artifact: PathBuf,
        /// Pixels whose bias is not a finite number.
        degenerate_pixels: usize,
    },
    Failed {
        label: String,
        cause: DemError,
    },
}

impl RatioOutcome {
    pub fn label(&self) -> &str {
        match self {
            Self::Completed { label, .. } | Self::Failed { label, .. } => label,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Default)]
pub struct CompositionReport {
    pub outcomes: Vec<RatioOutcome>,
}

impl CompositionReport {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(RatioOutcome::is_failed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &RatioOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.is_failed())
    }

    pub fn completed(&self) -> impl Iterator<Item = &RatioOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_failed())
    }
}

/// Computes and persists every ratio. A failing ratio is recorded in the
/// report and the remaining ratios still run; only a combined result that
/// does not fit the observation aborts the stage.
pub fn run_composition_stage(
    pool: &ThreadPool,
    observation: &Observation,
    combined: &CombinedResult,
    emissivity: &dyn EmissivityProvider,
    ratios: &[RatioDefinition],
    context: &RunContext,
) -> DemResult<CompositionReport> {
    if combined.rows() != observation.rows() || combined.columns() != observation.columns() {
        return Err(DemError::input_validation(
            "INPUT.COMBINED_SHAPE",
            format!(
                "combined result is {}x{} but the observation is {}x{}",
                combined.rows(),
                combined.columns(),
                observation.rows(),
                observation.columns()
            ),
        ));
    }

    info!(ratios = ratios.len(), "starting composition stage");
    let mut report = CompositionReport::default();
    for ratio in ratios {
        let outcome = match compute_and_persist(pool, observation, combined, emissivity, ratio, context) {
            Ok((artifact, map_artifact, degenerate_pixels)) => {
                info!(ratio = %ratio, degenerate_pixels, "composition ratio written");
                RatioOutcome::Completed {
                    label: ratio.label.clone(),
                    artifact,
                    map_artifact,
                    degenerate_pixels,
                }
            }
            Err(cause) => {
                warn!(ratio = %ratio, error = %cause, "composition ratio failed");
                RatioOutcome::Failed {
                    label: ratio.label.clone(),
                    cause,
                }
            }
        };
        report.outcomes.push(outcome);
    }

    Ok(report)
}

fn compute_and_persist(
    pool: &ThreadPool,
    observation: &Observation,
    combined: &CombinedResult,
    emissivity: &dyn EmissivityProvider,
    ratio: &RatioDefinition,
    context: &RunContext,
) -> DemResult<(PathBuf, PathBuf, usize)> {
    let result = compute_ratio(pool, observation, combined, emissivity, ratio, context)?;
    let degenerate_pixels = result
        .bias
        .values()
        .iter()
        .filter(|value| !value.is_finite())
        .count();

    let artifact = context.composition_path(&ratio.label);
    write_json_artifact(&artifact, &result)?;

    let map = CompositionMap {
        bias: result.bias,
        meta: corrected_metadata(&observation.meta, &ratio.name),
    };
    let map_artifact = context.composition_map_path(&ratio.label);
    write_json_artifact(&map_artifact, &map)?;

    Ok((artifact, map_artifact, degenerate_pixels))
}

/// Bias map for one ratio; pixels are spread over `pool`.
pub fn compute_ratio(
    pool: &ThreadPool,
    observation: &Observation,
    combined: &CombinedResult,
    emissivity: &dyn EmissivityProvider,
    ratio: &RatioDefinition,
    context: &RunContext,
) -> DemResult<CompositionResult> {
    let line_index = |line: &str| {
        observation.lines.position(line).ok_or_else(|| {
            DemError::computation(
                "COMPUTE.RATIO_LINE_ABSENT",
                format!("ratio {} needs line '{}' which the observation lacks", ratio, line),
            )
        })
    };
    let low = line_index(&ratio.low_line)?;
    let high = line_index(&ratio.high_line)?;

    let (rows, columns) = (combined.rows(), combined.columns());
    let pixels: Vec<(usize, usize, f64)> = pool.install(|| {
        (0..rows * columns)
            .into_par_iter()
            .map(|index| {
                let (row, column) = (index / columns, index % columns);
                pixel_bias(observation, combined, emissivity, ratio, context, (row, column), (low, high))
                    .map(|bias| (row, column, bias))
            })
            .collect::<DemResult<Vec<_>>>()
    })?;

    let mut bias = Frame::zeros(rows, columns);
    for (row, column, value) in pixels {
        bias.set(row, column, value);
    }

    Ok(CompositionResult {
        label: ratio.label.clone(),
        name: ratio.name.clone(),
        bias,
        chi_square: combined.chi_square.clone(),
        lines_used: combined.lines_used.clone(),
    })
}

fn pixel_bias(
    observation: &Observation,
    combined: &CombinedResult,
    emissivity: &dyn EmissivityProvider,
    ratio: &RatioDefinition,
    context: &RunContext,
    (row, column): (usize, usize),
    (low, high): (usize, usize),
) -> DemResult<f64> {
    let table = match emissivity.emissivity(observation.log_density.get(row, column)) {
        Ok(table) => table,
        Err(EmissivityError::InvalidDensity { .. }) => return Ok(f64::NAN),
        Err(error) => return Err(emissivity_failure(error)),
    };
    check_table_grid(&table, combined.dem.depth())?;
    let low_rates = table.rates(&ratio.low_line).map_err(emissivity_failure)?;
    let high_rates = table.rates(&ratio.high_line).map_err(emissivity_failure)?;

    let axis = context.config.integration_axis.values(&table.log_temperatures);
    let dem = combined.dem.pixel(row, column);
    let predicted_low = predict_intensity(low_rates, &axis, dem).map_err(forward_failure)?;
    if predicted_low == 0.0 || !predicted_low.is_finite() {
        return Ok(f64::NAN);
    }

    let scale = observation.intensity.get(row, column, low) / predicted_low;
    let scaled: Vec<f64> = dem.iter().map(|value| value * scale).collect();
    let predicted_high = predict_intensity(high_rates, &axis, &scaled).map_err(forward_failure)?;
    Ok(predicted_high / observation.intensity.get(row, column, high))
}

/// Header of a bias map: the measurement becomes the FIP bias, the intensity
/// unit is dropped and the line id names the ratio.
pub fn corrected_metadata(meta: &Map<String, Value>, ratio_name: &str) -> Map<String, Value> {
    let mut corrected = meta.clone();
    corrected.insert("measrmnt".to_string(), Value::from(BIAS_MEASUREMENT));
    corrected.remove("bunit");
    corrected.insert("line_id".to_string(), Value::from(ratio_name));
    corrected
}
