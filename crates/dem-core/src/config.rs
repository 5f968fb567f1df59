//! Run configuration.
//!
//! Every knob of the pipeline lives here and is loaded from an optional JSON
//! file; absent fields take the defaults below.

use crate::domain::{DemError, DemResult};
use crate::numerics::{
    GridSpec, IntegrationAxis, SolverSettings, TemperatureGrid, checked_embedding,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const MAX_DEFAULT_WORKERS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineFilter {
    /// Lines whose identifier starts with this prefix take part in the DEM.
    pub element_prefix: String,
    /// Lines must be strictly brighter than this to be used.
    pub signal_floor: f64,
}

impl Default for LineFilter {
    fn default() -> Self {
        Self {
            element_prefix: "fe".to_string(),
            signal_floor: 5.0,
        }
    }
}

impl LineFilter {
    pub fn accepts(&self, line: &str, intensity: f64) -> bool {
        line.starts_with(&self.element_prefix) && intensity > self.signal_floor
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub line_filter: LineFilter,
    /// Fraction of the intensity added to the measurement error.
    pub systematic_error_fraction: f64,
    pub native_grid: GridSpec,
    pub working_grid: GridSpec,
    pub solver: SolverSettings,
    /// Axis of the forward-model integral, shared by the chi-square and the
    /// composition step.
    pub integration_axis: IntegrationAxis,
    pub worker_count: Option<usize>,
    /// Keep the per-column checkpoints after a successful merge.
    pub retain_checkpoints: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            line_filter: LineFilter::default(),
            systematic_error_fraction: 0.23,
            native_grid: GridSpec::NATIVE,
            working_grid: GridSpec::WORKING,
            solver: SolverSettings::default(),
            integration_axis: IntegrationAxis::default(),
            worker_count: None,
            retain_checkpoints: false,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> DemResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| {
            DemError::io_system(
                "IO.CONFIG_READ",
                format!("failed to read config '{}': {}", path.display(), source),
            )
        })?;
        serde_json::from_str(&source).map_err(|source| {
            DemError::input_validation(
                "INPUT.CONFIG_PARSE",
                format!("failed to parse config '{}': {}", path.display(), source),
            )
        })
    }

    pub fn workers(&self) -> usize {
        self.worker_count
            .filter(|count| *count > 0)
            .unwrap_or_else(default_worker_count)
    }

    /// Builds both grids and checks the working grid embeds into the native
    /// one with matching width.
    pub fn grids(&self) -> DemResult<Grids> {
        let native = TemperatureGrid::from_spec(self.native_grid).map_err(grid_error)?;
        let working = TemperatureGrid::from_spec(self.working_grid).map_err(grid_error)?;
        let embedding = checked_embedding(&native, &working).map_err(grid_error)?;
        Ok(Grids {
            native,
            working,
            embedding,
        })
    }

    pub fn validate(&self) -> DemResult<Grids> {
        if !self.systematic_error_fraction.is_finite() || self.systematic_error_fraction < 0.0 {
            return Err(DemError::input_validation(
                "INPUT.CONFIG_VALUE",
                format!(
                    "systematic_error_fraction must be finite and >= 0, got {}",
                    self.systematic_error_fraction
                ),
            ));
        }
        if !self.line_filter.signal_floor.is_finite() {
            return Err(DemError::input_validation(
                "INPUT.CONFIG_VALUE",
                format!(
                    "signal_floor must be finite, got {}",
                    self.line_filter.signal_floor
                ),
            ));
        }
        let solver = &self.solver;
        if !(solver.regularization_tweak.is_finite() && solver.regularization_tweak > 0.0)
            || !(solver.growth_factor.is_finite() && solver.growth_factor > 1.0)
        {
            return Err(DemError::input_validation(
                "INPUT.CONFIG_VALUE",
                format!(
                    "solver needs regularization_tweak > 0 and growth_factor > 1, got {} and {}",
                    solver.regularization_tweak, solver.growth_factor
                ),
            ));
        }
        self.grids()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grids {
    pub native: TemperatureGrid,
    pub working: TemperatureGrid,
    pub embedding: Range<usize>,
}

/// Everything a worker needs besides the observation itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub output_dir: PathBuf,
    pub run_name: String,
    pub config: PipelineConfig,
    pub grids: Grids,
}

impl RunContext {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        run_name: impl Into<String>,
        config: PipelineConfig,
    ) -> DemResult<Self> {
        let grids = config.validate()?;
        Ok(Self {
            output_dir: output_dir.into(),
            run_name: run_name.into(),
            config,
            grids,
        })
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join("dem_columns")
    }

    pub fn combined_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_dem_combined.json", self.run_name))
    }

    pub fn composition_path(&self, label: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_composition_{}.json", self.run_name, label))
    }

    pub fn composition_map_path(&self, label: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}_map.json", self.run_name, label))
    }
}

/// Fifteen sixteenths of the available parallelism, capped: very high
/// counts misbehave on shared hosts.
pub fn default_worker_count() -> usize {
    let available = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);
    (available * 15 / 16).clamp(1, MAX_DEFAULT_WORKERS)
}

fn grid_error(error: crate::numerics::GridError) -> DemError {
    DemError::input_validation("INPUT.GRID_SHAPE", error.to_string())
}
