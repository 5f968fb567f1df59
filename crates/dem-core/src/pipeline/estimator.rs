use crate::config::RunContext;
use crate::domain::{ColumnResult, DemError, DemResult, Observation, PixelDem};
use crate::emissivity::{EmissivityError, EmissivityProvider, EmissivityTable};
use crate::numerics::{
    DenseMatrix, ForwardModelError, InversionOperator, InversionProblem, chi_square,
    predict_intensity,
};
use tracing::{debug, warn};

/// Lines of one pixel that passed the filter, with inflated errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectedLines {
    pub names: Vec<String>,
    pub intensities: Vec<f64>,
    pub errors: Vec<f64>,
}

impl SelectedLines {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Runs one inversion per pixel and places the result on the native grid.
pub struct PixelEstimator<'a> {
    context: &'a RunContext,
    emissivity: &'a dyn EmissivityProvider,
    operator: &'a dyn InversionOperator,
    target_temperatures: Vec<f64>,
    native_log_temperatures: Vec<f64>,
    working_log_temperatures: Vec<f64>,
}

impl<'a> PixelEstimator<'a> {
    pub fn new(
        context: &'a RunContext,
        emissivity: &'a dyn EmissivityProvider,
        operator: &'a dyn InversionOperator,
    ) -> Self {
        let grids = &context.grids;
        Self {
            context,
            emissivity,
            operator,
            target_temperatures: grids.working.edges(),
            native_log_temperatures: grids.native.log_centres(),
            working_log_temperatures: grids.working.log_centres(),
        }
    }

    pub fn native_bins(&self) -> usize {
        self.context.grids.native.bins()
    }

    /// Filtered lines for `(row, column)`. Lines whose measurement error is
    /// not a finite positive number are left out.
    pub fn select_lines(&self, observation: &Observation, row: usize, column: usize) -> SelectedLines {
        let config = &self.context.config;
        let mut selected = SelectedLines::default();
        for (index, line) in observation.lines.iter().enumerate() {
            let intensity = observation.intensity.get(row, column, index);
            let error = observation.error.get(row, column, index);
            if !config.line_filter.accepts(line, intensity) || !error.is_finite() || error <= 0.0 {
                continue;
            }
            selected.names.push(line.to_string());
            selected.intensities.push(intensity);
            selected
                .errors
                .push(error + config.systematic_error_fraction * intensity.abs());
        }
        selected
    }

    pub fn estimate(&self, observation: &Observation, row: usize, column: usize) -> DemResult<PixelDem> {
        let native_bins = self.native_bins();
        let selected = self.select_lines(observation, row, column);
        if selected.is_empty() {
            return Ok(PixelDem::no_fit(native_bins, Vec::new()));
        }

        let log_density = observation.log_density.get(row, column);
        let table = match self.emissivity.emissivity(log_density) {
            Ok(table) => table,
            Err(EmissivityError::InvalidDensity { value }) => {
                warn!(row, column, log_density = value, "no usable density; storing no-fit sentinel");
                return Ok(PixelDem::no_fit(native_bins, selected.names));
            }
            Err(error) => return Err(emissivity_failure(error)),
        };
        check_table_grid(&table, native_bins)?;

        let rates = table
            .select(selected.names.iter().map(String::as_str))
            .map_err(emissivity_failure)?;
        let mut response = DenseMatrix::zeros(table.log_temperatures.len(), rates.len());
        for (line, curve) in rates.iter().enumerate() {
            for (temperature, rate) in curve.iter().enumerate() {
                response[(temperature, line)] = *rate;
            }
        }

        let problem = InversionProblem {
            intensities: &selected.intensities,
            errors: &selected.errors,
            response: &response,
            response_log_temperatures: &table.log_temperatures,
            target_temperatures: &self.target_temperatures,
            settings: &self.context.config.solver,
        };
        let solution = match self.operator.invert(&problem) {
            Ok(solution) => solution,
            Err(error) => {
                warn!(row, column, %error, "inversion failed; storing no-fit sentinel");
                return Ok(PixelDem::no_fit(native_bins, selected.names));
            }
        };

        let embedding = self.context.grids.embedding.clone();
        if solution.dem.len() != embedding.len() {
            return Err(DemError::input_validation(
                "INPUT.GRID_SHAPE",
                format!(
                    "inversion returned {} working bins but the native slice {}..{} holds {}",
                    solution.dem.len(),
                    embedding.start,
                    embedding.end,
                    embedding.len()
                ),
            ));
        }
        if solution.dem.iter().any(|value| !value.is_finite()) {
            warn!(row, column, "inversion returned a non-finite DEM; storing no-fit sentinel");
            return Ok(PixelDem::no_fit(native_bins, selected.names));
        }
        let mut dem = vec![0.0; native_bins];
        dem[embedding].copy_from_slice(&solution.dem);

        let axis = self
            .context
            .config
            .integration_axis
            .values(&table.log_temperatures);
        let predicted = rates
            .iter()
            .map(|curve| predict_intensity(curve, &axis, &dem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(forward_failure)?;
        let chi_square =
            chi_square(&selected.intensities, &selected.errors, &predicted).map_err(forward_failure)?;

        debug!(
            row,
            column,
            chi_square,
            operator_chi_square = solution.chi_square,
            lines = selected.names.len(),
            "pixel fitted"
        );

        Ok(PixelDem {
            dem,
            chi_square,
            lines_used: selected.names,
        })
    }

    /// Every row of `column`, in row order.
    pub fn estimate_column(&self, observation: &Observation, column: usize) -> DemResult<ColumnResult> {
        let pixels = (0..observation.rows())
            .map(|row| self.estimate(observation, row, column))
            .collect::<DemResult<Vec<_>>>()?;

        Ok(ColumnResult::from_pixels(
            column,
            pixels,
            self.native_log_temperatures.clone(),
            self.working_log_temperatures.clone(),
        ))
    }
}

pub(crate) fn check_table_grid(table: &EmissivityTable, native_bins: usize) -> DemResult<()> {
    if table.log_temperatures.len() != native_bins {
        return Err(DemError::input_validation(
            "INPUT.EMISSIVITY_GRID",
            format!(
                "emissivity table at log density {} has {} temperatures, native grid has {} bins",
                table.log_density,
                table.log_temperatures.len(),
                native_bins
            ),
        ));
    }
    Ok(())
}

pub(crate) fn emissivity_failure(error: EmissivityError) -> DemError {
    match error {
        EmissivityError::MissingLine { .. } => {
            DemError::input_validation("INPUT.EMISSIVITY_LINE", error.to_string())
        }
        EmissivityError::Read { .. } => DemError::io_system("IO.EMISSIVITY_READ", error.to_string()),
        _ => DemError::input_validation("INPUT.EMISSIVITY", error.to_string()),
    }
}

pub(crate) fn forward_failure(error: ForwardModelError) -> DemError {
    DemError::internal("SYS.FORWARD_MODEL", error.to_string())
}
