use super::{Cube, DemError, DemResult, Frame, LineCatalog};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// Fitted line intensities, their errors and the density proxy for one
/// raster. Read-only for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub lines: LineCatalog,
    pub intensity: Cube,
    pub error: Cube,
    pub log_density: Frame,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ObservationFile {
    lines: Vec<String>,
    intensity: Vec<Vec<Vec<f64>>>,
    error: Vec<Vec<Vec<f64>>>,
    log_density: Vec<Vec<f64>>,
    #[serde(default)]
    meta: Map<String, Value>,
}

impl Observation {
    pub fn new(
        lines: LineCatalog,
        intensity: Cube,
        error: Cube,
        log_density: Frame,
    ) -> DemResult<Self> {
        let observation = Self {
            lines,
            intensity,
            error,
            log_density,
            meta: Map::new(),
        };
        observation.validate()?;
        Ok(observation)
    }

    pub fn rows(&self) -> usize {
        self.intensity.rows()
    }

    pub fn columns(&self) -> usize {
        self.intensity.columns()
    }

    fn validate(&self) -> DemResult<()> {
        if self.intensity.depth() != self.lines.len() {
            return Err(DemError::input_validation(
                "INPUT.OBSERVATION_SHAPE",
                format!(
                    "intensity cube has {} lines but the catalog lists {}",
                    self.intensity.depth(),
                    self.lines.len()
                ),
            ));
        }

        let intensity_shape = [
            self.intensity.rows(),
            self.intensity.columns(),
            self.intensity.depth(),
        ];
        let error_shape = [self.error.rows(), self.error.columns(), self.error.depth()];
        if intensity_shape != error_shape {
            return Err(DemError::input_validation(
                "INPUT.OBSERVATION_SHAPE",
                format!(
                    "error cube shape {:?} differs from intensity cube shape {:?}",
                    error_shape, intensity_shape
                ),
            ));
        }

        if self.log_density.rows() != self.rows() || self.log_density.columns() != self.columns() {
            return Err(DemError::input_validation(
                "INPUT.OBSERVATION_SHAPE",
                format!(
                    "density map is {}x{} but the raster is {}x{}",
                    self.log_density.rows(),
                    self.log_density.columns(),
                    self.rows(),
                    self.columns()
                ),
            ));
        }

        Ok(())
    }
}

pub fn load_observation(path: impl AsRef<Path>) -> DemResult<Observation> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| {
        DemError::io_system(
            "IO.OBSERVATION_READ",
            format!("failed to read observation '{}': {}", path.display(), source),
        )
    })?;
    let file: ObservationFile = serde_json::from_str(&source).map_err(|source| {
        DemError::input_validation(
            "INPUT.OBSERVATION_PARSE",
            format!("failed to parse observation '{}': {}", path.display(), source),
        )
    })?;

    let depth = file.lines.len();
    let intensity = flatten_cube("intensity", &file.intensity, depth)?;
    let error = flatten_cube("error", &file.error, depth)?;
    let log_density = flatten_frame("log_density", &file.log_density)?;

    let mut observation = Observation::new(LineCatalog::new(file.lines), intensity, error, log_density)?;
    observation.meta = file.meta;
    Ok(observation)
}

fn flatten_cube(field: &str, nested: &[Vec<Vec<f64>>], depth: usize) -> DemResult<Cube> {
    let rows = nested.len();
    let columns = nested.first().map_or(0, Vec::len);
    let mut values = Vec::with_capacity(rows * columns * depth);

    for (row_index, row) in nested.iter().enumerate() {
        if row.len() != columns {
            return Err(ragged(field, row_index, columns, row.len()));
        }
        for pixel in row {
            if pixel.len() != depth {
                return Err(DemError::input_validation(
                    "INPUT.OBSERVATION_SHAPE",
                    format!(
                        "{} row {} has a pixel with {} lines, expected {}",
                        field,
                        row_index,
                        pixel.len(),
                        depth
                    ),
                ));
            }
            values.extend_from_slice(pixel);
        }
    }

    Cube::from_values([rows, columns, depth], values)
}

fn flatten_frame(field: &str, nested: &[Vec<f64>]) -> DemResult<Frame> {
    let rows = nested.len();
    let columns = nested.first().map_or(0, Vec::len);
    let mut values = Vec::with_capacity(rows * columns);

    for (row_index, row) in nested.iter().enumerate() {
        if row.len() != columns {
            return Err(ragged(field, row_index, columns, row.len()));
        }
        values.extend_from_slice(row);
    }

    Frame::from_values([rows, columns], values)
}

fn ragged(field: &str, row: usize, expected: usize, actual: usize) -> DemError {
    DemError::input_validation(
        "INPUT.OBSERVATION_SHAPE",
        format!("{field} row {row} has {actual} columns, expected {expected}"),
    )
}

#[cfg(test)]
mod tests {
    use super::load_observation;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn observation_file_is_flattened_row_major() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("raster.json");
        fs::write(
            &path,
            r#"{
              "lines": ["fe_12_195.12", "si_10_258.37"],
              "intensity": [[[10.0, 1.0], [20.0, 2.0]]],
              "error": [[[0.5, 0.1], [0.5, 0.1]]],
              "log_density": [[9.0, 9.5]],
              "meta": { "bunit": "erg", "telescop": "Hinode" }
            }"#,
        )
        .expect("observation should be written");

        let observation = load_observation(&path).expect("observation should load");
        assert_eq!(observation.rows(), 1);
        assert_eq!(observation.columns(), 2);
        assert_eq!(observation.intensity.pixel(0, 1), &[20.0, 2.0]);
        assert_eq!(observation.log_density.get(0, 1), 9.5);
        assert_eq!(observation.meta["telescop"], "Hinode");
    }

    #[test]
    fn ragged_intensity_is_rejected() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("raster.json");
        fs::write(
            &path,
            r#"{
              "lines": ["fe_12_195.12"],
              "intensity": [[[10.0], [20.0, 1.0]]],
              "error": [[[0.5], [0.5]]],
              "log_density": [[9.0, 9.5]]
            }"#,
        )
        .expect("observation should be written");

        let error = load_observation(&path).expect_err("ragged cube must fail");
        assert_eq!(error.code(), "INPUT.OBSERVATION_SHAPE");
    }
}
