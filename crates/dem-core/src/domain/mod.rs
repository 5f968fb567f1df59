pub mod errors;
pub mod observation;

pub use errors::{DemError, DemErrorCategory, DemResult};
pub use observation::{Observation, load_observation};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Ordered line identifiers; one-to-one with the line axis of the intensity
/// cubes and with the rows of an emissivity table after selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineCatalog {
    names: Vec<String>,
}

impl LineCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn position(&self, line: &str) -> Option<usize> {
        self.names.iter().position(|name| name == line)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Row-major `[row, column, depth]` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCube")]
pub struct Cube {
    shape: [usize; 3],
    #[serde(with = "encoded_f64s")]
    values: Vec<f64>,
}

impl Cube {
    pub fn zeros(rows: usize, columns: usize, depth: usize) -> Self {
        Self {
            shape: [rows, columns, depth],
            values: vec![0.0; rows * columns * depth],
        }
    }

    pub fn from_values(shape: [usize; 3], values: Vec<f64>) -> DemResult<Self> {
        let expected = shape.iter().try_fold(1_usize, |total, axis| total.checked_mul(*axis));
        if expected != Some(values.len()) {
            return Err(DemError::input_validation(
                "INPUT.CUBE_SHAPE",
                format!(
                    "cube of shape {:?} does not hold {} values",
                    shape,
                    values.len()
                ),
            ));
        }
        Ok(Self { shape, values })
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn columns(&self) -> usize {
        self.shape[1]
    }

    pub fn depth(&self) -> usize {
        self.shape[2]
    }

    pub fn get(&self, row: usize, column: usize, index: usize) -> f64 {
        self.values[self.offset(row, column) + index]
    }

    pub fn pixel(&self, row: usize, column: usize) -> &[f64] {
        let start = self.offset(row, column);
        &self.values[start..start + self.depth()]
    }

    pub fn pixel_mut(&mut self, row: usize, column: usize) -> &mut [f64] {
        let start = self.offset(row, column);
        let depth = self.depth();
        &mut self.values[start..start + depth]
    }

    fn offset(&self, row: usize, column: usize) -> usize {
        (row * self.shape[1] + column) * self.shape[2]
    }
}

/// Row-major `[row, column]` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFrame")]
pub struct Frame {
    shape: [usize; 2],
    #[serde(with = "encoded_f64s")]
    values: Vec<f64>,
}

impl Frame {
    pub fn filled(rows: usize, columns: usize, value: f64) -> Self {
        Self {
            shape: [rows, columns],
            values: vec![value; rows * columns],
        }
    }

    pub fn zeros(rows: usize, columns: usize) -> Self {
        Self::filled(rows, columns, 0.0)
    }

    pub fn from_values(shape: [usize; 2], values: Vec<f64>) -> DemResult<Self> {
        if shape[0].checked_mul(shape[1]) != Some(values.len()) {
            return Err(DemError::input_validation(
                "INPUT.FRAME_SHAPE",
                format!(
                    "frame of shape {:?} does not hold {} values",
                    shape,
                    values.len()
                ),
            ));
        }
        Ok(Self { shape, values })
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn columns(&self) -> usize {
        self.shape[1]
    }

    pub fn get(&self, row: usize, column: usize) -> f64 {
        self.values[row * self.shape[1] + column]
    }

    pub fn set(&mut self, row: usize, column: usize, value: f64) {
        let columns = self.shape[1];
        self.values[row * columns + column] = value;
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

#[derive(Deserialize)]
struct RawCube {
    shape: [usize; 3],
    #[serde(with = "encoded_f64s")]
    values: Vec<f64>,
}

impl TryFrom<RawCube> for Cube {
    type Error = DemError;

    fn try_from(raw: RawCube) -> DemResult<Self> {
        Self::from_values(raw.shape, raw.values)
    }
}

#[derive(Deserialize)]
struct RawFrame {
    shape: [usize; 2],
    #[serde(with = "encoded_f64s")]
    values: Vec<f64>,
}

impl TryFrom<RawFrame> for Frame {
    type Error = DemError;

    fn try_from(raw: RawFrame) -> DemResult<Self> {
        Self::from_values(raw.shape, raw.values)
    }
}

/// One pixel's inversion outcome on the native grid.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDem {
    pub dem: Vec<f64>,
    pub chi_square: f64,
    pub lines_used: Vec<String>,
}

impl PixelDem {
    /// Sentinel for a pixel where no fit was attempted or the fit failed.
    pub fn no_fit(native_bins: usize, lines_used: Vec<String>) -> Self {
        Self {
            dem: vec![0.0; native_bins],
            chi_square: f64::INFINITY,
            lines_used,
        }
    }

    pub fn is_no_fit(&self) -> bool {
        self.chi_square == f64::INFINITY && self.dem.iter().all(|value| *value == 0.0)
    }
}

/// Every row of one column, in row order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnResult {
    pub column: usize,
    pub dem: Vec<Vec<f64>>,
    #[serde(with = "encoded_f64s")]
    pub chi_square: Vec<f64>,
    pub lines_used: Vec<Vec<String>>,
    /// Native bin centres, the axis of every DEM row.
    pub log_temperatures: Vec<f64>,
    pub working_log_temperatures: Vec<f64>,
}

impl ColumnResult {
    pub fn from_pixels(
        column: usize,
        pixels: Vec<PixelDem>,
        log_temperatures: Vec<f64>,
        working_log_temperatures: Vec<f64>,
    ) -> Self {
        let mut dem = Vec::with_capacity(pixels.len());
        let mut chi_square = Vec::with_capacity(pixels.len());
        let mut lines_used = Vec::with_capacity(pixels.len());
        for pixel in pixels {
            dem.push(pixel.dem);
            chi_square.push(pixel.chi_square);
            lines_used.push(pixel.lines_used);
        }

        Self {
            column,
            dem,
            chi_square,
            lines_used,
            log_temperatures,
            working_log_temperatures,
        }
    }

    pub fn rows(&self) -> usize {
        self.dem.len()
    }

    /// Structural check used before a stored column is trusted.
    pub fn is_consistent_with(&self, column: usize, rows: usize, bins: usize) -> bool {
        self.column == column
            && self.dem.len() == rows
            && self.chi_square.len() == rows
            && self.lines_used.len() == rows
            && self.dem.iter().all(|row| row.len() == bins)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    pub dem: Cube,
    pub chi_square: Frame,
    pub lines_used: Frame,
    pub log_temperatures: Vec<f64>,
    pub working_log_temperatures: Vec<f64>,
}

impl CombinedResult {
    pub fn rows(&self) -> usize {
        self.dem.rows()
    }

    pub fn columns(&self) -> usize {
        self.dem.columns()
    }

    /// Maps and temperature axes agree with the DEM cube.
    pub fn is_consistent(&self) -> bool {
        let frame_matches =
            |frame: &Frame| frame.rows() == self.rows() && frame.columns() == self.columns();
        frame_matches(&self.chi_square)
            && frame_matches(&self.lines_used)
            && (self.columns() == 0 || self.log_temperatures.len() == self.dem.depth())
    }
}

/// Low/high first-ionization-potential line pair compared through the DEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioDefinition {
    pub label: String,
    pub low_line: String,
    pub high_line: String,
    pub name: String,
}

impl RatioDefinition {
    pub fn new(
        label: impl Into<String>,
        low_line: impl Into<String>,
        high_line: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            low_line: low_line.into(),
            high_line: high_line.into(),
            name: name.into(),
        }
    }

    pub fn default_set() -> Vec<Self> {
        vec![
            Self::new("sis", "si_10_258.37", "s_10_264.23", "SiX_SX"),
            Self::new("CaAr", "ca_14_193.87", "ar_14_194.40", "CaXIV_ArXIV"),
            Self::new("FeS", "fe_16_262.98", "s_13_256.69", "FeXVI_SXIII"),
        ]
    }
}

impl Display for RatioDefinition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.label, self.low_line, self.high_line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionResult {
    pub label: String,
    pub name: String,
    pub bias: Frame,
    pub chi_square: Frame,
    pub lines_used: Frame,
}

/// Non-finite floats are written as `"inf"`, `"-inf"` or `"NaN"` since JSON
/// numbers cannot carry them.
pub(crate) mod encoded_f64s {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Vec<Encoded> = values
            .iter()
            .map(|value| {
                if value.is_finite() {
                    Encoded::Number(*value)
                } else {
                    Encoded::Text(encode_non_finite(*value).to_string())
                }
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Vec::<Encoded>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|entry| match entry {
                Encoded::Number(value) => Ok(value),
                Encoded::Text(text) => text.parse::<f64>().map_err(|_| {
                    serde::de::Error::custom(format!("invalid non-finite float '{text}'"))
                }),
            })
            .collect()
    }

    fn encode_non_finite(value: f64) -> &'static str {
        if value.is_nan() {
            "NaN"
        } else if value > 0.0 {
            "inf"
        } else {
            "-inf"
        }
    }
}
