//! Line emissivities keyed by density.
//!
//! The atomic data itself comes from outside the crate; the pipeline only
//! needs an [`EmissivityProvider`]. [`TabulatedEmissivity`] serves
//! precomputed tables from a JSON file and picks the table whose density is
//! nearest the pixel's.

use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EmissivityError {
    #[error("failed to read emissivity tables '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse emissivity tables '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("emissivity source holds no tables")]
    NoTables,
    #[error("log density must be finite, got {value}")]
    InvalidDensity { value: f64 },
    #[error("line '{line}' has {actual} emissivity samples, expected {expected}")]
    SampleCount {
        line: String,
        expected: usize,
        actual: usize,
    },
    #[error("no emissivity for line '{line}'")]
    MissingLine { line: String },
}

/// Per-line emission rates sampled on the native log-temperature bin centres.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmissivityTable {
    pub log_density: f64,
    pub log_temperatures: Vec<f64>,
    pub lines: BTreeMap<String, Vec<f64>>,
}

impl EmissivityTable {
    pub fn rates(&self, line: &str) -> Result<&[f64], EmissivityError> {
        self.lines
            .get(line)
            .map(Vec::as_slice)
            .ok_or_else(|| EmissivityError::MissingLine {
                line: line.to_string(),
            })
    }

    /// Rows for `lines`, in the order given.
    pub fn select<'a, I>(&self, lines: I) -> Result<Vec<&[f64]>, EmissivityError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        lines.into_iter().map(|line| self.rates(line)).collect()
    }

    fn validate(&self) -> Result<(), EmissivityError> {
        let expected = self.log_temperatures.len();
        for (line, rates) in &self.lines {
            if rates.len() != expected {
                return Err(EmissivityError::SampleCount {
                    line: line.clone(),
                    expected,
                    actual: rates.len(),
                });
            }
        }
        Ok(())
    }
}

pub trait EmissivityProvider: Sync {
    fn emissivity(&self, log_density: f64) -> Result<Cow<'_, EmissivityTable>, EmissivityError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedEmissivity {
    tables: Vec<EmissivityTable>,
}

#[derive(Debug, Deserialize)]
struct EmissivityFile {
    tables: Vec<EmissivityTable>,
}

impl TabulatedEmissivity {
    pub fn new(mut tables: Vec<EmissivityTable>) -> Result<Self, EmissivityError> {
        if tables.is_empty() {
            return Err(EmissivityError::NoTables);
        }
        for table in &tables {
            table.validate()?;
        }
        tables.sort_by(|lhs, rhs| lhs.log_density.total_cmp(&rhs.log_density));
        Ok(Self { tables })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EmissivityError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| EmissivityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: EmissivityFile =
            serde_json::from_str(&source).map_err(|source| EmissivityError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(file.tables)
    }

    pub fn tables(&self) -> &[EmissivityTable] {
        &self.tables
    }
}

impl EmissivityProvider for TabulatedEmissivity {
    fn emissivity(&self, log_density: f64) -> Result<Cow<'_, EmissivityTable>, EmissivityError> {
        if !log_density.is_finite() {
            return Err(EmissivityError::InvalidDensity { value: log_density });
        }

        let nearest = self
            .tables
            .iter()
            .min_by(|lhs, rhs| {
                (lhs.log_density - log_density)
                    .abs()
                    .total_cmp(&(rhs.log_density - log_density).abs())
            })
            .ok_or(EmissivityError::NoTables)?;
        Ok(Cow::Borrowed(nearest))
    }
}

#[cfg(test)]
mod tests {
    use super::{EmissivityError, EmissivityProvider, EmissivityTable, TabulatedEmissivity};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn table(log_density: f64, scale: f64) -> EmissivityTable {
        let mut lines = BTreeMap::new();
        lines.insert("fe_12_195.12".to_string(), vec![scale, 2.0 * scale]);
        lines.insert("si_10_258.37".to_string(), vec![3.0 * scale, 4.0 * scale]);
        EmissivityTable {
            log_density,
            log_temperatures: vec![6.0, 6.1],
            lines,
        }
    }

    #[test]
    fn nearest_density_table_is_selected() {
        let provider =
            TabulatedEmissivity::new(vec![table(10.0, 10.0), table(8.0, 1.0), table(9.0, 5.0)])
                .expect("tables");

        let chosen = provider.emissivity(9.4).expect("table");
        assert_eq!(chosen.log_density, 9.0);
        let chosen = provider.emissivity(7.0).expect("table");
        assert_eq!(chosen.log_density, 8.0);
        assert!(matches!(
            provider.emissivity(f64::NAN),
            Err(EmissivityError::InvalidDensity { .. })
        ));
    }

    #[test]
    fn select_follows_requested_order_and_flags_missing_lines() {
        let table = table(9.0, 1.0);
        let rows = table
            .select(["si_10_258.37", "fe_12_195.12"])
            .expect("selection");
        assert_eq!(rows, vec![&[3.0, 4.0][..], &[1.0, 2.0][..]]);

        let error = table
            .select(["fe_12_195.12", "s_10_264.23"])
            .expect_err("missing line");
        assert!(matches!(error, EmissivityError::MissingLine { line } if line == "s_10_264.23"));
    }

    #[test]
    fn tables_load_from_json_and_reject_ragged_rows() {
        let temp = TempDir::new().expect("tempdir should be created");
        let good = temp.path().join("good.json");
        fs::write(
            &good,
            r#"{ "tables": [ { "log_density": 9.0, "log_temperatures": [6.0, 6.1],
                 "lines": { "fe_12_195.12": [1.0, 2.0] } } ] }"#,
        )
        .expect("write");
        let provider = TabulatedEmissivity::load(&good).expect("load");
        assert_eq!(provider.tables().len(), 1);

        let ragged = temp.path().join("ragged.json");
        fs::write(
            &ragged,
            r#"{ "tables": [ { "log_density": 9.0, "log_temperatures": [6.0, 6.1],
                 "lines": { "fe_12_195.12": [1.0] } } ] }"#,
        )
        .expect("write");
        assert!(matches!(
            TabulatedEmissivity::load(&ragged),
            Err(EmissivityError::SampleCount { expected: 2, actual: 1, .. })
        ));
    }
}
