//! Log-temperature grids and the native/working index mapping.
//!
//! A grid is described by its first and last bin centre and a fixed log
//! step; edges sit half a step either side of each centre. The native grid
//! defines the index space of every stored DEM, the working grid is the
//! narrower window handed to the inversion operator.

use serde::{Deserialize, Serialize};
use std::ops::Range;

const EDGE_TOLERANCE_FRACTION: f64 = 1.0e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("grid step must be finite and > 0, got {step}")]
    InvalidStep { step: f64 },
    #[error("grid bounds must be finite with min <= max, got [{min_log_t}, {max_log_t}]")]
    InvalidBounds { min_log_t: f64, max_log_t: f64 },
    #[error(
        "working grid [{working_min}, {working_max}] falls outside native grid [{native_min}, {native_max}]"
    )]
    OutsideNative {
        working_min: f64,
        working_max: f64,
        native_min: f64,
        native_max: f64,
    },
    #[error("working grid has {working_bins} bins but maps onto native slice {start}..{end}")]
    ShapeMismatch {
        working_bins: usize,
        start: usize,
        end: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub min_log_t: f64,
    pub max_log_t: f64,
    pub step: f64,
}

impl GridSpec {
    pub const NATIVE: Self = Self {
        min_log_t: 4.0,
        max_log_t: 8.01,
        step: 0.04,
    };

    pub const WORKING: Self = Self {
        min_log_t: 5.3,
        max_log_t: 7.3,
        step: 0.04,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureGrid {
    step: f64,
    log_edges: Vec<f64>,
}

impl TemperatureGrid {
    pub fn from_spec(spec: GridSpec) -> Result<Self, GridError> {
        if !spec.step.is_finite() || spec.step <= 0.0 {
            return Err(GridError::InvalidStep { step: spec.step });
        }
        if !spec.min_log_t.is_finite()
            || !spec.max_log_t.is_finite()
            || spec.min_log_t > spec.max_log_t
        {
            return Err(GridError::InvalidBounds {
                min_log_t: spec.min_log_t,
                max_log_t: spec.max_log_t,
            });
        }

        let tolerance = spec.step * EDGE_TOLERANCE_FRACTION;
        let bins = ((spec.max_log_t - spec.min_log_t + tolerance) / spec.step).floor() as usize + 1;
        let first_edge = spec.min_log_t - spec.step / 2.0;
        let log_edges = (0..=bins)
            .map(|index| first_edge + index as f64 * spec.step)
            .collect();

        Ok(Self {
            step: spec.step,
            log_edges,
        })
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn bins(&self) -> usize {
        self.log_edges.len() - 1
    }

    pub fn log_edges(&self) -> &[f64] {
        &self.log_edges
    }

    pub fn edges(&self) -> Vec<f64> {
        self.log_edges.iter().map(|log_t| 10f64.powf(*log_t)).collect()
    }

    pub fn log_centres(&self) -> Vec<f64> {
        self.log_edges
            .windows(2)
            .map(|pair| 0.5 * (pair[0] + pair[1]))
            .collect()
    }

    fn first_edge(&self) -> f64 {
        self.log_edges[0]
    }

    fn last_edge(&self) -> f64 {
        self.log_edges[self.log_edges.len() - 1]
    }
}

/// Native edge indices `[start, end)` bracketing the working grid: `start` is
/// the first native edge at or above the working grid's first edge, `end` is
/// one past the last native edge at or below its last edge.
///
/// `end - start` is not guaranteed to equal the working bin count; see
/// [`checked_embedding`].
pub fn native_slice(
    native: &TemperatureGrid,
    working: &TemperatureGrid,
) -> Result<Range<usize>, GridError> {
    let tolerance = native.step() * EDGE_TOLERANCE_FRACTION;
    let working_min = working.first_edge();
    let working_max = working.last_edge();

    if working_min < native.first_edge() - tolerance || working_max > native.last_edge() + tolerance
    {
        return Err(GridError::OutsideNative {
            working_min,
            working_max,
            native_min: native.first_edge(),
            native_max: native.last_edge(),
        });
    }

    let edges = native.log_edges();
    let start = edges.partition_point(|edge| *edge < working_min - tolerance);
    let end = edges.partition_point(|edge| *edge <= working_max + tolerance);
    Ok(start..end)
}

/// Like [`native_slice`] but rejects a slice whose width differs from the
/// working bin count, or that would overrun the native DEM length.
pub fn checked_embedding(
    native: &TemperatureGrid,
    working: &TemperatureGrid,
) -> Result<Range<usize>, GridError> {
    let slice = native_slice(native, working)?;
    if slice.len() != working.bins() || slice.end > native.bins() {
        return Err(GridError::ShapeMismatch {
            working_bins: working.bins(),
            start: slice.start,
            end: slice.end,
        });
    }
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::{GridError, GridSpec, TemperatureGrid, checked_embedding, native_slice};

    fn grid(min_log_t: f64, max_log_t: f64, step: f64) -> TemperatureGrid {
        TemperatureGrid::from_spec(GridSpec {
            min_log_t,
            max_log_t,
            step,
        })
        .expect("grid should build")
    }

    #[test]
    fn default_native_grid_has_101_bins_centred_on_log_t() {
        let native = TemperatureGrid::from_spec(GridSpec::NATIVE).expect("native grid");
        let centres = native.log_centres();

        assert_eq!(native.bins(), 101);
        assert_eq!(native.log_edges().len(), 102);
        assert!((centres[0] - 4.0).abs() < 1.0e-12);
        assert!((centres[100] - 8.0).abs() < 1.0e-9);
    }

    #[test]
    fn default_working_grid_embeds_cleanly() {
        let native = TemperatureGrid::from_spec(GridSpec::NATIVE).expect("native grid");
        let working = TemperatureGrid::from_spec(GridSpec::WORKING).expect("working grid");

        assert_eq!(working.bins(), 51);
        let slice = checked_embedding(&native, &working).expect("embedding");
        assert_eq!(slice, 33..84);
    }

    #[test]
    fn aligned_working_grid_overruns_by_one_edge() {
        let native = grid(0.0, 1.0, 0.1);
        let working = grid(0.3, 0.6, 0.1);

        let slice = native_slice(&native, &working).expect("slice");
        assert_eq!(slice, 3..8);
        assert_eq!(slice.len(), working.bins() + 1);
        assert!(matches!(
            checked_embedding(&native, &working),
            Err(GridError::ShapeMismatch {
                working_bins: 4,
                start: 3,
                end: 8
            })
        ));
    }

    #[test]
    fn half_step_offset_working_grid_embeds_with_matching_width() {
        let native = grid(0.0, 1.0, 0.1);
        let working = grid(0.35, 0.65, 0.1);

        let slice = checked_embedding(&native, &working).expect("embedding");
        assert_eq!(slice, 4..8);
        assert_eq!(slice.len(), working.bins());
    }

    #[test]
    fn working_grid_outside_native_is_rejected() {
        let native = grid(0.0, 1.0, 0.1);
        let working = grid(0.9, 1.5, 0.1);

        assert!(matches!(
            native_slice(&native, &working),
            Err(GridError::OutsideNative { .. })
        ));
    }

    #[test]
    fn invalid_step_is_rejected() {
        let error = TemperatureGrid::from_spec(GridSpec {
            min_log_t: 5.0,
            max_log_t: 6.0,
            step: 0.0,
        })
        .expect_err("zero step");
        assert_eq!(error, GridError::InvalidStep { step: 0.0 });
    }
}
