#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpolationError {
    #[error("interpolation requires at least 2 grid points, got {actual}")]
    InsufficientPoints { actual: usize },
    #[error("interpolation length mismatch: grid={grid}, values={values}")]
    LengthMismatch { grid: usize, values: usize },
    #[error("interpolation grid must be strictly increasing at index {index}")]
    NonIncreasingGrid { index: usize },
    #[error("interpolation query must be finite, got {value}")]
    NonFiniteQuery { value: f64 },
}

/// Linear interpolation with boundary clamping: queries outside the grid
/// return the first/last value.
pub fn interpolate_linear(
    query: f64,
    grid: &[f64],
    values: &[f64],
) -> Result<f64, InterpolationError> {
    validate_grid(grid, values)?;
    if !query.is_finite() {
        return Err(InterpolationError::NonFiniteQuery { value: query });
    }

    let last = grid.len() - 1;
    if query <= grid[0] {
        return Ok(values[0]);
    }
    if query >= grid[last] {
        return Ok(values[last]);
    }

    match grid.binary_search_by(|probe| probe.total_cmp(&query)) {
        Ok(index) => Ok(values[index]),
        Err(upper) => {
            let lower = upper - 1;
            let fraction = (query - grid[lower]) / (grid[upper] - grid[lower]);
            Ok(values[lower] + (values[upper] - values[lower]) * fraction)
        }
    }
}

fn validate_grid(grid: &[f64], values: &[f64]) -> Result<(), InterpolationError> {
    if grid.len() < 2 {
        return Err(InterpolationError::InsufficientPoints { actual: grid.len() });
    }
    if grid.len() != values.len() {
        return Err(InterpolationError::LengthMismatch {
            grid: grid.len(),
            values: values.len(),
        });
    }
    if let Some(index) = grid.windows(2).position(|pair| pair[1] <= pair[0]) {
        return Err(InterpolationError::NonIncreasingGrid { index: index + 1 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{InterpolationError, interpolate_linear};

    #[test]
    fn interpolation_clamps_and_interpolates() {
        let grid = [0.0, 1.0, 3.0];
        let values = [1.0, 3.0, 7.0];

        assert_eq!(interpolate_linear(-0.5, &grid, &values), Ok(1.0));
        assert_eq!(interpolate_linear(4.0, &grid, &values), Ok(7.0));
        assert_eq!(interpolate_linear(1.0, &grid, &values), Ok(3.0));
        let interior = interpolate_linear(2.0, &grid, &values).expect("interior");
        assert!((interior - 5.0).abs() < 1.0e-15);
    }

    #[test]
    fn non_increasing_grid_is_rejected() {
        assert_eq!(
            interpolate_linear(0.5, &[0.0, 1.0, 1.0], &[0.0, 1.0, 2.0]),
            Err(InterpolationError::NonIncreasingGrid { index: 2 })
        );
    }
}
