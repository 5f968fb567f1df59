pub mod forward;
pub mod grid;
pub mod interpolation;
pub mod inversion;
pub mod linalg;

pub use forward::{ForwardModelError, IntegrationAxis, chi_square, predict_intensity};
pub use grid::{GridError, GridSpec, TemperatureGrid, checked_embedding, native_slice};
pub use interpolation::{InterpolationError, interpolate_linear};
pub use inversion::{
    InversionError, InversionOperator, InversionProblem, InversionSolution, RegularizedInversion,
    SolverSettings,
};
pub use linalg::{DenseMatrix, LuDecomposition, LuError, lu_factorize, lu_solve};

fn kahan_add(sum: &mut f64, correction: &mut f64, value: f64) {
    let corrected = value - *correction;
    let next = *sum + corrected;
    *correction = (next - *sum) - corrected;
    *sum = next;
}

pub fn stable_sum_iter(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut correction = 0.0;

    for value in values {
        kahan_add(&mut sum, &mut correction, value);
    }

    sum
}

#[cfg(test)]
mod tests {
    use super::stable_sum_iter;

    #[test]
    fn compensated_sum_keeps_small_terms_between_large_ones() {
        assert_eq!(stable_sum_iter([1.0e16, 1.0, 1.0, -1.0e16]), 2.0);
        assert_eq!(stable_sum_iter(std::iter::empty()), 0.0);
    }
}
