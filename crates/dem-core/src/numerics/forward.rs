use super::stable_sum_iter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ForwardModelError {
    #[error("forward model length mismatch: emissivity={emissivity}, axis={axis}, dem={dem}")]
    LengthMismatch {
        emissivity: usize,
        axis: usize,
        dem: usize,
    },
    #[error("chi-square length mismatch: observed={observed}, errors={errors}, predicted={predicted}")]
    ChiSquareLengthMismatch {
        observed: usize,
        errors: usize,
        predicted: usize,
    },
}

/// Variable the trapezoidal integral runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationAxis {
    LogTemperature,
    #[default]
    Temperature,
}

impl IntegrationAxis {
    pub fn values(self, log_temperatures: &[f64]) -> Vec<f64> {
        match self {
            Self::LogTemperature => log_temperatures.to_vec(),
            Self::Temperature => log_temperatures
                .iter()
                .map(|log_t| 10f64.powf(*log_t))
                .collect(),
        }
    }
}

/// Trapezoidal integral of `emissivity(T) * dem(T)` over `axis`.
///
/// Bins where the DEM is exactly zero contribute nothing, so an all-zero DEM
/// predicts exactly zero even against a non-finite emissivity.
pub fn predict_intensity(
    emissivity: &[f64],
    axis: &[f64],
    dem: &[f64],
) -> Result<f64, ForwardModelError> {
    if emissivity.len() != axis.len() || dem.len() != axis.len() {
        return Err(ForwardModelError::LengthMismatch {
            emissivity: emissivity.len(),
            axis: axis.len(),
            dem: dem.len(),
        });
    }

    let integrand = |index: usize| {
        if dem[index] == 0.0 {
            0.0
        } else {
            emissivity[index] * dem[index]
        }
    };

    Ok(stable_sum_iter((1..axis.len()).map(|index| {
        0.5 * (axis[index] - axis[index - 1]) * (integrand(index - 1) + integrand(index))
    })))
}

/// `sum(((predicted - observed) / error)^2)`.
pub fn chi_square(
    observed: &[f64],
    errors: &[f64],
    predicted: &[f64],
) -> Result<f64, ForwardModelError> {
    if observed.len() != errors.len() || observed.len() != predicted.len() {
        return Err(ForwardModelError::ChiSquareLengthMismatch {
            observed: observed.len(),
            errors: errors.len(),
            predicted: predicted.len(),
        });
    }

    Ok(stable_sum_iter(
        observed
            .iter()
            .zip(errors)
            .zip(predicted)
            .map(|((observed, error), predicted)| ((predicted - observed) / error).powi(2)),
    ))
}

#[cfg(test)]
mod tests {
    use super::{ForwardModelError, IntegrationAxis, chi_square, predict_intensity};

    #[test]
    fn zero_dem_predicts_exactly_zero() {
        let axis = [5.0, 5.1, 5.2, 5.3];
        let emissivities = [
            vec![1.0, 2.0, 3.0, 4.0],
            vec![1.0e30, -7.0, 0.0, 1.0e-30],
            vec![f64::INFINITY, f64::NAN, 1.0, 2.0],
        ];

        for emissivity in &emissivities {
            let intensity =
                predict_intensity(emissivity, &axis, &[0.0; 4]).expect("prediction");
            assert_eq!(intensity, 0.0);
        }
    }

    #[test]
    fn trapezoid_matches_hand_integral() {
        let axis = [0.0, 1.0, 3.0];
        let emissivity = [1.0, 1.0, 2.0];
        let dem = [2.0, 4.0, 1.0];

        // 0.5 * 1 * (2 + 4) + 0.5 * 2 * (4 + 2)
        let intensity = predict_intensity(&emissivity, &axis, &dem).expect("prediction");
        assert!((intensity - 9.0).abs() < 1.0e-12);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let error = predict_intensity(&[1.0, 2.0], &[0.0, 1.0, 2.0], &[1.0, 1.0, 1.0])
            .expect_err("mismatch");
        assert_eq!(
            error,
            ForwardModelError::LengthMismatch {
                emissivity: 2,
                axis: 3,
                dem: 3
            }
        );
    }

    #[test]
    fn chi_square_sums_normalized_residuals() {
        let value = chi_square(&[10.0, 20.0], &[2.0, 5.0], &[12.0, 10.0]).expect("chi-square");
        assert!((value - 5.0).abs() < 1.0e-12);
    }

    #[test]
    fn temperature_axis_exponentiates_log_values() {
        let values = IntegrationAxis::Temperature.values(&[0.0, 1.0, 2.0]);
        assert_eq!(values, vec![1.0, 10.0, 100.0]);
        assert_eq!(
            IntegrationAxis::LogTemperature.values(&[0.0, 1.0]),
            vec![0.0, 1.0]
        );
    }
}
