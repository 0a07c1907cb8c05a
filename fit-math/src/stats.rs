//! Statistical helpers for spectra and residual maps
//!
//! All functions ignore NaN samples, which is how blanked channels and
//! unfit pixels are represented throughout `cubefit`.

use thiserror::Error;

/// Errors from statistical reductions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("insufficient data: {total} values, {valid} valid (need at least {required})")]
    InsufficientData {
        total: usize,
        valid: usize,
        required: usize,
    },
}

fn finite_values(values: &[f64]) -> Vec<f64> {
    values.iter().filter(|v| !v.is_nan()).copied().collect()
}

/// Calculate median of a slice of f64 values
///
/// NaN values are filtered out, infinite values are kept. For even-length
/// data the average of the two middle values is returned.
///
/// # Arguments
///
/// * `values` - Slice of f64 values to compute median from
///
/// # Returns
///
/// * `Ok(median)` - The median value
/// * `Err(StatsError)` - If no valid values remain after filtering NaN
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid_values = finite_values(values);

    if valid_values.is_empty() {
        return Err(StatsError::InsufficientData {
            total: values.len(),
            valid: 0,
            required: 1,
        });
    }

    valid_values.sort_by(|a, b| a.total_cmp(b));

    let mid = valid_values.len() / 2;
    let median_value = if valid_values.len() % 2 == 0 {
        (valid_values[mid - 1] + valid_values[mid]) / 2.0
    } else {
        valid_values[mid]
    };

    Ok(median_value)
}

/// Mean of the non-NaN samples, NaN when there are none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));

    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Population standard deviation (ddof = 0) of the non-NaN samples.
///
/// Returns NaN when no valid samples exist.
pub fn nan_std(values: &[f64]) -> f64 {
    let mean = nan_mean(values);
    if mean.is_nan() {
        return f64::NAN;
    }

    let (sum_sq, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), &v| (s + (v - mean).powi(2), n + 1));

    (sum_sq / count as f64).sqrt()
}

/// Robust standard deviation estimate from the median absolute deviation.
///
/// Uses σ ≈ 1.4826 × MAD, valid for Gaussian noise.
pub fn mad_std(values: &[f64]) -> Result<f64, StatsError> {
    let center = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| (v - center).abs())
        .collect();

    Ok(1.4826 * median(&deviations)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
    }

    #[test]
    fn test_median_skips_nan() {
        assert_eq!(median(&[f64::NAN, 5.0, 1.0, f64::NAN, 3.0]).unwrap(), 3.0);
    }

    #[test]
    fn test_median_all_nan_is_error() {
        let err = median(&[f64::NAN, f64::NAN]).unwrap_err();
        assert_eq!(
            err,
            StatsError::InsufficientData {
                total: 2,
                valid: 0,
                required: 1
            }
        );
    }

    #[test]
    fn test_nan_std_matches_population_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(nan_std(&values), 2.0, epsilon = 1e-12);

        let with_nan = [2.0, 4.0, f64::NAN, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_relative_eq!(nan_std(&with_nan), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_reductions_are_nan() {
        assert!(nan_mean(&[]).is_nan());
        assert!(nan_std(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_mad_std_of_constant_is_zero() {
        assert_eq!(mad_std(&[1.0; 16]).unwrap(), 0.0);
    }
}
