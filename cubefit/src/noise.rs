//! Per-pixel noise maps
//!
//! Both maps reduce each spectrum `[.., y, x]` to one number and skip NaN
//! channels. Spectra with no finite channels map to NaN.

use fit_math::{mad_std, nan_std};
use ndarray::{Array2, ArrayView3, Axis, Zip};

/// Robust noise level of every spectrum, `1.4826 × MAD`.
///
/// Line emission occupying a minority of channels barely moves the
/// estimate, so the map can stand in for a missing error map.
pub fn estimate_errmap(cube: ArrayView3<'_, f64>) -> Array2<f64> {
    Zip::from(cube.lanes(Axis(0)))
        .par_map_collect(|spectrum| mad_std(&spectrum.to_vec()).unwrap_or(f64::NAN))
}

/// Standard deviation of every spectrum (ddof = 0).
pub fn std_map(cube: ArrayView3<'_, f64>) -> Array2<f64> {
    Zip::from(cube.lanes(Axis(0))).par_map_collect(|spectrum| nan_std(&spectrum.to_vec()))
}

/// Pixels whose residual spectrum scatters more than `threshold × rms`.
pub fn count_noisy_pixels(residual: ArrayView3<'_, f64>, threshold: f64, rms: f64) -> usize {
    std_map(residual)
        .iter()
        .filter(|&&std| std > threshold * rms)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{s, Array3};

    #[test]
    fn test_std_map_skips_nan_channels() {
        let mut cube = Array3::<f64>::zeros((8, 2, 3));
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        for (z, v) in values.iter().enumerate() {
            cube[[z, 1, 2]] = *v;
        }
        cube[[0, 0, 0]] = f64::NAN;
        cube.slice_mut(s![.., 0, 1]).fill(f64::NAN);

        let map = std_map(cube.view());
        assert_eq!(map.dim(), (2, 3));
        assert_relative_eq!(map[[1, 2]], 2.0, epsilon = 1e-12);
        assert_eq!(map[[0, 0]], 0.0);
        assert!(map[[0, 1]].is_nan());
    }

    #[test]
    fn test_errmap_ignores_isolated_spikes() {
        // alternating ±1 noise: MAD std = 1.4826
        let mut cube = Array3::from_shape_fn((40, 1, 2), |(z, _, _)| {
            if z % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        });
        cube[[20, 0, 1]] = 50.0;
        cube[[21, 0, 1]] = -50.0;

        let map = estimate_errmap(cube.view());
        assert_relative_eq!(map[[0, 0]], 1.4826, epsilon = 1e-12);
        assert_relative_eq!(map[[0, 1]], 1.4826, epsilon = 1e-12);
        assert!(std_map(cube.view())[[0, 1]] > 10.0);
    }

    #[test]
    fn test_count_noisy_pixels() {
        let mut cube = Array3::<f64>::zeros((10, 3, 3));
        for z in 0..10 {
            cube[[z, 1, 1]] = if z % 2 == 0 { 5.0 } else { -5.0 };
        }
        assert_eq!(count_noisy_pixels(cube.view(), 3.0, 1.0), 1);
        assert_eq!(count_noisy_pixels(cube.view(), 6.0, 1.0), 0);
    }
}
