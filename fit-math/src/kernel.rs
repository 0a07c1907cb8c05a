//! Sampled Gaussian kernels
//!
//! Kernels are sampled at pixel centres around the middle of the array,
//! `(n - 1) / 2`, so even-sized kernels peak between two samples. Both
//! kernels are normalised to unit sum.

use ndarray::{Array1, Array2};

fn gaussian_profile(size: usize, sigma: f64) -> Array1<f64> {
    let center = (size as f64 - 1.0) / 2.0;
    Array1::from_shape_fn(size, |i| {
        let offset = i as f64 - center;
        (-(offset * offset) / (2.0 * sigma * sigma)).exp()
    })
}

/// Create a 1D Gaussian kernel of `size` samples with standard deviation `sigma`.
///
/// # Arguments
/// * `size` - Number of samples (any positive length)
/// * `sigma` - Standard deviation in samples, must be positive
///
/// # Returns
/// Kernel normalised so its samples sum to one
pub fn gaussian_kernel_1d(size: usize, sigma: f64) -> Array1<f64> {
    assert!(size > 0, "Kernel size must be positive");
    assert!(sigma > 0.0, "Kernel sigma must be positive");

    let mut kernel = gaussian_profile(size, sigma);
    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|x| x / sum);
    }
    kernel
}

/// Create a circular 2D Gaussian kernel of shape `(height, width)`.
///
/// # Arguments
/// * `height` - Number of rows
/// * `width` - Number of columns
/// * `sigma` - Standard deviation in pixels, must be positive
///
/// # Returns
/// Kernel normalised so its samples sum to one
pub fn gaussian_kernel_2d(height: usize, width: usize, sigma: f64) -> Array2<f64> {
    assert!(height > 0 && width > 0, "Kernel size must be positive");
    assert!(sigma > 0.0, "Kernel sigma must be positive");

    let rows = gaussian_profile(height, sigma);
    let cols = gaussian_profile(width, sigma);

    let mut kernel = Array2::from_shape_fn((height, width), |(i, j)| rows[i] * cols[j]);
    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|x| x / sum);
    }
    kernel
}
