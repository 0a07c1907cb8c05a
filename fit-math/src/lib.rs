//! fit-math - Numerical building blocks for spectral cube fitting
//!
//! This crate provides the numerical core used by `cubefit`, kept free of any
//! FITS or cube knowledge:
//!
//! - **Statistics** - NaN-aware mean, standard deviation and median
//! - **Kernels** - Sampled 1D and 2D Gaussian kernels
//! - **Levenberg-Marquardt** - Damped nonlinear least squares with parameter
//!   uncertainties from the covariance matrix
//!
//! # Example
//!
//! ```text
//! use fit_math::lm::{levenberg_marquardt, LeastSquaresProblem, LmConfig};
//!
//! let fit = levenberg_marquardt(&problem, &[1.0, 0.0, 1.0], &LmConfig::default())?;
//! assert!(fit.converged);
//! ```

pub mod kernel;
pub mod lm;
pub mod stats;

// Re-export commonly used types
pub use kernel::{gaussian_kernel_1d, gaussian_kernel_2d};
pub use lm::{levenberg_marquardt, LeastSquaresProblem, LmConfig, LmError, LmFit, Termination};
pub use stats::{mad_std, median, nan_mean, nan_std};
