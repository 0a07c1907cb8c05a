//! Pixel-by-pixel spectral line fitting for FITS data cubes
//!
//! This crate loads spectral cubes, crops and collapses them without
//! disturbing their world coordinates, fits a line model to the spectrum of
//! every spatial pixel in parallel, and rebuilds model cubes from persisted
//! fit parameters. Several cubes can be stacked along the spectral axis and
//! fit as one. A synthetic-cube generator provides reproducible test data.

pub mod cube;
pub mod error;
pub mod fiteach;
pub mod header;
pub mod io;
pub mod modelcube;
pub mod models;
pub mod noise;
pub mod parallel;
pub mod registry;
pub mod spectrum;
pub mod stack;
pub mod subimage;
pub mod synth;
pub mod units;
pub mod wcs;
pub mod xarr;

// Re-exports for easier access
pub use cube::{Cube, FitState, SpectralCube};
pub use error::{CubeError, Result};
pub use fiteach::{fit_each, FitEachConfig, FitEachReport, FitInput};
pub use header::{Header, HeaderValue};
pub use modelcube::{load_model_fit, reconstruct, LoadedFit, ModelFit};
pub use models::{ModelKind, SpectralModel};
pub use noise::{count_noisy_pixels, estimate_errmap, std_map};
pub use registry::{Fitter, FitterRegistry};
pub use spectrum::{fit_spectrum, FitFailure, Spectrum, SpectrumFit};
pub use stack::{CubeStack, StackOptions};
pub use subimage::{subimage_integ, Collapse, CoordUnits, Subimage, SubimageRequest};
pub use synth::{make_test_cube, TestCube, TestCubeConfig};
pub use units::{SpectralUnit, VelocityConvention};
pub use wcs::Wcs;
pub use xarr::SpectralAxis;
pub use fit_math::LmConfig;
