//! Synthetic test cubes
//!
//! A test cube is a separable Gaussian blob (spectral × spatial) with unit
//! peak plus Gaussian noise of standard deviation `1 / snr`. The header
//! carries a GLS celestial WCS, a radio velocity axis and the ground truth
//! (`SIGMA`, `RMSLVL`, `SEED`) needed to judge a fit.

use fit_math::{gaussian_kernel_1d, gaussian_kernel_2d};
use ndarray::{Array3, Axis};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cube::Cube;
use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::io::fits::write_cube;
use crate::parallel::process_cube_in_parallel_chunks;

const CDELT_SPATIAL: f64 = 4e-3 + 1e-8;
const CDELT_SPECTRAL: f64 = -0.1;

/// Generator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestCubeConfig {
    /// `(nz, ny, nx)`
    pub shape: (usize, usize, usize),
    /// Peak signal over noise standard deviation
    pub snr: f64,
    /// `(spectral, spatial)` Gaussian std in pixels; defaults to
    /// `(nz / 10, mean(ny, nx) / 5)`
    pub sigma: Option<(f64, f64)>,
    pub seed: u64,
}

impl Default for TestCubeConfig {
    fn default() -> Self {
        Self {
            shape: (30, 9, 9),
            snr: 30.0,
            sigma: None,
            seed: 0,
        }
    }
}

impl TestCubeConfig {
    pub fn with_shape(mut self, shape: (usize, usize, usize)) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_snr(mut self, snr: f64) -> Self {
        self.snr = snr;
        self
    }

    pub fn with_sigma(mut self, spectral: f64, spatial: f64) -> Self {
        self.sigma = Some((spectral, spatial));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sigma in effect after defaults
    pub fn resolved_sigma(&self) -> (f64, f64) {
        let (nz, ny, nx) = self.shape;
        self.sigma
            .unwrap_or((nz as f64 / 10.0, (ny + nx) as f64 / 2.0 / 5.0))
    }

    fn validate(&self) -> Result<()> {
        let (nz, ny, nx) = self.shape;
        if nz == 0 || ny == 0 || nx == 0 {
            return Err(CubeError::InvalidConfig(format!(
                "cube shape {:?} has an empty axis",
                self.shape
            )));
        }
        if !(self.snr.is_finite() && self.snr > 0.0) {
            return Err(CubeError::InvalidConfig(format!(
                "snr must be positive and finite, got {}",
                self.snr
            )));
        }
        let (spectral, spatial) = self.resolved_sigma();
        for (name, value) in [("spectral", spectral), ("spatial", spatial)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CubeError::InvalidConfig(format!(
                    "{name} sigma must be positive and finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// A generated cube and its header
#[derive(Debug, Clone, PartialEq)]
pub struct TestCube {
    pub cube: Array3<f64>,
    pub header: Header,
}

impl TestCube {
    /// Write the cube as a FITS file, replacing any existing file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_cube(path, self.cube.view(), &self.header, true)
    }

    pub fn into_cube(self) -> Result<Cube> {
        Cube::new(self.cube, self.header)
    }
}

/// Generate a synthetic cube.
///
/// The output is bit-identical for identical configurations regardless of
/// the size of the rayon pool it runs in.
pub fn make_test_cube(config: &TestCubeConfig) -> Result<TestCube> {
    config.validate()?;
    let (nz, ny, nx) = config.shape;
    let (sigma_spectral, sigma_spatial) = config.resolved_sigma();

    let spectral = gaussian_kernel_1d(nz, sigma_spectral);
    let spatial = gaussian_kernel_2d(ny, nx, sigma_spatial);

    let mut signal = Array3::zeros((nz, ny, nx));
    for (mut plane, &weight) in signal.axis_iter_mut(Axis(0)).zip(spectral.iter()) {
        plane.assign(&(&spatial * weight));
    }
    let peak = signal.iter().copied().fold(f64::MIN, f64::max);
    signal.mapv_inplace(|v| v / peak);

    let rms = 1.0 / config.snr;
    let noise = Normal::new(0.0, rms)
        .map_err(|e| CubeError::InvalidConfig(format!("noise distribution: {e}")))?;
    let cube = process_cube_in_parallel_chunks(signal, config.seed, None, |chunk, rng| {
        chunk.mapv_inplace(|v| v + noise.sample(rng));
    });

    let header = test_cube_header(config.shape, sigma_spectral, rms, config.seed);
    log::debug!(
        "generated {nz}x{ny}x{nx} test cube, sigma = ({sigma_spectral}, {sigma_spatial}), rms = {rms}"
    );

    Ok(TestCube { cube, header })
}

fn test_cube_header(shape: (usize, usize, usize), sigma_spectral: f64, rms: f64, seed: u64) -> Header {
    let (nz, ny, nx) = shape;
    let mut header = Header::new();

    header.set("NAXIS", 3i64);
    header.set_naxis(1, nx);
    header.set_naxis(2, ny);
    header.set_naxis(3, nz);

    header.set("CTYPE1", "RA---GLS");
    header.set("CTYPE2", "DEC--GLS");
    header.set("CTYPE3", "VRAD");
    header.set("CDELT1", -CDELT_SPATIAL);
    header.set("CDELT2", CDELT_SPATIAL);
    header.set("CDELT3", CDELT_SPECTRAL);
    header.set("CRVAL1", 0.0);
    header.set("CRVAL2", 0.0);
    header.set("CRVAL3", 5.0);
    header.set("CRPIX1", 9.0);
    header.set("CRPIX2", 0.0);
    header.set("CRPIX3", 5.0);
    header.set("CUNIT1", "deg");
    header.set("CUNIT2", "deg");
    header.set("CUNIT3", "km s-1");

    header.set("BMAJ", 3.0 * CDELT_SPATIAL);
    header.set("BMIN", 3.0 * CDELT_SPATIAL);
    header.set("BPA", 0.0);
    header.set("BUNIT", "K");
    header.set("EQUINOX", 2000.0);

    header.set_with_comment(
        "SIGMA",
        (sigma_spectral * CDELT_SPECTRAL).abs(),
        "in units of CUNIT3",
    );
    header.set_with_comment("RMSLVL", rms, "noise standard deviation");
    header.set("SEED", seed);

    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_same_config_same_cube() {
        let config = TestCubeConfig::default().with_shape((20, 5, 6)).with_seed(3);
        let a = make_test_cube(&config).unwrap();
        let b = make_test_cube(&config).unwrap();
        assert_eq!(a, b);

        let c = make_test_cube(&config.clone().with_seed(4)).unwrap();
        assert_ne!(a.cube, c.cube);
    }

    #[test]
    fn test_header_matches_shape_and_truth() {
        let config = TestCubeConfig::default().with_shape((100, 9, 9)).with_snr(50.0);
        let test_cube = make_test_cube(&config).unwrap();
        let header = &test_cube.header;

        assert_eq!(test_cube.cube.dim(), (100, 9, 9));
        assert_eq!(header.naxis(3), Some(100));
        assert_eq!(header.naxis(1), Some(9));
        assert_relative_eq!(header.get_f64("SIGMA").unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(header.get_f64("RMSLVL").unwrap(), 0.02);
        assert_eq!(header.get_i64("SEED"), Some(0));
        assert_eq!(header.get_str("CTYPE1"), Some("RA---GLS"));
    }

    #[test]
    fn test_noiseless_peak_is_one() {
        let config = TestCubeConfig::default().with_snr(1e12);
        let test_cube = make_test_cube(&config).unwrap();
        let peak = test_cube.cube.iter().copied().fold(f64::MIN, f64::max);
        assert_relative_eq!(peak, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_configurations_rejected() {
        for config in [
            TestCubeConfig::default().with_shape((0, 9, 9)),
            TestCubeConfig::default().with_snr(0.0),
            TestCubeConfig::default().with_snr(f64::NAN),
            TestCubeConfig::default().with_sigma(-1.0, 2.0),
        ] {
            assert!(matches!(
                make_test_cube(&config),
                Err(CubeError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: TestCubeConfig = serde_json::from_str(r#"{"shape": [100, 9, 9]}"#).unwrap();
        assert_eq!(config.shape, (100, 9, 9));
        assert_eq!(config.snr, 30.0);
        assert_eq!(config.seed, 0);
    }
}
