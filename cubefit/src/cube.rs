//! The spectral cube object
//!
//! A [`Cube`] owns its flux array, header, spectral axis and optional error
//! cube and mask, plus the state of the last fit. [`SpectralCube`] is the
//! seam shared with [`CubeStack`](crate::stack::CubeStack): anything that can
//! present a flux cube, a spectral axis and a registry gets per-pixel
//! fitting, parameter-file loading and model-cube reconstruction.

use ndarray::{s, Array1, Array2, Array3, CowArray, Ix2, Ix3};
use std::path::Path;

use crate::error::{CubeError, Result};
use crate::fiteach::{fit_each, FitEachConfig, FitEachReport, FitInput};
use crate::header::Header;
use crate::io::fits::{read_cube, write_cube};
use crate::modelcube::{load_model_fit, reconstruct, resolve_template, LoadedFit, ModelFit};
use crate::registry::FitterRegistry;
use crate::spectrum::Spectrum;
use crate::subimage::{spectral_range, subimage_integ, Subimage, SubimageRequest};
use crate::units::{SpectralUnit, VelocityConvention};
use crate::xarr::SpectralAxis;

/// Fit results and the model cube derived from them
#[derive(Debug, Clone)]
pub struct FitState {
    pub loaded: Option<LoadedFit>,
    pub modelcube: Option<Array3<f64>>,
    /// Fill value for unfit or invalid pixels
    pub blank: f64,
}

impl Default for FitState {
    fn default() -> Self {
        Self {
            loaded: None,
            modelcube: None,
            blank: f64::NAN,
        }
    }
}

impl FitState {
    fn install(&mut self, loaded: LoadedFit, blank: f64) {
        self.loaded = Some(loaded);
        self.modelcube = None;
        self.blank = blank;
    }
}

/// Shared fitting surface of cubes and cube stacks
pub trait SpectralCube {
    /// Flux indexed `[z, y, x]`
    fn flux(&self) -> CowArray<'_, f64, Ix3>;

    fn error_flux(&self) -> Option<CowArray<'_, f64, Ix3>>;

    /// `(y, x)` pixels that may be fit
    fn spatial_mask(&self) -> Option<CowArray<'_, bool, Ix2>>;

    fn xarr(&self) -> &SpectralAxis;

    fn header(&self) -> &Header;

    fn registry(&self) -> &FitterRegistry;

    fn fit_state(&self) -> &FitState;

    fn fit_state_mut(&mut self) -> &mut FitState;

    /// `(ny, nx)`
    fn spatial_shape(&self) -> (usize, usize) {
        let (_, ny, nx) = self.flux().dim();
        (ny, nx)
    }

    /// Fit every spatial pixel; replaces any earlier fit and drops the
    /// cached model cube.
    fn fiteach(&mut self, config: &FitEachConfig) -> Result<FitEachReport> {
        let (report, loaded) = {
            let flux = self.flux();
            let errors = self.error_flux();
            let mask = self.spatial_mask();
            let input = FitInput {
                cube: flux.view(),
                xarr: self.xarr(),
                errorcube: errors.as_ref().map(|e| e.view()),
                maskmap: mask.as_ref().map(|m| m.view()),
                registry: self.registry(),
            };
            let (fit, report) = fit_each(input, config)?;
            let fitter = self.registry().resolve(&fit.fittype)?.with_npars(fit.npars)?;
            let template = (fit.n_fit() > 0)
                .then(|| resolve_template(&fit, &fitter, config.start_from_point))
                .flatten();
            (report, LoadedFit { fit, fitter, template })
        };
        self.fit_state_mut().install(loaded, config.blank());
        Ok(report)
    }

    /// Load a parameter file written by [`write_fit`](Self::write_fit).
    ///
    /// `temp_fit_loc` is the `(x, y)` template pixel, `(0, 0)` when `None`.
    fn load_model_fit(
        &mut self,
        path: &Path,
        npars: usize,
        fittype: Option<&str>,
        temp_fit_loc: Option<(usize, usize)>,
    ) -> Result<()> {
        let loaded = load_model_fit(
            path,
            npars,
            fittype,
            temp_fit_loc,
            self.registry(),
            self.spatial_shape(),
        )?;
        let blank = self.fit_state().blank;
        self.fit_state_mut().install(loaded, blank);
        Ok(())
    }

    /// Model cube of the current fit, built on first use and cached.
    fn get_modelcube(&mut self) -> Result<&Array3<f64>> {
        if self.fit_state().modelcube.is_none() {
            let state = self.fit_state();
            let loaded = state
                .loaded
                .as_ref()
                .ok_or_else(|| CubeError::InvalidConfig("no fit to build a model cube from".to_string()))?;
            let model = reconstruct(self.xarr(), &loaded.fit, &loaded.fitter, loaded.template, state.blank);
            self.fit_state_mut().modelcube = Some(model);
        }
        self.fit_state()
            .modelcube
            .as_ref()
            .ok_or_else(|| CubeError::InvalidConfig("model cube unavailable".to_string()))
    }

    /// Drop the cached model cube; the next [`get_modelcube`](Self::get_modelcube)
    /// rebuilds it.
    fn clear_modelcube(&mut self) {
        self.fit_state_mut().modelcube = None;
    }

    /// `flux − model`
    fn residual(&mut self) -> Result<Array3<f64>> {
        let model = self.get_modelcube()?.clone();
        Ok(&self.flux() - &model)
    }

    fn model_fit(&self) -> Option<&ModelFit> {
        self.fit_state().loaded.as_ref().map(|l| &l.fit)
    }

    fn parcube(&self) -> Option<&Array3<f64>> {
        self.model_fit().map(|f| &f.parcube)
    }

    fn errcube(&self) -> Option<&Array3<f64>> {
        self.model_fit().map(|f| &f.errcube)
    }

    fn has_fit(&self) -> Option<&Array2<bool>> {
        self.model_fit().map(|f| &f.has_fit)
    }

    /// Write the current fit as a parameter file.
    fn write_fit(&self, path: &Path, overwrite: bool) -> Result<()> {
        let loaded = self
            .fit_state()
            .loaded
            .as_ref()
            .ok_or_else(|| CubeError::InvalidConfig("no fit to write".to_string()))?;
        loaded.fit.write(path, self.header(), &loaded.fitter, overwrite)
    }
}

/// A spectral cube `[z, y, x]` with its header and fit state
#[derive(Debug, Clone)]
pub struct Cube {
    pub cube: Array3<f64>,
    pub header: Header,
    pub xarr: SpectralAxis,
    pub errorcube: Option<Array3<f64>>,
    pub maskmap: Array2<bool>,
    /// Spectrum at the reference pixel `(0, 0)`
    pub data: Array1<f64>,
    pub error: Option<Array1<f64>>,
    registry: FitterRegistry,
    state: FitState,
}

impl Cube {
    /// Wrap `cube` and its header.
    ///
    /// `NAXISn` keywords present in `header` must match the array; missing
    /// ones are filled in. The spectral axis comes from the axis-3 WCS, or
    /// is a plain channel index when the header has none.
    pub fn new(cube: Array3<f64>, mut header: Header) -> Result<Self> {
        let (nz, ny, nx) = cube.dim();
        if ny == 0 || nx == 0 {
            return Err(CubeError::ShapeMismatch(format!(
                "cube has no spatial pixels: {:?}",
                cube.dim()
            )));
        }
        for (axis, len) in [(1, nx), (2, ny), (3, nz)] {
            match header.naxis(axis) {
                Some(n) if n != len => {
                    return Err(CubeError::ShapeMismatch(format!(
                        "NAXIS{axis} = {n} but the cube has {len} pixels on that axis"
                    )))
                }
                Some(_) => {}
                None => header.set_naxis(axis, len),
            }
        }
        header.set("NAXIS", 3i64);

        let xarr = if header.contains("CRVAL3") && header.contains("CDELT3") {
            SpectralAxis::from_header(&header)?
        } else {
            SpectralAxis::pixels(nz)
        };

        Ok(Self {
            data: cube.slice(s![.., 0, 0]).to_owned(),
            error: None,
            maskmap: Array2::from_elem((ny, nx), true),
            errorcube: None,
            xarr,
            header,
            cube,
            registry: FitterRegistry::default(),
            state: FitState::default(),
        })
    }

    /// Read a cube from a FITS file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (cube, header) = read_cube(path)?;
        log::info!("opened {:?} cube from {}", cube.dim(), path.display());
        Self::new(cube, header)
    }

    pub fn with_errorcube(mut self, errorcube: Array3<f64>) -> Result<Self> {
        if errorcube.dim() != self.cube.dim() {
            return Err(CubeError::ShapeMismatch(format!(
                "error cube is {:?}, cube is {:?}",
                errorcube.dim(),
                self.cube.dim()
            )));
        }
        self.error = Some(errorcube.slice(s![.., 0, 0]).to_owned());
        self.errorcube = Some(errorcube);
        Ok(self)
    }

    pub fn with_maskmap(mut self, maskmap: Array2<bool>) -> Result<Self> {
        let (_, ny, nx) = self.cube.dim();
        if maskmap.dim() != (ny, nx) {
            return Err(CubeError::ShapeMismatch(format!(
                "mask is {:?}, cube spatial shape is {:?}",
                maskmap.dim(),
                (ny, nx)
            )));
        }
        self.maskmap = maskmap;
        Ok(self)
    }

    /// Independent deep copy; nothing is shared with `self`.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn registry_mut(&mut self) -> &mut FitterRegistry {
        &mut self.registry
    }

    pub fn set_velocity_convention(&mut self, convention: VelocityConvention) {
        self.xarr.set_velocity_convention(convention);
    }

    /// Spectrum at pixel `(x, y)`, inheriting a copy of this cube's registry.
    pub fn get_spectrum(&self, x: usize, y: usize) -> Result<Spectrum> {
        let (_, ny, nx) = self.cube.dim();
        if x >= nx || y >= ny {
            return Err(CubeError::Bounds(format!(
                "pixel ({x}, {y}) is outside the {nx}x{ny} map"
            )));
        }
        let spectrum = Spectrum::new(
            self.cube.slice(s![.., y, x]).to_owned(),
            self.xarr.clone(),
            self.header.clone(),
        )?
        .with_registry(self.registry.clone());
        match &self.errorcube {
            Some(errors) => spectrum.with_error(errors.slice(s![.., y, x]).to_owned()),
            None => Ok(spectrum),
        }
    }

    /// Cut out the channels between `start` and `stop`.
    ///
    /// With a `unit`, both ends are spectral values converted through the
    /// axis' velocity convention and snapped to the nearest channel; without
    /// one they are channel indices. The range is ordered and half-open.
    /// `update_header` rewrites the spectral WCS to describe the new axis.
    /// The fit state is not carried over.
    pub fn slice(
        &self,
        start: f64,
        stop: f64,
        unit: Option<SpectralUnit>,
        update_header: bool,
    ) -> Result<Cube> {
        let nz = self.xarr.len();
        let (lo, hi) = match unit {
            None => spectral_range(start, stop, nz)?,
            Some(unit) => {
                let a = self.xarr.x_to_pix(start, Some(unit))?;
                let b = self.xarr.x_to_pix(stop, Some(unit))?;
                (a.min(b), a.max(b))
            }
        };
        if hi <= lo {
            return Err(CubeError::Bounds(format!(
                "slice ({start}, {stop}) selects no channels"
            )));
        }

        let cube = self.cube.slice(s![lo..hi, .., ..]).to_owned();
        let xarr = self.xarr.slice(lo..hi);
        let mut header = self.header.clone();
        header.set_naxis(3, hi - lo);
        if update_header {
            xarr.write_to_header(&mut header, 3);
        }

        let errorcube = self
            .errorcube
            .as_ref()
            .map(|e| e.slice(s![lo..hi, .., ..]).to_owned());
        Ok(Cube {
            data: cube.slice(s![.., 0, 0]).to_owned(),
            error: errorcube.as_ref().map(|e| e.slice(s![.., 0, 0]).to_owned()),
            errorcube,
            maskmap: self.maskmap.clone(),
            xarr,
            header,
            cube,
            registry: self.registry.clone(),
            state: FitState::default(),
        })
    }

    /// Crop and collapse; see [`subimage_integ`].
    pub fn subimage(&self, request: &SubimageRequest) -> Result<Subimage> {
        subimage_integ(self.cube.view(), Some(&self.header), request)
    }

    /// Write the flux cube and its header.
    pub fn write<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        write_cube(path, self.cube.view(), &self.header, overwrite)
    }

    /// Cached model cube, if one has been built
    pub fn modelcube(&self) -> Option<&Array3<f64>> {
        self.state.modelcube.as_ref()
    }
}

impl SpectralCube for Cube {
    fn flux(&self) -> CowArray<'_, f64, Ix3> {
        CowArray::from(self.cube.view())
    }

    fn error_flux(&self) -> Option<CowArray<'_, f64, Ix3>> {
        self.errorcube.as_ref().map(|e| CowArray::from(e.view()))
    }

    fn spatial_mask(&self) -> Option<CowArray<'_, bool, Ix2>> {
        Some(CowArray::from(self.maskmap.view()))
    }

    fn xarr(&self) -> &SpectralAxis {
        &self.xarr
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn registry(&self) -> &FitterRegistry {
        &self.registry
    }

    fn fit_state(&self) -> &FitState {
        &self.state
    }

    fn fit_state_mut(&mut self) -> &mut FitState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{make_test_cube, TestCubeConfig};
    use approx::assert_relative_eq;

    fn test_cube(nz: usize) -> Cube {
        make_test_cube(&TestCubeConfig::default().with_shape((nz, 9, 9)))
            .unwrap()
            .into_cube()
            .unwrap()
    }

    #[test]
    fn test_new_checks_naxis() {
        let mut header = Header::new();
        header.set_naxis(1, 4);
        let result = Cube::new(Array3::zeros((2, 3, 5)), header);
        assert!(matches!(result, Err(CubeError::ShapeMismatch(_))));

        let cube = Cube::new(Array3::zeros((2, 3, 5)), Header::new()).unwrap();
        assert_eq!(cube.header.naxis(1), Some(5));
        assert_eq!(cube.header.naxis(3), Some(2));
        assert_eq!(cube.xarr.unit(), SpectralUnit::Pixel);
    }

    #[test]
    fn test_xarr_follows_header() {
        let cube = test_cube(30);
        assert_eq!(cube.xarr.len(), 30);
        assert_relative_eq!(cube.xarr.values()[4], 5.0);
        assert_eq!(cube.xarr.unit(), SpectralUnit::KilometersPerSecond);
        assert_eq!(cube.xarr.velocity_convention(), Some(VelocityConvention::Radio));
    }

    #[test]
    fn test_slice_by_value_rewrites_header() {
        let cube = test_cube(100);
        let cut = cube
            .slice(-1.0, 1.0, Some(SpectralUnit::KilometersPerSecond), true)
            .unwrap();

        assert_eq!(cut.header.naxis(3), Some(cut.xarr.len()));
        assert_eq!(cut.cube.dim().0, cut.xarr.len());
        let crval3 = cut.header.get_f64("CRVAL3").unwrap();
        let crpix3 = cut.header.get_f64("CRPIX3").unwrap();
        let cunit3: SpectralUnit = cut.header.get_str("CUNIT3").unwrap().parse().unwrap();
        assert_eq!((cut.xarr.x_to_pix(crval3, Some(cunit3)).unwrap() + 1) as f64, crpix3);
    }

    #[test]
    fn test_slice_by_pixel_keeps_wcs_unless_asked() {
        let cube = test_cube(30);
        let cut = cube.slice(12.0, 3.0, None, false).unwrap();
        assert_eq!(cut.xarr.len(), 9);
        assert_eq!(cut.header.naxis(3), Some(9));
        assert_eq!(cut.header.get_f64("CRPIX3"), Some(5.0));
        assert_eq!(cut.cube[[0, 4, 4]], cube.cube[[3, 4, 4]]);

        assert!(matches!(cube.slice(40.0, 50.0, None, false), Err(CubeError::Bounds(_))));
    }

    #[test]
    fn test_spectrum_inherits_registry_copy() {
        let cube = test_cube(30);
        let mut spectrum = cube.get_spectrum(3, 3).unwrap();
        spectrum
            .registry_mut()
            .add_fitter("lorentz", std::sync::Arc::new(crate::models::ModelKind::Lorentzian), 3)
            .unwrap();
        assert!(spectrum.registry().contains("lorentz"));
        assert!(!cube.registry().contains("lorentz"));
        assert!(matches!(cube.get_spectrum(9, 0), Err(CubeError::Bounds(_))));
    }

    #[test]
    fn test_modelcube_needs_a_fit() {
        let mut cube = test_cube(30);
        assert!(matches!(cube.get_modelcube(), Err(CubeError::InvalidConfig(_))));
        assert!(cube.parcube().is_none());
    }

    #[test]
    fn test_fiteach_populates_state() {
        let mut cube = test_cube(30);
        let config = FitEachConfig::new("gaussian", vec![0.7, 0.5, 0.8])
            .with_signal_cut(0.0)
            .with_start_from_point(4, 4);
        let report = cube.fiteach(&config).unwrap();

        assert_eq!(report.n_below_cut, 0);
        assert_eq!(report.n_fit + report.n_failed, 81);
        assert!(cube.has_fit().unwrap()[[4, 4]]);
        assert_eq!(cube.parcube().unwrap().dim(), (3, 9, 9));
        let model = cube.get_modelcube().unwrap();
        assert_eq!(model.dim(), (30, 9, 9));
        assert!(model.slice(s![.., 4, 4]).iter().all(|v| v.is_finite()));
        assert_eq!(cube.residual().unwrap().dim(), (30, 9, 9));
    }
}
