//! Fit results and model-cube reconstruction
//!
//! A [`ModelFit`] holds the parameter cube `(npars, y, x)`, the matching
//! error cube and the fit-success map. It persists as one FITS cube with the
//! parameter planes followed by the error planes, annotated with `FITTYPE`,
//! `NPARS` and one `PLANEn` name per plane.
//!
//! Reconstruction evaluates the model at every pixel whose parameters are
//! valid and leaves the rest blank. A template pixel is chosen first; when
//! the requested one is unusable the first valid pixel in row-major order is
//! taken instead, and when there is none the whole model cube is blank.

use ndarray::{concatenate, s, Array2, Array3, Axis};
use rayon::prelude::*;
use std::path::Path;

use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::io::fits::{read_cube, write_cube};
use crate::registry::{Fitter, FitterRegistry};
use crate::xarr::SpectralAxis;

/// Per-pixel fit results
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFit {
    pub fittype: String,
    pub npars: usize,
    pub parcube: Array3<f64>,
    pub errcube: Array3<f64>,
    pub has_fit: Array2<bool>,
}

impl ModelFit {
    /// Every pixel unfit, parameters and errors set to `blank`
    pub fn blank(fittype: &str, npars: usize, (ny, nx): (usize, usize), blank: f64) -> Self {
        Self {
            fittype: fittype.to_string(),
            npars,
            parcube: Array3::from_elem((npars, ny, nx), blank),
            errcube: Array3::from_elem((npars, ny, nx), blank),
            has_fit: Array2::from_elem((ny, nx), false),
        }
    }

    /// `(ny, nx)`
    pub fn spatial_shape(&self) -> (usize, usize) {
        self.has_fit.dim()
    }

    pub fn n_fit(&self) -> usize {
        self.has_fit.iter().filter(|f| **f).count()
    }

    pub fn params_at(&self, y: usize, x: usize) -> Vec<f64> {
        self.parcube.slice(s![.., y, x]).to_vec()
    }

    pub fn errors_at(&self, y: usize, x: usize) -> Vec<f64> {
        self.errcube.slice(s![.., y, x]).to_vec()
    }

    /// Record a successful fit at `(y, x)`.
    pub fn set_fit(&mut self, y: usize, x: usize, params: &[f64], errors: &[f64]) {
        for (p, (&value, &error)) in params.iter().zip(errors).enumerate() {
            self.parcube[[p, y, x]] = value;
            self.errcube[[p, y, x]] = error;
        }
        self.has_fit[[y, x]] = true;
    }

    /// Write parameters then errors as a `(2·npars, y, x)` cube.
    ///
    /// The spatial WCS of `source_header` is kept; its spectral axis is
    /// replaced by the plane axis.
    pub fn write<P: AsRef<Path>>(
        &self,
        path: P,
        source_header: &Header,
        fitter: &Fitter,
        overwrite: bool,
    ) -> Result<()> {
        let planes = concatenate(Axis(0), &[self.parcube.view(), self.errcube.view()])
            .map_err(|e| CubeError::ShapeMismatch(e.to_string()))?;

        let mut header = source_header.clone();
        header.remove_axis(3);
        header.set("NAXIS", 3i64);
        header.set_naxis(3, planes.dim().0);
        header.set("FITTYPE", self.fittype.as_str());
        header.set("NPARS", self.npars);

        let names = fitter.parameter_names();
        for (i, name) in names.iter().enumerate() {
            header.set(&format!("PLANE{}", i + 1), name.as_str());
            header.set(&format!("PLANE{}", i + 1 + self.npars), format!("e{name}"));
        }

        write_cube(path, planes.view(), &header, overwrite)
    }

    /// Read a parameter file.
    ///
    /// `npars` and `fittype` default to the file's `NPARS` and `FITTYPE`
    /// keywords. The file holds either `npars` planes (parameters only, errors
    /// become NaN) or `2·npars` planes. A pixel counts as fit when all of its
    /// parameters are finite and not all zero.
    pub fn read<P: AsRef<Path>>(
        path: P,
        npars: Option<usize>,
        fittype: Option<&str>,
    ) -> Result<(Self, Header)> {
        let (planes, header) = read_cube(path)?;
        let (nplanes, ny, nx) = planes.dim();

        let npars = match npars {
            Some(n) => n,
            None => header
                .get_i64("NPARS")
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    CubeError::InvalidConfig(
                        "npars not given and the parameter file has no NPARS".to_string(),
                    )
                })?,
        };
        if npars == 0 {
            return Err(CubeError::InvalidConfig("npars must be positive".to_string()));
        }

        let fittype = match fittype.or_else(|| header.get_str("FITTYPE")) {
            Some(name) => name.trim().to_string(),
            None => {
                return Err(CubeError::InvalidConfig(
                    "fittype not given and the parameter file has no FITTYPE".to_string(),
                ))
            }
        };

        let parcube = planes.slice(s![..npars.min(nplanes), .., ..]).to_owned();
        let errcube = if nplanes == 2 * npars {
            planes.slice(s![npars.., .., ..]).to_owned()
        } else if nplanes == npars {
            Array3::from_elem((npars, ny, nx), f64::NAN)
        } else {
            return Err(CubeError::ShapeMismatch(format!(
                "parameter file has {nplanes} planes, expected {npars} or {}",
                2 * npars
            )));
        };

        let has_fit = Array2::from_shape_fn((ny, nx), |(y, x)| {
            let column = parcube.slice(s![.., y, x]);
            column.iter().all(|v| v.is_finite()) && column.iter().any(|v| *v != 0.0)
        });

        Ok((
            Self {
                fittype,
                npars,
                parcube,
                errcube,
                has_fit,
            },
            header,
        ))
    }

    fn pixel_is_valid(&self, fitter: &Fitter, y: usize, x: usize) -> bool {
        self.has_fit[[y, x]] && fitter.is_valid(&self.params_at(y, x))
    }
}

/// A loaded fit with the evaluator and template pixel chosen for it
#[derive(Debug, Clone)]
pub struct LoadedFit {
    pub fit: ModelFit,
    pub fitter: Fitter,
    /// `(x, y)` of the template pixel, `None` when no pixel is valid
    pub template: Option<(usize, usize)>,
}

/// Pick the template pixel, falling back to the first valid pixel in
/// row-major order when `temp_fit_loc` (`(x, y)`) is out of range or holds
/// invalid parameters.
pub fn resolve_template(
    fit: &ModelFit,
    fitter: &Fitter,
    temp_fit_loc: (usize, usize),
) -> Option<(usize, usize)> {
    let (ny, nx) = fit.spatial_shape();
    let (tx, ty) = temp_fit_loc;
    if tx < nx && ty < ny && fit.pixel_is_valid(fitter, ty, tx) {
        return Some(temp_fit_loc);
    }

    let fallback = (0..ny)
        .flat_map(|y| (0..nx).map(move |x| (x, y)))
        .find(|&(x, y)| fit.pixel_is_valid(fitter, y, x));
    match fallback {
        Some(loc) => log::warn!(
            "parameters at template pixel {temp_fit_loc:?} are invalid, using {loc:?} instead"
        ),
        None => log::warn!("no pixel holds valid {} parameters, model cube will be blank", fit.fittype),
    }
    fallback
}

/// Load a parameter file for a cube of spatial shape `(ny, nx)`.
///
/// Invalid parameters never fail the load; they only affect the template
/// choice and blank the affected pixels on reconstruction.
pub fn load_model_fit<P: AsRef<Path>>(
    path: P,
    npars: usize,
    fittype: Option<&str>,
    temp_fit_loc: Option<(usize, usize)>,
    registry: &FitterRegistry,
    spatial_shape: (usize, usize),
) -> Result<LoadedFit> {
    let (fit, _) = ModelFit::read(path, Some(npars), fittype)?;
    if fit.spatial_shape() != spatial_shape {
        return Err(CubeError::ShapeMismatch(format!(
            "parameter maps are {:?}, cube is {:?}",
            fit.spatial_shape(),
            spatial_shape
        )));
    }

    let fitter = registry.resolve(&fit.fittype)?.with_npars(npars)?;
    let template = resolve_template(&fit, &fitter, temp_fit_loc.unwrap_or((0, 0)));
    log::info!(
        "loaded {} fit with {} parameters, {} of {} pixels fit",
        fit.fittype,
        npars,
        fit.n_fit(),
        fit.has_fit.len()
    );

    Ok(LoadedFit {
        fit,
        fitter,
        template,
    })
}

/// Evaluate the model at every valid pixel over `xarr`.
///
/// Pixels with invalid parameters, and every pixel when `template` is
/// `None`, are set to `blank`.
pub fn reconstruct(
    xarr: &SpectralAxis,
    fit: &ModelFit,
    fitter: &Fitter,
    template: Option<(usize, usize)>,
    blank: f64,
) -> Array3<f64> {
    let (ny, nx) = fit.spatial_shape();
    let nz = xarr.len();
    let mut model = Array3::from_elem((nz, ny, nx), blank);
    if template.is_none() {
        return model;
    }

    let x: Vec<f64> = xarr.values().to_vec();
    let spectra: Vec<Option<Vec<f64>>> = (0..ny * nx)
        .into_par_iter()
        .map(|idx| {
            let (y, px) = (idx / nx, idx % nx);
            if !fit.pixel_is_valid(fitter, y, px) {
                return None;
            }
            let mut spectrum = vec![0.0; nz];
            fitter.evaluate_into(x.iter().copied(), &fit.params_at(y, px), &mut spectrum);
            Some(spectrum)
        })
        .collect();

    for (idx, spectrum) in spectra.into_iter().enumerate() {
        if let Some(spectrum) = spectrum {
            let (y, px) = (idx / nx, idx % nx);
            for (z, value) in spectrum.into_iter().enumerate() {
                model[[z, y, px]] = value;
            }
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::SpectralUnit;
    use approx::assert_relative_eq;
    use ndarray::Array1;
    use tempfile::TempDir;

    fn gaussian() -> Fitter {
        FitterRegistry::new().resolve("gaussian").unwrap().clone()
    }

    fn two_by_two_fit() -> ModelFit {
        let mut fit = ModelFit::blank("gaussian", 3, (2, 2), f64::NAN);
        for y in 0..2 {
            for x in 0..2 {
                fit.set_fit(y, x, &[1.0 + x as f64, 0.0, 0.5], &[0.1, 0.1, 0.1]);
            }
        }
        fit
    }

    #[test]
    fn test_template_falls_back_to_first_valid_pixel() {
        let mut fit = two_by_two_fit();
        let fitter = gaussian();
        assert_eq!(resolve_template(&fit, &fitter, (0, 0)), Some((0, 0)));

        fit.parcube[[2, 0, 0]] = -0.5;
        assert_eq!(resolve_template(&fit, &fitter, (0, 0)), Some((1, 0)));
        assert_eq!(resolve_template(&fit, &fitter, (7, 7)), Some((1, 0)));

        fit.parcube.slice_mut(s![2, .., ..]).fill(-0.5);
        assert_eq!(resolve_template(&fit, &fitter, (0, 0)), None);
    }

    #[test]
    fn test_reconstruct_blanks_invalid_pixels() {
        let mut fit = two_by_two_fit();
        fit.parcube[[2, 1, 1]] = -0.5;
        let xarr = SpectralAxis::new(Array1::linspace(-1.0, 1.0, 5), SpectralUnit::KilometersPerSecond);

        let model = reconstruct(&xarr, &fit, &gaussian(), Some((0, 0)), f64::NAN);
        assert_eq!(model.dim(), (5, 2, 2));
        assert_relative_eq!(model[[2, 0, 0]], 1.0);
        assert_relative_eq!(model[[2, 0, 1]], 2.0);
        assert!(model.slice(s![.., 1, 1]).iter().all(|v| v.is_nan()));

        let blank = reconstruct(&xarr, &fit, &gaussian(), None, 0.0);
        assert!(blank.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pars.fits");
        let mut fit = two_by_two_fit();
        fit.parcube[[0, 1, 0]] = f64::NAN;
        fit.has_fit[[1, 0]] = false;

        let mut header = Header::new();
        header.set("CRPIX1", 9.0);
        header.set("CRVAL3", 5.0);
        fit.write(&path, &header, &gaussian(), false).unwrap();

        let (read, read_header) = ModelFit::read(&path, None, None).unwrap();
        assert_eq!(read.fittype, "gaussian");
        assert_eq!(read.npars, 3);
        assert_eq!(read.has_fit, fit.has_fit);
        assert_relative_eq!(read.errcube[[1, 0, 1]], 0.1);
        assert_eq!(read_header.get_str("PLANE3"), Some("width"));
        assert_eq!(read_header.get_str("PLANE6"), Some("ewidth"));
        assert_eq!(read_header.get_f64("CRPIX1"), Some(9.0));
        assert!(!read_header.contains("CRVAL3"));
    }

    #[test]
    fn test_read_rejects_wrong_plane_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pars.fits");
        two_by_two_fit().write(&path, &Header::new(), &gaussian(), false).unwrap();

        assert!(matches!(
            ModelFit::read(&path, Some(4), None),
            Err(CubeError::ShapeMismatch(_))
        ));
        let (params_only, _) = ModelFit::read(&path, Some(6), Some("gaussian")).unwrap();
        assert!(params_only.errcube.iter().all(|v| v.is_nan()));
    }
}
