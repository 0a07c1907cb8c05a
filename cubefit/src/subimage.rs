//! Spatial cropping with spectral collapse
//!
//! [`subimage_integ`] cuts a rectangular spatial region out of a cube,
//! collapses a spectral range onto a 2D map and shifts the reference pixels
//! so every retained pixel keeps its world coordinate.
//!
//! Fractional boundaries round the same way everywhere: the centre ± width
//! interval is clipped to `[0, n]` first, then both ends are floored, and the
//! resulting range is half-open. A request that clips to nothing is a
//! [`CubeError::Bounds`] error.

use fit_math::nan_mean;
use ndarray::{Array2, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::wcs::Wcs;

/// Units of a requested coordinate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordUnits {
    #[default]
    Pixels,
    /// World units of the header WCS (degrees spatially, `CUNIT3` spectrally)
    World,
}

/// How the spectral range is collapsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collapse {
    #[default]
    Mean,
    Sum,
}

/// Crop request; widths are half-widths around the centre
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubimageRequest {
    pub xcen: f64,
    pub xwidth: f64,
    pub ycen: f64,
    pub ywidth: f64,
    /// Spectral range; the whole axis when unset
    pub vrange: Option<(f64, f64)>,
    pub units: CoordUnits,
    pub zunits: CoordUnits,
    pub collapse: Collapse,
    /// Multiply by `|CDELT3|`, turning a sum into an integrated intensity
    pub dvmult: bool,
}

impl Default for SubimageRequest {
    fn default() -> Self {
        Self {
            xcen: 0.0,
            xwidth: 0.0,
            ycen: 0.0,
            ywidth: 0.0,
            vrange: None,
            units: CoordUnits::Pixels,
            zunits: CoordUnits::Pixels,
            collapse: Collapse::Mean,
            dvmult: false,
        }
    }
}

impl SubimageRequest {
    pub fn new(xcen: f64, xwidth: f64, ycen: f64, ywidth: f64) -> Self {
        Self {
            xcen,
            xwidth,
            ycen,
            ywidth,
            ..Self::default()
        }
    }

    pub fn with_vrange(mut self, start: f64, stop: f64, zunits: CoordUnits) -> Self {
        self.vrange = Some((start, stop));
        self.zunits = zunits;
        self
    }

    pub fn with_units(mut self, units: CoordUnits) -> Self {
        self.units = units;
        self
    }

    pub fn with_collapse(mut self, collapse: Collapse, dvmult: bool) -> Self {
        self.collapse = collapse;
        self.dvmult = dvmult;
        self
    }
}

/// Half-open pixel ranges selected by a crop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBounds {
    pub xlo: usize,
    pub xhi: usize,
    pub ylo: usize,
    pub yhi: usize,
    pub zlo: usize,
    pub zhi: usize,
}

/// Collapsed map and its header
#[derive(Debug, Clone, PartialEq)]
pub struct Subimage {
    pub data: Array2<f64>,
    pub header: Option<Header>,
    pub bounds: CropBounds,
}

/// Clip `[c − w, c + w]` to `[0, n]` and floor both ends.
pub fn crop_range(center: f64, width: f64, n: usize, axis: &str) -> Result<(usize, usize)> {
    if !(center.is_finite() && width.is_finite()) || width < 0.0 {
        return Err(CubeError::InvalidConfig(format!(
            "{axis} centre {center} and width {width} must be finite, width non-negative"
        )));
    }
    let lo = (center - width).max(0.0).floor();
    let hi = (center + width).min(n as f64).floor();
    if hi <= lo {
        return Err(CubeError::Bounds(format!(
            "{axis} range {center} ± {width} selects nothing in 0..{n}"
        )));
    }
    Ok((lo as usize, hi as usize))
}

pub(crate) fn spectral_range(start: f64, stop: f64, nz: usize) -> Result<(usize, usize)> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(CubeError::InvalidConfig(format!(
            "spectral range ({start}, {stop}) must be finite"
        )));
    }
    let (a, b) = if start <= stop { (start, stop) } else { (stop, start) };
    let lo = a.clamp(0.0, nz as f64).floor();
    let hi = b.clamp(0.0, nz as f64).floor();
    if hi <= lo {
        return Err(CubeError::Bounds(format!(
            "spectral range ({start}, {stop}) selects nothing in 0..{nz}"
        )));
    }
    Ok((lo as usize, hi as usize))
}

fn require_header<'a>(header: Option<&'a Header>, what: &str) -> Result<&'a Header> {
    header.ok_or_else(|| {
        CubeError::InvalidConfig(format!("{what} needs a header"))
    })
}

/// Crop `cube` spatially and collapse a spectral range.
///
/// # Arguments
/// * `cube` - Data indexed `[z, y, x]`
/// * `header` - WCS of `cube`; required for world-unit requests, and the
///   source of the output header when given
/// * `request` - Region, spectral range and collapse method
///
/// # Returns
/// * `Ok(Subimage)` - Map of shape `(yhi − ylo, xhi − xlo)`; its header has
///   the spectral axis removed and `CRPIX1/2` shifted by the crop offset
/// * `Err(CubeError)` - Empty selection, world units without a header, or a
///   header that does not describe `cube`
pub fn subimage_integ(
    cube: ArrayView3<f64>,
    header: Option<&Header>,
    request: &SubimageRequest,
) -> Result<Subimage> {
    let (nz, ny, nx) = cube.dim();

    let (xcen, xwidth, ycen, ywidth) = match request.units {
        CoordUnits::Pixels => (request.xcen, request.xwidth, request.ycen, request.ywidth),
        CoordUnits::World => {
            let header = require_header(header, "world-unit spatial crop")?;
            let wcs = Wcs::from_header(header)?;
            let mut world = vec![0.0; wcs.naxis()];
            world[0] = request.xcen;
            world[1] = request.ycen;
            if let Some(crval3) = header.get_f64("CRVAL3").filter(|_| wcs.naxis() > 2) {
                world[2] = crval3;
            }
            let pixel = wcs.world2pix(&world)?;
            let cdelt1 = header.require_f64("CDELT1")?.abs();
            let cdelt2 = header.require_f64("CDELT2")?.abs();
            (pixel[0], request.xwidth / cdelt1, pixel[1], request.ywidth / cdelt2)
        }
    };

    let (xlo, xhi) = crop_range(xcen, xwidth, nx, "x")?;
    let (ylo, yhi) = crop_range(ycen, ywidth, ny, "y")?;

    let (zlo, zhi) = match (request.vrange, request.zunits) {
        (None, _) => (0, nz),
        (Some((z0, z1)), CoordUnits::Pixels) => spectral_range(z0, z1, nz)?,
        (Some((v0, v1)), CoordUnits::World) => {
            let header = require_header(header, "world-unit spectral range")?;
            let crval = header.require_f64("CRVAL3")?;
            let cdelt = header.require_f64("CDELT3")?;
            let crpix = header.get_f64("CRPIX3").unwrap_or(1.0);
            let to_pix = |v: f64| (v - crval) / cdelt + crpix - 1.0;
            spectral_range(to_pix(v0), to_pix(v1), nz)?
        }
    };

    let region = cube.slice(ndarray::s![zlo..zhi, ylo..yhi, xlo..xhi]);
    let mut data = Array2::from_elem((yhi - ylo, xhi - xlo), f64::NAN);
    for ((y, x), out) in data.indexed_iter_mut() {
        let column: Vec<f64> = region.slice(ndarray::s![.., y, x]).to_vec();
        *out = match request.collapse {
            Collapse::Mean => nan_mean(&column),
            Collapse::Sum => {
                let finite: Vec<f64> = column.into_iter().filter(|v| !v.is_nan()).collect();
                if finite.is_empty() {
                    f64::NAN
                } else {
                    finite.iter().sum()
                }
            }
        };
    }

    let mut dv = None;
    if request.dvmult {
        let cdelt = require_header(header, "dvmult")?.require_f64("CDELT3")?.abs();
        data.mapv_inplace(|v| v * cdelt);
        dv = Some(cdelt);
    }

    let header = header.map(|h| {
        let mut out = h.clone();
        out.remove_axis(3);
        out.set("NAXIS", 2i64);
        out.set_naxis(1, xhi - xlo);
        out.set_naxis(2, yhi - ylo);
        if let Some(crpix1) = h.get_f64("CRPIX1") {
            out.set("CRPIX1", crpix1 - xlo as f64);
        }
        if let Some(crpix2) = h.get_f64("CRPIX2") {
            out.set("CRPIX2", crpix2 - ylo as f64);
        }
        if dv.is_some() {
            if let (Some(bunit), Some(cunit3)) = (h.get_str("BUNIT"), h.get_str("CUNIT3")) {
                out.set("BUNIT", format!("{bunit} {cunit3}"));
            }
        }
        out.add_history(format!(
            "cropped to x[{xlo}:{xhi}] y[{ylo}:{yhi}], collapsed z[{zlo}:{zhi}] ({:?})",
            request.collapse
        ));
        out
    });

    Ok(Subimage {
        data,
        header,
        bounds: CropBounds {
            xlo,
            xhi,
            ylo,
            yhi,
            zlo,
            zhi,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{make_test_cube, TestCubeConfig};
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn test_crop_range_rounding() {
        assert_eq!(crop_range(4.5, 2.5, 9, "x").unwrap(), (2, 7));
        assert_eq!(crop_range(1.0, 5.0, 9, "x").unwrap(), (0, 6));
        assert_eq!(crop_range(8.0, 5.0, 9, "x").unwrap(), (3, 9));
        assert!(matches!(crop_range(20.0, 1.0, 9, "x"), Err(CubeError::Bounds(_))));
        assert!(matches!(crop_range(1.0, -1.0, 9, "x"), Err(CubeError::InvalidConfig(_))));
    }

    #[test]
    fn test_reference_pixels_shift_by_crop_offset() {
        let test_cube = make_test_cube(&TestCubeConfig::default().with_shape((100, 9, 9))).unwrap();
        let request = SubimageRequest::new(4.5, 2.5, 4.5, 2.5).with_vrange(0.0, 99.0, CoordUnits::Pixels);
        let cut = subimage_integ(test_cube.cube.view(), Some(&test_cube.header), &request).unwrap();
        let header = cut.header.unwrap();

        assert_eq!(header.get_f64("CRPIX1"), Some(7.0));
        assert_eq!(header.get_f64("CRPIX2"), Some(-2.0));
        assert_eq!(header.get_i64("NAXIS"), Some(2));
        assert!(!header.contains("CRVAL3"));
        assert_eq!(cut.data.dim(), (5, 5));
        assert_eq!(cut.bounds.zhi, 99);
    }

    #[test]
    fn test_mean_and_sum_collapse() {
        let cube = Array3::from_shape_fn((4, 2, 2), |(z, _, _)| z as f64);
        let request = SubimageRequest::new(1.0, 1.0, 1.0, 1.0);

        let mean = subimage_integ(cube.view(), None, &request).unwrap();
        assert_abs_diff_eq!(mean.data[[0, 0]], 1.5);
        assert!(mean.header.is_none());

        let sum = subimage_integ(cube.view(), None, &request.clone().with_collapse(Collapse::Sum, false))
            .unwrap();
        assert_abs_diff_eq!(sum.data[[1, 1]], 6.0);
    }

    #[test]
    fn test_dvmult_scales_by_channel_width() {
        let test_cube = make_test_cube(&TestCubeConfig::default()).unwrap();
        let request = SubimageRequest::new(4.0, 1.0, 4.0, 1.0).with_collapse(Collapse::Sum, true);
        let plain = subimage_integ(
            test_cube.cube.view(),
            Some(&test_cube.header),
            &request.clone().with_collapse(Collapse::Sum, false),
        )
        .unwrap();
        let integrated = subimage_integ(test_cube.cube.view(), Some(&test_cube.header), &request).unwrap();

        assert_abs_diff_eq!(integrated.data[[0, 0]], plain.data[[0, 0]] * 0.1, epsilon = 1e-12);
        assert_eq!(
            integrated.header.unwrap().get_str("BUNIT"),
            Some("K km s-1")
        );
    }

    #[test]
    fn test_world_units_without_header_rejected() {
        let cube = Array3::<f64>::zeros((4, 2, 2));
        let request = SubimageRequest::new(0.0, 1.0, 0.0, 1.0).with_units(CoordUnits::World);
        assert!(matches!(
            subimage_integ(cube.view(), None, &request),
            Err(CubeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_world_spectral_range() {
        let test_cube = make_test_cube(&TestCubeConfig::default()).unwrap();
        // CRVAL3 = 5 at 0-based pixel 4, CDELT3 = -0.1
        let request = SubimageRequest::new(4.0, 1.0, 4.0, 1.0).with_vrange(5.0, 4.0, CoordUnits::World);
        let cut = subimage_integ(test_cube.cube.view(), Some(&test_cube.header), &request).unwrap();
        assert_eq!((cut.bounds.zlo, cut.bounds.zhi), (4, 14));
    }
}
