//! Pixel ↔ world coordinate transforms for cube headers
//!
//! Non-celestial axes (the spectral axis in particular) are linear and
//! handled here. A longitude/latitude pair is handed to `mapproj`, using
//! one of
//!
//! - **GLS / SFL**: global sinusoidal ([`Sfl`])
//! - **TAN**: gnomonic ([`Tan`])
//! - **CAR** or no projection code: plate carrée ([`Car`])
//!
//! Pixel coordinates are 0-based; FITS `CRPIXn` values and `mapproj` image
//! coordinates are 1-based.

use mapproj::{
    cylindrical::car::Car, img2celestial::Img2Celestial, img2proj::WcsImgXY2ProjXY,
    pseudocyl::sfl::Sfl, zenithal::tan::Tan, CanonicalProjection, CenteredProjection, ImgXY,
    LonLat,
};

use crate::error::{CubeError, Result};
use crate::header::Header;

/// Per-axis linear WCS description
#[derive(Debug, Clone, PartialEq)]
pub struct AxisWcs {
    pub ctype: String,
    pub crval: f64,
    pub cdelt: f64,
    pub crpix: f64,
    pub cunit: String,
}

impl AxisWcs {
    fn world(&self, p: f64) -> f64 {
        self.crval + self.cdelt * (p + 1.0 - self.crpix)
    }

    fn pixel(&self, w: f64) -> f64 {
        (w - self.crval) / self.cdelt + self.crpix - 1.0
    }
}

/// Celestial projection of a longitude/latitude axis pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    PlateCarree,
    Sinusoidal,
    Gnomonic,
}

impl Projection {
    fn from_code(code: &str) -> Result<Self> {
        match code.trim_start_matches('-').trim() {
            "" | "CAR" => Ok(Projection::PlateCarree),
            "GLS" | "SFL" => Ok(Projection::Sinusoidal),
            "TAN" => Ok(Projection::Gnomonic),
            other => Err(CubeError::Wcs(format!("unsupported projection '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CelestialPair {
    lon: usize,
    lat: usize,
    projection: Projection,
    /// `CROTAn` of the latitude axis, degrees
    crota: f64,
}

/// World coordinate system built from a header
#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    axes: Vec<AxisWcs>,
    celestial: Option<CelestialPair>,
}

fn is_longitude(ctype: &str) -> bool {
    ctype.starts_with("RA--") || ctype.starts_with("GLON") || ctype.starts_with("ELON")
}

fn is_latitude(ctype: &str) -> bool {
    ctype.starts_with("DEC-") || ctype.starts_with("GLAT") || ctype.starts_with("ELAT")
}

fn projection_code(ctype: &str) -> &str {
    ctype.get(4..).unwrap_or("")
}

/// Image ↔ sky transform with the projection centred on `center`
fn celestial<P: CanonicalProjection>(
    proj: P,
    img2proj: WcsImgXY2ProjXY,
    center: &LonLat,
) -> Img2Celestial<P, WcsImgXY2ProjXY> {
    let mut centered = CenteredProjection::new(proj);
    centered.set_proj_center_from_lonlat(center);
    Img2Celestial::new(img2proj, centered)
}

fn unproject<P: CanonicalProjection>(
    proj: P,
    img2proj: WcsImgXY2ProjXY,
    center: &LonLat,
    img: &ImgXY,
) -> Option<LonLat> {
    celestial(proj, img2proj, center).img2lonlat(img)
}

fn project<P: CanonicalProjection>(
    proj: P,
    img2proj: WcsImgXY2ProjXY,
    center: &LonLat,
    lonlat: &LonLat,
) -> Option<ImgXY> {
    celestial(proj, img2proj, center).lonlat2img(lonlat)
}

impl Wcs {
    /// Build the WCS from `NAXIS` (or `WCSAXES`) and the per-axis keywords.
    ///
    /// Missing keywords take the FITS defaults: `CRVAL = 0`, `CDELT = 1`
    /// (or the diagonal `CDi_i`), `CRPIX = 0`.
    pub fn from_header(header: &Header) -> Result<Self> {
        let naxis = header
            .get_i64("WCSAXES")
            .or_else(|| header.get_i64("NAXIS"))
            .ok_or_else(|| CubeError::MissingKeyword("NAXIS".to_string()))?;
        if naxis < 1 {
            return Err(CubeError::Wcs(format!("NAXIS = {naxis} has no axes")));
        }

        let axes: Vec<AxisWcs> = (1..=naxis as usize)
            .map(|i| AxisWcs {
                ctype: header
                    .get_str(&format!("CTYPE{i}"))
                    .unwrap_or("")
                    .trim()
                    .to_ascii_uppercase(),
                crval: header.get_f64(&format!("CRVAL{i}")).unwrap_or(0.0),
                cdelt: header
                    .get_f64(&format!("CDELT{i}"))
                    .or_else(|| header.get_f64(&format!("CD{i}_{i}")))
                    .unwrap_or(1.0),
                crpix: header.get_f64(&format!("CRPIX{i}")).unwrap_or(0.0),
                cunit: header
                    .get_str(&format!("CUNIT{i}"))
                    .unwrap_or("")
                    .trim()
                    .to_string(),
            })
            .collect();

        if let Some(axis) = axes.iter().position(|a| a.cdelt == 0.0) {
            return Err(CubeError::Wcs(format!("CDELT{} is zero", axis + 1)));
        }

        let lon = axes.iter().position(|a| is_longitude(&a.ctype));
        let lat = axes.iter().position(|a| is_latitude(&a.ctype));
        let celestial = match (lon, lat) {
            (Some(lon), Some(lat)) => {
                let lon_code = projection_code(&axes[lon].ctype).trim_start_matches('-');
                let lat_code = projection_code(&axes[lat].ctype).trim_start_matches('-');
                if lon_code != lat_code {
                    return Err(CubeError::Wcs(format!(
                        "mismatched projections '{lon_code}' and '{lat_code}'"
                    )));
                }
                Some(CelestialPair {
                    lon,
                    lat,
                    projection: Projection::from_code(lon_code)?,
                    crota: header.get_f64(&format!("CROTA{}", lat + 1)).unwrap_or(0.0),
                })
            }
            (None, None) => None,
            _ => {
                return Err(CubeError::Wcs(
                    "celestial axes must come in longitude/latitude pairs".to_string(),
                ))
            }
        };

        Ok(Self { axes, celestial })
    }

    pub fn naxis(&self) -> usize {
        self.axes.len()
    }

    pub fn axis(&self, index: usize) -> Option<&AxisWcs> {
        self.axes.get(index)
    }

    pub fn projection(&self) -> Option<Projection> {
        self.celestial.map(|c| c.projection)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.axes.len() {
            return Err(CubeError::Wcs(format!(
                "expected {} coordinates, got {}",
                self.axes.len(),
                len
            )));
        }
        Ok(())
    }

    fn img2proj(&self, pair: &CelestialPair) -> WcsImgXY2ProjXY {
        let (lon, lat) = (&self.axes[pair.lon], &self.axes[pair.lat]);
        WcsImgXY2ProjXY::from_cr(lon.crpix, lat.crpix, pair.crota, lon.cdelt, lat.cdelt)
    }

    fn center(&self, pair: &CelestialPair) -> LonLat {
        LonLat::new(
            self.axes[pair.lon].crval.to_radians(),
            self.axes[pair.lat].crval.to_radians(),
        )
    }

    /// Convert 0-based pixel coordinates to world coordinates (degrees on
    /// the sky).
    pub fn pix2world(&self, pixel: &[f64]) -> Result<Vec<f64>> {
        self.check_len(pixel.len())?;

        let mut world: Vec<f64> = self
            .axes
            .iter()
            .zip(pixel)
            .map(|(axis, &p)| axis.world(p))
            .collect();

        if let Some(pair) = &self.celestial {
            let img = ImgXY::new(pixel[pair.lon] + 1.0, pixel[pair.lat] + 1.0);
            let (img2proj, center) = (self.img2proj(pair), self.center(pair));
            let lonlat = match pair.projection {
                Projection::PlateCarree => unproject(Car::new(), img2proj, &center, &img),
                Projection::Sinusoidal => unproject(Sfl::new(), img2proj, &center, &img),
                Projection::Gnomonic => unproject(Tan::new(), img2proj, &center, &img),
            }
            .ok_or_else(|| {
                CubeError::Wcs(format!(
                    "pixel ({}, {}) has no sky position",
                    pixel[pair.lon], pixel[pair.lat]
                ))
            })?;
            world[pair.lon] = lonlat.lon().to_degrees().rem_euclid(360.0);
            world[pair.lat] = lonlat.lat().to_degrees();
        }

        Ok(world)
    }

    /// Convert world coordinates to 0-based pixel coordinates.
    pub fn world2pix(&self, world: &[f64]) -> Result<Vec<f64>> {
        self.check_len(world.len())?;

        let mut pixel: Vec<f64> = self
            .axes
            .iter()
            .zip(world)
            .map(|(axis, &w)| axis.pixel(w))
            .collect();

        if let Some(pair) = &self.celestial {
            let (lon, lat) = (world[pair.lon], world[pair.lat]);
            let lonlat = LonLat::new(lon.to_radians(), lat.to_radians());
            let (img2proj, center) = (self.img2proj(pair), self.center(pair));
            let img = match pair.projection {
                Projection::PlateCarree => project(Car::new(), img2proj, &center, &lonlat),
                Projection::Sinusoidal => project(Sfl::new(), img2proj, &center, &lonlat),
                Projection::Gnomonic => project(Tan::new(), img2proj, &center, &lonlat),
            }
            .ok_or_else(|| {
                CubeError::Wcs(format!("({lon}, {lat}) lies outside the projection"))
            })?;
            pixel[pair.lon] = img.x() - 1.0;
            pixel[pair.lat] = img.y() - 1.0;
        }

        Ok(pixel)
    }
}
