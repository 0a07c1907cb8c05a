//! FITS reading and writing of cubes and maps
//!
//! Arrays live in the primary HDU as 64-bit floats. ndarray axis order is
//! the reverse of FITS axis order, so a cube indexed `[z, y, x]` has
//! `NAXIS1 = nx`, `NAXIS2 = ny`, `NAXIS3 = nz`, and no flipping is applied
//! (pixel indices must keep matching the WCS).
//!
//! Only the keywords this crate knows about are persisted: the per-axis WCS
//! set, beam and unit keywords, the synthetic-cube ground truth and the
//! fit-parameter bookkeeping. `HISTORY`/`COMMENT` text stays in memory.
//!
//! Keywords are written with the types their readers expect. A logical
//! ([`HeaderValue::Bool`]) stored under a persisted key is written as the
//! integer 1 or 0 and reads back as [`HeaderValue::Int`]; none of the
//! persisted keywords is logical.

use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::headers::ReadsKey;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{ArrayD, ArrayView, Array3, Dimension, IxDyn, Ix3};
use std::path::Path;

use crate::error::{CubeError, Result};
use crate::header::{Header, HeaderValue};

const FLOAT_KEYS: [&str; 7] = ["BMAJ", "BMIN", "BPA", "EQUINOX", "RESTFRQ", "SIGMA", "RMSLVL"];
const INT_KEYS: [&str; 2] = ["SEED", "NPARS"];
const STRING_KEYS: [&str; 4] = ["BUNIT", "SPECSYS", "OBJECT", "FITTYPE"];
const AXIS_FLOAT_PREFIXES: [&str; 3] = ["CDELT", "CRVAL", "CRPIX"];
const AXIS_STRING_PREFIXES: [&str; 2] = ["CTYPE", "CUNIT"];

/// `PREFIXn` with a non-empty numeric suffix
fn has_indexed_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether `key` survives a round trip through a FITS file
pub fn is_persisted(key: &str) -> bool {
    FLOAT_KEYS.contains(&key)
        || INT_KEYS.contains(&key)
        || STRING_KEYS.contains(&key)
        || AXIS_FLOAT_PREFIXES
            .iter()
            .chain(AXIS_STRING_PREFIXES.iter())
            .chain(std::iter::once(&"PLANE"))
            .any(|prefix| has_indexed_prefix(key, prefix))
}

fn read_optional<T: ReadsKey>(hdu: &FitsHdu, fptr: &mut FitsFile, key: &str) -> Option<T> {
    hdu.read_key(fptr, key).ok()
}

/// Read the primary image of `path` and its persisted keywords.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<(ArrayD<f64>, Header)> {
    let path = path.as_ref();
    let mut fptr = FitsFile::open(path)?;
    let hdu = fptr.primary_hdu()?;

    let shape = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } if !shape.is_empty() => shape.clone(),
        _ => {
            return Err(CubeError::ShapeMismatch(format!(
                "{} has no primary image",
                path.display()
            )))
        }
    };

    let pixels: Vec<f64> = hdu.read_image(&mut fptr)?;
    let data = ArrayD::from_shape_vec(IxDyn(&shape), pixels)
        .map_err(|e| CubeError::ShapeMismatch(format!("{}: {e}", path.display())))?;

    let mut header = Header::new();
    header.set("NAXIS", shape.len());
    for (axis, len) in shape.iter().rev().enumerate() {
        header.set_naxis(axis + 1, *len);
    }

    for axis in 1..=shape.len() {
        for prefix in AXIS_STRING_PREFIXES {
            let key = format!("{prefix}{axis}");
            if let Some(value) = read_optional::<String>(&hdu, &mut fptr, &key) {
                header.set(&key, value);
            }
        }
        for prefix in AXIS_FLOAT_PREFIXES {
            let key = format!("{prefix}{axis}");
            if let Some(value) = read_optional::<f64>(&hdu, &mut fptr, &key) {
                header.set(&key, value);
            }
        }
    }
    for key in FLOAT_KEYS {
        if let Some(value) = read_optional::<f64>(&hdu, &mut fptr, key) {
            header.set(key, value);
        }
    }
    for key in INT_KEYS {
        if let Some(value) = read_optional::<i64>(&hdu, &mut fptr, key) {
            header.set(key, value);
        }
    }
    for key in STRING_KEYS {
        if let Some(value) = read_optional::<String>(&hdu, &mut fptr, key) {
            header.set(key, value);
        }
    }
    for plane in 1..=shape[0] {
        let key = format!("PLANE{plane}");
        match read_optional::<String>(&hdu, &mut fptr, &key) {
            Some(value) => header.set(&key, value),
            None => break,
        }
    }

    log::debug!("read {:?} image from {}", shape, path.display());
    Ok((data, header))
}

/// Read a 3D cube `[z, y, x]` from `path`.
pub fn read_cube<P: AsRef<Path>>(path: P) -> Result<(Array3<f64>, Header)> {
    let (data, header) = read_image(path)?;
    let cube = data
        .into_dimensionality::<Ix3>()
        .map_err(|e| CubeError::ShapeMismatch(format!("expected a 3D cube: {e}")))?;
    Ok((cube, header))
}

/// Write `array` and the persisted keywords of `header` to `path`.
///
/// `NAXISn` is taken from the array itself.
pub fn write_image<P, D>(path: P, array: ArrayView<f64, D>, header: &Header, overwrite: bool) -> Result<()>
where
    P: AsRef<Path>,
    D: Dimension,
{
    let path = path.as_ref();
    let dimensions = array.shape().to_vec();
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &dimensions,
    };

    let builder = FitsFile::create(path).with_custom_primary(&description);
    let mut fptr = if overwrite {
        builder.overwrite().open()?
    } else {
        builder.open()?
    };
    let hdu = fptr.primary_hdu()?;

    let pixels: Vec<f64> = array.iter().copied().collect();
    hdu.write_image(&mut fptr, &pixels)?;

    for card in header.cards().filter(|c| is_persisted(&c.key)) {
        match &card.value {
            HeaderValue::Int(v) => hdu.write_key(&mut fptr, &card.key, *v)?,
            HeaderValue::Float(v) => hdu.write_key(&mut fptr, &card.key, *v)?,
            HeaderValue::Str(v) => hdu.write_key(&mut fptr, &card.key, v.as_str())?,
            // coerced to 1/0, see the module docs
            HeaderValue::Bool(v) => hdu.write_key(&mut fptr, &card.key, i64::from(*v))?,
        }
    }

    log::debug!("wrote {:?} image to {}", dimensions, path.display());
    Ok(())
}

/// Write a 3D cube `[z, y, x]` to `path`.
pub fn write_cube<P: AsRef<Path>>(
    path: P,
    cube: ArrayView<f64, Ix3>,
    header: &Header,
    overwrite: bool,
) -> Result<()> {
    write_image(path, cube, header, overwrite)
}
