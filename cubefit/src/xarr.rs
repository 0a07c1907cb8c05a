//! Spectral axis ("xarr") of a cube or spectrum
//!
//! Values are derived once from the spectral WCS keywords at load time:
//! `x[i] = CRVAL3 + (i + 1 − CRPIX3)·CDELT3`. Changing the unit or the
//! velocity convention afterwards never rewrites a header on its own; call
//! [`SpectralAxis::write_to_header`] for that.

use ndarray::{concatenate, Array1, ArrayView1, Axis};
use std::ops::Range;

use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::units::{convert_spectral, SpectralKind, SpectralUnit, VelocityConvention};

#[derive(Debug, Clone, PartialEq)]
pub struct SpectralAxis {
    values: Array1<f64>,
    unit: SpectralUnit,
    convention: Option<VelocityConvention>,
    rest_frequency_hz: Option<f64>,
}

/// Unit implied by a spectral header when `CUNITn` is absent
fn default_unit(ctype: &str) -> SpectralUnit {
    let ctype = ctype.trim().to_ascii_uppercase();
    if ctype.starts_with("FREQ") {
        SpectralUnit::Hertz
    } else if ctype.starts_with('V') {
        SpectralUnit::MetersPerSecond
    } else {
        SpectralUnit::Pixel
    }
}

impl SpectralAxis {
    pub fn new(values: Array1<f64>, unit: SpectralUnit) -> Self {
        Self {
            values,
            unit,
            convention: None,
            rest_frequency_hz: None,
        }
    }

    /// Pixel-index axis `0, 1, …, len − 1`
    pub fn pixels(len: usize) -> Self {
        Self::new(Array1::range(0.0, len as f64, 1.0), SpectralUnit::Pixel)
    }

    pub fn with_convention(mut self, convention: VelocityConvention) -> Self {
        self.convention = Some(convention);
        self
    }

    pub fn with_rest_frequency(mut self, rest_frequency_hz: f64) -> Self {
        self.rest_frequency_hz = Some(rest_frequency_hz);
        self
    }

    /// Derive the axis described by header axis 3.
    pub fn from_header(header: &Header) -> Result<Self> {
        Self::from_header_axis(header, 3)
    }

    /// Derive the axis described by FITS axis `axis` (1-based).
    pub fn from_header_axis(header: &Header, axis: usize) -> Result<Self> {
        let len = header
            .naxis(axis)
            .ok_or_else(|| CubeError::MissingKeyword(format!("NAXIS{axis}")))?;
        let crval = header.require_f64(&format!("CRVAL{axis}"))?;
        let cdelt = header.require_f64(&format!("CDELT{axis}"))?;
        let crpix = header.get_f64(&format!("CRPIX{axis}")).unwrap_or(1.0);
        let ctype = header.get_str(&format!("CTYPE{axis}")).unwrap_or("");

        let unit = match header.get_str(&format!("CUNIT{axis}")) {
            Some(name) if !name.trim().is_empty() => name.parse()?,
            _ => default_unit(ctype),
        };

        let values = Array1::from_shape_fn(len, |i| crval + (i as f64 + 1.0 - crpix) * cdelt);

        Ok(Self {
            values,
            unit,
            convention: VelocityConvention::from_ctype(ctype),
            rest_frequency_hz: header
                .get_f64("RESTFRQ")
                .or_else(|| header.get_f64("RESTFREQ")),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn unit(&self) -> SpectralUnit {
        self.unit
    }

    pub fn velocity_convention(&self) -> Option<VelocityConvention> {
        self.convention
    }

    pub fn set_velocity_convention(&mut self, convention: VelocityConvention) {
        self.convention = Some(convention);
    }

    pub fn rest_frequency_hz(&self) -> Option<f64> {
        self.rest_frequency_hz
    }

    /// Channel spacing taken from the first two channels
    pub fn cdelt(&self) -> Option<f64> {
        (self.values.len() > 1).then(|| self.values[1] - self.values[0])
    }

    fn convert_value(&self, value: f64, from: SpectralUnit, to: SpectralUnit) -> Result<f64> {
        convert_spectral(value, from, to, self.convention, self.rest_frequency_hz)
    }

    /// Copy of this axis expressed in `unit`
    pub fn as_unit(&self, unit: SpectralUnit) -> Result<Self> {
        let mut converted = self.clone();
        converted.convert_to_unit(unit)?;
        Ok(converted)
    }

    /// Convert the axis values to `unit` in place.
    pub fn convert_to_unit(&mut self, unit: SpectralUnit) -> Result<()> {
        if unit == self.unit {
            return Ok(());
        }
        let mut converted = Array1::zeros(self.values.len());
        for (out, &v) in converted.iter_mut().zip(self.values.iter()) {
            *out = self.convert_value(v, self.unit, unit)?;
        }
        self.values = converted;
        self.unit = unit;
        Ok(())
    }

    /// Nearest channel to `value`.
    ///
    /// `unit = None` means `value` is already in this axis' unit. A value
    /// expressed in pixels is rounded and clipped to the axis.
    pub fn x_to_pix(&self, value: f64, unit: Option<SpectralUnit>) -> Result<usize> {
        if self.values.is_empty() {
            return Err(CubeError::Bounds("spectral axis is empty".to_string()));
        }
        let unit = unit.unwrap_or(self.unit);
        if unit == SpectralUnit::Pixel && self.unit != SpectralUnit::Pixel {
            let max = (self.values.len() - 1) as f64;
            return Ok(value.round().clamp(0.0, max) as usize);
        }

        let target = self.convert_value(value, unit, self.unit)?;
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
            .map(|(i, _)| i)
            .ok_or_else(|| CubeError::Bounds("spectral axis has no finite values".to_string()))
    }

    /// Channels `range` as a new axis
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            values: self.values.slice(ndarray::s![range]).to_owned(),
            ..self.clone()
        }
    }

    /// Write this axis into the WCS keywords of FITS axis `axis` (1-based).
    ///
    /// The reference pixel becomes the first channel: `CRPIXn = 1`,
    /// `CRVALn = x[0]`.
    pub fn write_to_header(&self, header: &mut Header, axis: usize) {
        header.set_naxis(axis, self.len());
        header.set(&format!("CRPIX{axis}"), 1.0);
        if let Some(&first) = self.values.first() {
            header.set(&format!("CRVAL{axis}"), first);
        }
        if let Some(cdelt) = self.cdelt() {
            header.set(&format!("CDELT{axis}"), cdelt);
        }
        header.set(&format!("CUNIT{axis}"), self.unit.fits_name());

        let ctype = match (self.unit.kind(), self.convention) {
            (SpectralKind::Velocity, Some(convention)) => Some(convention.ctype()),
            (SpectralKind::Frequency, _) => Some("FREQ"),
            _ => None,
        };
        if let Some(ctype) = ctype {
            header.set(&format!("CTYPE{axis}"), ctype);
        }
    }

    /// Join several axes end to end, expressed in the first axis' unit.
    pub fn concatenate(axes: &[&SpectralAxis]) -> Result<Self> {
        let first = axes
            .first()
            .ok_or_else(|| CubeError::InvalidConfig("no spectral axes to join".to_string()))?;

        let converted: Vec<Array1<f64>> = axes
            .iter()
            .map(|axis| axis.as_unit(first.unit).map(|a| a.values))
            .collect::<Result<_>>()?;
        let views: Vec<ArrayView1<f64>> = converted.iter().map(|v| v.view()).collect();
        let values = concatenate(Axis(0), &views)
            .map_err(|e| CubeError::ShapeMismatch(e.to_string()))?;

        Ok(Self {
            values,
            ..(*first).clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn velocity_header(nz: usize) -> Header {
        let mut header = Header::new();
        header.set("NAXIS", 3i64);
        header.set_naxis(3, nz);
        header.set("CTYPE3", "VRAD");
        header.set("CRVAL3", 5.0);
        header.set("CDELT3", -0.1);
        header.set("CRPIX3", 5.0);
        header.set("CUNIT3", "km s-1");
        header
    }

    #[test]
    fn test_values_follow_reference_pixel() {
        let axis = SpectralAxis::from_header(&velocity_header(100)).unwrap();
        assert_eq!(axis.len(), 100);
        assert_eq!(axis.unit(), SpectralUnit::KilometersPerSecond);
        assert_eq!(axis.velocity_convention(), Some(VelocityConvention::Radio));
        assert_abs_diff_eq!(axis.values()[4], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(axis.values()[0], 5.4, epsilon = 1e-12);
        assert_abs_diff_eq!(axis.cdelt().unwrap(), -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_x_to_pix_nearest_channel() {
        let axis = SpectralAxis::from_header(&velocity_header(100)).unwrap();
        assert_eq!(axis.x_to_pix(5.0, None).unwrap(), 4);
        assert_eq!(axis.x_to_pix(4.96, None).unwrap(), 4);
        assert_eq!(
            axis.x_to_pix(1000.0, Some(SpectralUnit::MetersPerSecond)).unwrap(),
            44
        );
        // far outside the axis clamps to the nearest end
        assert_eq!(axis.x_to_pix(-1e6, None).unwrap(), 99);
        assert_eq!(axis.x_to_pix(7.6, Some(SpectralUnit::Pixel)).unwrap(), 8);
    }

    #[test]
    fn test_missing_cunit_defaults_by_ctype() {
        let mut header = velocity_header(10);
        header.remove("CUNIT3");
        let axis = SpectralAxis::from_header(&header).unwrap();
        assert_eq!(axis.unit(), SpectralUnit::MetersPerSecond);
    }

    #[test]
    fn test_write_to_header_rebases_reference_pixel() {
        let axis = SpectralAxis::from_header(&velocity_header(100)).unwrap();
        let sliced = axis.slice(10..20);

        let mut header = velocity_header(100);
        sliced.write_to_header(&mut header, 3);
        assert_eq!(header.naxis(3), Some(10));
        assert_eq!(header.get_f64("CRPIX3"), Some(1.0));
        assert_abs_diff_eq!(header.get_f64("CRVAL3").unwrap(), sliced.values()[0]);

        let reread = SpectralAxis::from_header(&header).unwrap();
        for (a, b) in reread.values().iter().zip(sliced.values().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_concatenate_converts_units() {
        let kms = SpectralAxis::new(Array1::from(vec![1.0, 2.0]), SpectralUnit::KilometersPerSecond);
        let ms = SpectralAxis::new(Array1::from(vec![3000.0]), SpectralUnit::MetersPerSecond);
        let joined = SpectralAxis::concatenate(&[&kms, &ms]).unwrap();
        assert_eq!(joined.unit(), SpectralUnit::KilometersPerSecond);
        assert_eq!(joined.values().to_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_frequency_conversion_needs_rest_frequency() {
        let axis = SpectralAxis::from_header(&velocity_header(5)).unwrap();
        assert!(axis.as_unit(SpectralUnit::Gigahertz).is_err());

        let axis = axis.with_rest_frequency(100e9);
        let ghz = axis.as_unit(SpectralUnit::Gigahertz).unwrap();
        assert!(ghz.values()[0] < 100.0);
        let back = ghz.as_unit(SpectralUnit::KilometersPerSecond).unwrap();
        assert_abs_diff_eq!(back.values()[2], axis.values()[2], epsilon = 1e-9);
    }
}
