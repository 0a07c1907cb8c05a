//! Spectral units and Doppler velocity conventions
//!
//! Velocity and frequency axes convert into each other only through a rest
//! frequency and a velocity convention:
//!
//! - **Radio**: `v = c (1 - f/f₀)`
//! - **Optical**: `v = c (f₀/f - 1)`
//! - **Relativistic**: `v = c (f₀² - f²) / (f₀² + f²)`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uom::si::f64::{Frequency, Velocity};
use uom::si::frequency::{gigahertz, hertz, kilohertz, megahertz};
use uom::si::velocity::{kilometer_per_second, meter_per_second};

use crate::error::{CubeError, Result};

/// Speed of light in m/s
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Physical kind of a spectral unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectralKind {
    Pixel,
    Velocity,
    Frequency,
}

/// A physical spectral coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpectralQuantity {
    Velocity(Velocity),
    Frequency(Frequency),
}

/// Units a spectral axis can be expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectralUnit {
    Pixel,
    MetersPerSecond,
    KilometersPerSecond,
    Hertz,
    Kilohertz,
    Megahertz,
    Gigahertz,
}

impl SpectralUnit {
    pub fn kind(self) -> SpectralKind {
        match self {
            SpectralUnit::Pixel => SpectralKind::Pixel,
            SpectralUnit::MetersPerSecond | SpectralUnit::KilometersPerSecond => {
                SpectralKind::Velocity
            }
            _ => SpectralKind::Frequency,
        }
    }

    /// `value` in this unit as a physical quantity; `None` for pixels.
    pub fn quantity(self, value: f64) -> Option<SpectralQuantity> {
        use SpectralQuantity::{Frequency as F, Velocity as V};
        match self {
            SpectralUnit::Pixel => None,
            SpectralUnit::MetersPerSecond => Some(V(Velocity::new::<meter_per_second>(value))),
            SpectralUnit::KilometersPerSecond => {
                Some(V(Velocity::new::<kilometer_per_second>(value)))
            }
            SpectralUnit::Hertz => Some(F(Frequency::new::<hertz>(value))),
            SpectralUnit::Kilohertz => Some(F(Frequency::new::<kilohertz>(value))),
            SpectralUnit::Megahertz => Some(F(Frequency::new::<megahertz>(value))),
            SpectralUnit::Gigahertz => Some(F(Frequency::new::<gigahertz>(value))),
        }
    }

    /// Numeric value of `quantity` in this unit; `None` when the kinds differ.
    pub fn value_of(self, quantity: SpectralQuantity) -> Option<f64> {
        match (self, quantity) {
            (SpectralUnit::MetersPerSecond, SpectralQuantity::Velocity(v)) => {
                Some(v.get::<meter_per_second>())
            }
            (SpectralUnit::KilometersPerSecond, SpectralQuantity::Velocity(v)) => {
                Some(v.get::<kilometer_per_second>())
            }
            (SpectralUnit::Hertz, SpectralQuantity::Frequency(f)) => Some(f.get::<hertz>()),
            (SpectralUnit::Kilohertz, SpectralQuantity::Frequency(f)) => Some(f.get::<kilohertz>()),
            (SpectralUnit::Megahertz, SpectralQuantity::Frequency(f)) => Some(f.get::<megahertz>()),
            (SpectralUnit::Gigahertz, SpectralQuantity::Frequency(f)) => Some(f.get::<gigahertz>()),
            _ => None,
        }
    }

    /// Spelling used for `CUNITn` keywords
    pub fn fits_name(self) -> &'static str {
        match self {
            SpectralUnit::Pixel => "pixel",
            SpectralUnit::MetersPerSecond => "m s-1",
            SpectralUnit::KilometersPerSecond => "km s-1",
            SpectralUnit::Hertz => "Hz",
            SpectralUnit::Kilohertz => "kHz",
            SpectralUnit::Megahertz => "MHz",
            SpectralUnit::Gigahertz => "GHz",
        }
    }
}

impl fmt::Display for SpectralUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.fits_name())
    }
}

impl FromStr for SpectralUnit {
    type Err = CubeError;

    /// Case-insensitive; whitespace and `.` separators are ignored.
    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '.')
            .flat_map(char::to_lowercase)
            .collect();

        match compact.as_str() {
            "pix" | "pixel" | "pixels" => Ok(SpectralUnit::Pixel),
            "m/s" | "ms-1" | "ms^-1" => Ok(SpectralUnit::MetersPerSecond),
            "km/s" | "kms-1" | "kms^-1" => Ok(SpectralUnit::KilometersPerSecond),
            "hz" => Ok(SpectralUnit::Hertz),
            "khz" => Ok(SpectralUnit::Kilohertz),
            "mhz" => Ok(SpectralUnit::Megahertz),
            "ghz" => Ok(SpectralUnit::Gigahertz),
            _ => Err(CubeError::Units(format!("unrecognised spectral unit '{s}'"))),
        }
    }
}

/// Doppler convention relating velocity and frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VelocityConvention {
    Radio,
    Optical,
    Relativistic,
}

impl VelocityConvention {
    /// Convention implied by a spectral `CTYPE` (`VRAD`, `VOPT`, `VELO`)
    pub fn from_ctype(ctype: &str) -> Option<Self> {
        let code = ctype.trim().to_ascii_uppercase();
        if code.starts_with("VRAD") {
            Some(VelocityConvention::Radio)
        } else if code.starts_with("VOPT") {
            Some(VelocityConvention::Optical)
        } else if code.starts_with("VELO") {
            Some(VelocityConvention::Relativistic)
        } else {
            None
        }
    }

    /// Spectral `CTYPE` for a velocity axis in this convention
    pub fn ctype(self) -> &'static str {
        match self {
            VelocityConvention::Radio => "VRAD",
            VelocityConvention::Optical => "VOPT",
            VelocityConvention::Relativistic => "VELO",
        }
    }

    pub fn velocity_to_frequency(self, v: Velocity, rest: Frequency) -> Frequency {
        let beta = v.get::<meter_per_second>() / SPEED_OF_LIGHT;
        let f0 = rest.get::<hertz>();
        let f = match self {
            VelocityConvention::Radio => f0 * (1.0 - beta),
            VelocityConvention::Optical => f0 / (1.0 + beta),
            VelocityConvention::Relativistic => f0 * ((1.0 - beta) / (1.0 + beta)).sqrt(),
        };
        Frequency::new::<hertz>(f)
    }

    pub fn frequency_to_velocity(self, f: Frequency, rest: Frequency) -> Velocity {
        let (f, f0) = (f.get::<hertz>(), rest.get::<hertz>());
        let v = match self {
            VelocityConvention::Radio => SPEED_OF_LIGHT * (1.0 - f / f0),
            VelocityConvention::Optical => SPEED_OF_LIGHT * (f0 / f - 1.0),
            VelocityConvention::Relativistic => {
                SPEED_OF_LIGHT * (f0 * f0 - f * f) / (f0 * f0 + f * f)
            }
        };
        Velocity::new::<meter_per_second>(v)
    }
}

impl FromStr for VelocityConvention {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radio" => Ok(VelocityConvention::Radio),
            "optical" => Ok(VelocityConvention::Optical),
            "relativistic" => Ok(VelocityConvention::Relativistic),
            _ => Err(CubeError::Units(format!(
                "unknown velocity convention '{s}'"
            ))),
        }
    }
}

/// Convert a spectral value between units.
///
/// # Arguments
/// * `value` - Value expressed in `from`
/// * `from` - Source unit
/// * `to` - Target unit
/// * `convention` - Doppler convention, required across velocity/frequency
/// * `rest_frequency_hz` - Rest frequency, required across velocity/frequency
///
/// # Returns
/// * `Ok(f64)` - Converted value
/// * `Err(CubeError::Units)` - Pixel units mixed with physical ones, or a
///   missing convention/rest frequency for a Doppler conversion
pub fn convert_spectral(
    value: f64,
    from: SpectralUnit,
    to: SpectralUnit,
    convention: Option<VelocityConvention>,
    rest_frequency_hz: Option<f64>,
) -> Result<f64> {
    if from == to {
        return Ok(value);
    }
    let incompatible = || CubeError::Units(format!("cannot convert between {from} and {to}"));

    let quantity = from.quantity(value).ok_or_else(incompatible)?;
    let converted = match (quantity, to.kind()) {
        (SpectralQuantity::Velocity(_), SpectralKind::Velocity)
        | (SpectralQuantity::Frequency(_), SpectralKind::Frequency) => quantity,
        (SpectralQuantity::Velocity(_), SpectralKind::Frequency)
        | (SpectralQuantity::Frequency(_), SpectralKind::Velocity) => {
            let convention = convention.ok_or_else(|| {
                CubeError::Units(format!(
                    "converting {from} to {to} needs a velocity convention"
                ))
            })?;
            let rest = rest_frequency_hz
                .map(Frequency::new::<hertz>)
                .ok_or_else(|| {
                    CubeError::Units(format!("converting {from} to {to} needs a rest frequency"))
                })?;
            match quantity {
                SpectralQuantity::Velocity(v) => {
                    SpectralQuantity::Frequency(convention.velocity_to_frequency(v, rest))
                }
                SpectralQuantity::Frequency(f) => {
                    SpectralQuantity::Velocity(convention.frequency_to_velocity(f, rest))
                }
            }
        }
        (_, SpectralKind::Pixel) => return Err(incompatible()),
    };

    to.value_of(converted).ok_or_else(incompatible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_fits_and_astropy_spellings() {
        assert_eq!(
            "km s-1".parse::<SpectralUnit>().unwrap(),
            SpectralUnit::KilometersPerSecond
        );
        assert_eq!(
            "km/s".parse::<SpectralUnit>().unwrap(),
            SpectralUnit::KilometersPerSecond
        );
        assert_eq!("m.s-1".parse::<SpectralUnit>().unwrap(), SpectralUnit::MetersPerSecond);
        assert_eq!("GHz".parse::<SpectralUnit>().unwrap(), SpectralUnit::Gigahertz);
        assert!("furlong/fortnight".parse::<SpectralUnit>().is_err());
    }

    #[test]
    fn test_parse_ignores_case() {
        assert_eq!("KM S-1".parse::<SpectralUnit>().unwrap(), SpectralUnit::KilometersPerSecond);
        assert_eq!("mhz".parse::<SpectralUnit>().unwrap(), SpectralUnit::Megahertz);
        assert_eq!("Km/S".parse::<SpectralUnit>().unwrap(), SpectralUnit::KilometersPerSecond);
        assert_eq!("PIXEL".parse::<SpectralUnit>().unwrap(), SpectralUnit::Pixel);
    }

    #[test]
    fn test_quantities_carry_their_dimension() {
        let q = SpectralUnit::Megahertz.quantity(2.5).unwrap();
        assert_relative_eq!(SpectralUnit::Kilohertz.value_of(q).unwrap(), 2500.0);
        assert_eq!(SpectralUnit::KilometersPerSecond.value_of(q), None);
        assert!(SpectralUnit::Pixel.quantity(1.0).is_none());
    }

    #[test]
    fn test_same_kind_scaling() {
        let v = convert_spectral(
            1.5,
            SpectralUnit::KilometersPerSecond,
            SpectralUnit::MetersPerSecond,
            None,
            None,
        )
        .unwrap();
        assert_relative_eq!(v, 1500.0);
    }

    #[test]
    fn test_radio_convention_roundtrip() {
        let f0 = 93.1737e9;
        let f = convert_spectral(
            10.0,
            SpectralUnit::KilometersPerSecond,
            SpectralUnit::Gigahertz,
            Some(VelocityConvention::Radio),
            Some(f0),
        )
        .unwrap();
        assert_relative_eq!(f, 93.1737 * (1.0 - 1e4 / SPEED_OF_LIGHT), epsilon = 1e-12);

        let v = convert_spectral(
            f,
            SpectralUnit::Gigahertz,
            SpectralUnit::KilometersPerSecond,
            Some(VelocityConvention::Radio),
            Some(f0),
        )
        .unwrap();
        assert_relative_eq!(v, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_doppler_needs_convention_and_rest_frequency() {
        let missing_convention = convert_spectral(
            1.0,
            SpectralUnit::KilometersPerSecond,
            SpectralUnit::Hertz,
            None,
            Some(1e9),
        );
        assert!(matches!(missing_convention, Err(CubeError::Units(_))));

        let missing_rest = convert_spectral(
            1.0,
            SpectralUnit::KilometersPerSecond,
            SpectralUnit::Hertz,
            Some(VelocityConvention::Optical),
            None,
        );
        assert!(matches!(missing_rest, Err(CubeError::Units(_))));
    }

    #[test]
    fn test_pixels_do_not_convert() {
        let result = convert_spectral(
            3.0,
            SpectralUnit::Pixel,
            SpectralUnit::KilometersPerSecond,
            None,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_convention_from_ctype() {
        assert_eq!(
            VelocityConvention::from_ctype("VRAD"),
            Some(VelocityConvention::Radio)
        );
        assert_eq!(
            VelocityConvention::from_ctype("VELO-LSR"),
            Some(VelocityConvention::Relativistic)
        );
        assert_eq!(VelocityConvention::from_ctype("FREQ"), None);
        assert_eq!(
            "Radio".parse::<VelocityConvention>().unwrap(),
            VelocityConvention::Radio
        );
    }
}
