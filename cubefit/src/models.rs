//! Line profile models
//!
//! A [`SpectralModel`] describes one line component. Fits with several
//! components pass a parameter vector holding `k · npars` values; the
//! components are evaluated independently and summed.
//!
//! Built-in profiles are the closed [`ModelKind`] set. Anything else plugs in
//! through the trait and a [`FitterRegistry`](crate::registry::FitterRegistry).

use std::fmt;
use std::str::FromStr;

use crate::error::{CubeError, Result};

/// One spectral line component
pub trait SpectralModel: fmt::Debug + Send + Sync {
    /// Registry name of the model
    fn name(&self) -> &str;

    /// Parameter names of a single component, in order
    fn parnames(&self) -> &[&'static str];

    fn npars(&self) -> usize {
        self.parnames().len()
    }

    /// Value of a single component at `x`
    fn evaluate(&self, x: f64, params: &[f64]) -> f64;

    /// Whether a single component's parameters describe a usable profile
    fn is_valid(&self, params: &[f64]) -> bool {
        params.len() == self.npars() && params.iter().all(|p| p.is_finite())
    }

    /// Map a converged solution onto its canonical form (e.g. positive width).
    fn normalize(&self, _params: &mut [f64]) {}
}

/// Built-in line profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// `a · exp(−(x − s)² / 2w²)`
    Gaussian,
    /// `a / (1 + ((x − s)/w)²)`
    Lorentzian,
    /// Gaussian on a constant offset: `h + a · exp(−(x − s)² / 2w²)`
    VHeightGaussian,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Gaussian,
        ModelKind::Lorentzian,
        ModelKind::VHeightGaussian,
    ];

    /// Index of the width parameter within one component
    fn width_index(self) -> usize {
        match self {
            ModelKind::Gaussian | ModelKind::Lorentzian => 2,
            ModelKind::VHeightGaussian => 3,
        }
    }
}

fn gaussian(x: f64, amplitude: f64, shift: f64, width: f64) -> f64 {
    let u = (x - shift) / width;
    amplitude * (-0.5 * u * u).exp()
}

impl SpectralModel for ModelKind {
    fn name(&self) -> &str {
        match self {
            ModelKind::Gaussian => "gaussian",
            ModelKind::Lorentzian => "lorentzian",
            ModelKind::VHeightGaussian => "vheightgaussian",
        }
    }

    fn parnames(&self) -> &[&'static str] {
        match self {
            ModelKind::Gaussian | ModelKind::Lorentzian => &["amplitude", "shift", "width"],
            ModelKind::VHeightGaussian => &["height", "amplitude", "shift", "width"],
        }
    }

    fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        match self {
            ModelKind::Gaussian => gaussian(x, params[0], params[1], params[2]),
            ModelKind::Lorentzian => {
                let u = (x - params[1]) / params[2];
                params[0] / (1.0 + u * u)
            }
            ModelKind::VHeightGaussian => params[0] + gaussian(x, params[1], params[2], params[3]),
        }
    }

    fn is_valid(&self, params: &[f64]) -> bool {
        params.len() == self.npars()
            && params.iter().all(|p| p.is_finite())
            && params[self.width_index()] > 0.0
    }

    fn normalize(&self, params: &mut [f64]) {
        let w = self.width_index();
        params[w] = params[w].abs();
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| CubeError::UnknownFitter(s.to_string()))
    }
}

/// Number of components encoded by `nparams` values of a model with
/// `per_component` parameters.
pub fn component_count(nparams: usize, per_component: usize) -> Result<usize> {
    if per_component == 0 || nparams == 0 || nparams % per_component != 0 {
        return Err(CubeError::InvalidConfig(format!(
            "{nparams} parameters do not describe whole components of {per_component}"
        )));
    }
    Ok(nparams / per_component)
}

/// Sum of all components of `model` at `x`
pub fn evaluate_components(model: &dyn SpectralModel, x: f64, params: &[f64]) -> f64 {
    params
        .chunks_exact(model.npars())
        .map(|component| model.evaluate(x, component))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gaussian_peak_and_half_width() {
        let model = ModelKind::Gaussian;
        let params = [2.0, 1.0, 0.5];
        assert_relative_eq!(model.evaluate(1.0, &params), 2.0);
        let fwhm_half = 0.5 * (2.0 * 2f64.ln()).sqrt();
        assert_relative_eq!(model.evaluate(1.0 + fwhm_half, &params), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lorentzian_half_maximum_at_width() {
        let model = ModelKind::Lorentzian;
        assert_relative_eq!(model.evaluate(3.0, &[4.0, 2.0, 1.0]), 2.0);
    }

    #[test]
    fn test_negative_width_is_invalid_until_normalized() {
        let model = ModelKind::Gaussian;
        let mut params = [1.0, 0.0, -0.3];
        assert!(!model.is_valid(&params));
        model.normalize(&mut params);
        assert!(model.is_valid(&params));
        assert!(!model.is_valid(&[1.0, f64::NAN, 0.3]));
        assert!(!model.is_valid(&[1.0, 0.0]));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Gaussian".parse::<ModelKind>().unwrap(), ModelKind::Gaussian);
        assert_eq!(
            "vheightgaussian".parse::<ModelKind>().unwrap(),
            ModelKind::VHeightGaussian
        );
        assert!(matches!(
            "voigt".parse::<ModelKind>(),
            Err(CubeError::UnknownFitter(_))
        ));
    }

    #[test]
    fn test_components_are_summed() {
        let model = ModelKind::Gaussian;
        let two = [1.0, -1.0, 0.2, 3.0, 1.0, 0.2];
        let value = evaluate_components(&model, 1.0, &two);
        assert_relative_eq!(value, 3.0 + (-0.5f64 * 100.0).exp(), epsilon = 1e-12);

        assert_eq!(component_count(6, 3).unwrap(), 2);
        assert!(component_count(4, 3).is_err());
        assert!(component_count(0, 3).is_err());
    }
}
