//! Single-spectrum fitting
//!
//! [`fit_spectrum`] is the unit of work of the per-pixel engine: it drops
//! non-finite channels, weights residuals by the channel uncertainties when
//! they are known and hands the problem to the Levenberg-Marquardt solver.
//! [`Spectrum`] wraps it with the data, axis, header and fitter registry of
//! one extracted spectrum.

use fit_math::{levenberg_marquardt, LeastSquaresProblem, LmConfig, LmError};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::registry::{Fitter, FitterRegistry};
use crate::xarr::SpectralAxis;

/// Why a single fit produced no usable result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("{usable} usable channels cannot constrain {npars} parameters")]
    TooFewChannels { usable: usize, npars: usize },

    #[error(transparent)]
    Optimizer(#[from] LmError),

    #[error("optimizer did not converge in {0} iterations")]
    NotConverged(usize),

    #[error("solution or uncertainties are not finite")]
    NonFinite,

    #[error("solution does not describe a valid profile")]
    InvalidModel,
}

/// Converged single-spectrum solution
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFit {
    pub params: Vec<f64>,
    pub errors: Vec<f64>,
    pub chi_squared: f64,
    pub dof: usize,
    pub iterations: usize,
}

struct LineProblem<'a> {
    fitter: &'a Fitter,
    x: Vec<f64>,
    y: Vec<f64>,
    inv_sigma: Option<Vec<f64>>,
}

impl LeastSquaresProblem for LineProblem<'_> {
    fn num_params(&self) -> usize {
        self.fitter.npars()
    }

    fn num_residuals(&self) -> usize {
        self.y.len()
    }

    fn residuals(&self, params: &[f64], out: &mut [f64]) {
        self.fitter.evaluate_into(self.x.iter().copied(), params, out);
        for (i, r) in out.iter_mut().enumerate() {
            *r = self.y[i] - *r;
            if let Some(w) = &self.inv_sigma {
                *r *= w[i];
            }
        }
    }
}

/// Fit `fitter` to one spectrum.
///
/// Channels with non-finite data, or with a non-finite or non-positive
/// uncertainty when `error` is given, are ignored. Without uncertainties the
/// reported errors are scaled by the reduced chi-squared.
///
/// # Arguments
/// * `fitter` - Model and parameter count
/// * `x` - Spectral axis values
/// * `data` - Flux per channel, same length as `x`
/// * `error` - Optional 1σ uncertainty per channel
/// * `guesses` - Starting parameters, `fitter.npars()` values
/// * `config` - Optimizer settings
pub fn fit_spectrum(
    fitter: &Fitter,
    x: ArrayView1<f64>,
    data: ArrayView1<f64>,
    error: Option<ArrayView1<f64>>,
    guesses: &[f64],
    config: &LmConfig,
) -> std::result::Result<SpectrumFit, FitFailure> {
    let mut xs = Vec::with_capacity(data.len());
    let mut ys = Vec::with_capacity(data.len());
    let mut ws = error.map(|_| Vec::with_capacity(data.len()));

    for i in 0..data.len() {
        let y = data[i];
        if !y.is_finite() || !x[i].is_finite() {
            continue;
        }
        if let (Some(err), Some(ws)) = (error.as_ref(), ws.as_mut()) {
            let e = err[i];
            if !(e.is_finite() && e > 0.0) {
                continue;
            }
            ws.push(1.0 / e);
        }
        xs.push(x[i]);
        ys.push(y);
    }

    let npars = fitter.npars();
    if ys.len() <= npars {
        return Err(FitFailure::TooFewChannels {
            usable: ys.len(),
            npars,
        });
    }

    let weighted = ws.is_some();
    let problem = LineProblem {
        fitter,
        x: xs,
        y: ys,
        inv_sigma: ws,
    };

    let mut config = config.clone();
    if !weighted {
        config.scale_errors = true;
    }
    let solution = levenberg_marquardt(&problem, guesses, &config)?;
    if !solution.converged {
        return Err(FitFailure::NotConverged(solution.iterations));
    }

    let mut params = solution.params;
    fitter.normalize(&mut params);
    if !params.iter().chain(&solution.errors).all(|v| v.is_finite()) {
        return Err(FitFailure::NonFinite);
    }
    if !fitter.is_valid(&params) {
        return Err(FitFailure::InvalidModel);
    }

    Ok(SpectrumFit {
        params,
        errors: solution.errors,
        chi_squared: solution.chi_squared,
        dof: solution.dof,
        iterations: solution.iterations,
    })
}

/// One spectrum with its axis, header and fitter registry
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub data: Array1<f64>,
    pub error: Option<Array1<f64>>,
    pub xarr: SpectralAxis,
    pub header: Header,
    registry: FitterRegistry,
    fit: Option<(String, SpectrumFit)>,
}

impl Spectrum {
    pub fn new(data: Array1<f64>, xarr: SpectralAxis, header: Header) -> Result<Self> {
        if data.len() != xarr.len() {
            return Err(CubeError::ShapeMismatch(format!(
                "spectrum has {} channels, spectral axis has {}",
                data.len(),
                xarr.len()
            )));
        }
        Ok(Self {
            data,
            error: None,
            xarr,
            header,
            registry: FitterRegistry::default(),
            fit: None,
        })
    }

    pub fn with_error(mut self, error: Array1<f64>) -> Result<Self> {
        if error.len() != self.data.len() {
            return Err(CubeError::ShapeMismatch(format!(
                "error has {} channels, data has {}",
                error.len(),
                self.data.len()
            )));
        }
        self.error = Some(error);
        Ok(self)
    }

    pub fn with_registry(mut self, registry: FitterRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &FitterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FitterRegistry {
        &mut self.registry
    }

    /// Fit the registered model `fittype` starting from `guesses`.
    pub fn specfit(&mut self, fittype: &str, guesses: &[f64], config: &LmConfig) -> Result<&SpectrumFit> {
        let fitter = self.registry.resolve(fittype)?;
        if guesses.len() != fitter.npars() {
            return Err(CubeError::InvalidConfig(format!(
                "{fittype} takes {} parameters, got {} guesses",
                fitter.npars(),
                guesses.len()
            )));
        }

        let solution = fit_spectrum(
            fitter,
            self.xarr.values(),
            self.data.view(),
            self.error.as_ref().map(|e| e.view()),
            guesses,
            config,
        )?;
        log::debug!("{fittype} fit converged in {} iterations", solution.iterations);

        let (_, fit) = self.fit.insert((fittype.to_string(), solution));
        Ok(fit)
    }

    /// Fit type and solution of the last successful [`specfit`](Self::specfit)
    pub fn fit(&self) -> Option<(&str, &SpectrumFit)> {
        self.fit.as_ref().map(|(name, fit)| (name.as_str(), fit))
    }

    /// Best-fit model over the spectral axis
    pub fn model(&self) -> Option<Array1<f64>> {
        let (name, fit) = self.fit.as_ref()?;
        let fitter = self.registry.get(name)?;
        let mut out = Array1::zeros(self.xarr.len());
        let out_slice = out.as_slice_mut()?;
        fitter.evaluate_into(self.xarr.values().iter().copied(), &fit.params, out_slice);
        Some(out)
    }
}
