//! Per-pixel fitting engine
//!
//! [`fit_each`] fits one model to the spectrum of every spatial pixel and
//! assembles the parameter cube, error cube and success map.
//!
//! Pixels are processed in waves on a bounded rayon pool. Pixels in one wave
//! never depend on each other, and results are committed only after the
//! whole wave has finished, so the output does not depend on the number of
//! workers:
//!
//! - without neighbour guesses every pixel belongs to a single wave
//! - with neighbour guesses a wave is a ring of equal Chebyshev distance from
//!   the start pixel, or a single pixel when a custom `position_order` is
//!   given
//!
//! A pixel that fails to fit is recorded as unfit with blank parameters and
//! errors; it never aborts the run.

use fit_math::LmConfig;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{CubeError, Result};
use crate::modelcube::ModelFit;
use crate::registry::{Fitter, FitterRegistry};
use crate::spectrum::{fit_spectrum, FitFailure, SpectrumFit};
use crate::xarr::SpectralAxis;

/// Settings of a per-pixel fitting run
///
/// Array-valued inputs are attached with the `with_*` builders and are not
/// part of the serialised form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitEachConfig {
    /// Registered fitter name
    pub fittype: String,
    /// Starting parameters used for every pixel
    pub guesses: Vec<f64>,
    /// `(x, y)` pixel the traversal starts from
    pub start_from_point: (usize, usize),
    /// Minimum peak S/N for a pixel to be fit; `Some(0.0)` fits everything
    pub signal_cut: Option<f64>,
    /// Worker threads
    pub multicore: usize,
    /// Fill value for unfit pixels; NaN when unset
    pub blank_value: Option<f64>,
    /// Start each pixel from an already fit neighbour's solution
    pub use_neighbor_as_guess: bool,
    /// Measure peak S/N on the negated spectrum
    pub absorption: bool,
    pub lm: LmConfig,
    /// `(npars, y, x)` per-pixel starting parameters
    #[serde(skip)]
    pub guess_cube: Option<Array3<f64>>,
    /// `(y, x)` noise level, broadcast along each spectrum
    #[serde(skip)]
    pub errmap: Option<Array2<f64>>,
    /// `(y, x)` traversal keys, fit in ascending order
    #[serde(skip)]
    pub position_order: Option<Array2<f64>>,
}

impl Default for FitEachConfig {
    fn default() -> Self {
        Self {
            fittype: "gaussian".to_string(),
            guesses: Vec::new(),
            start_from_point: (0, 0),
            signal_cut: None,
            multicore: 1,
            blank_value: None,
            use_neighbor_as_guess: false,
            absorption: false,
            lm: LmConfig::default(),
            guess_cube: None,
            errmap: None,
            position_order: None,
        }
    }
}

impl FitEachConfig {
    pub fn new(fittype: &str, guesses: Vec<f64>) -> Self {
        Self {
            fittype: fittype.to_string(),
            guesses,
            ..Self::default()
        }
    }

    pub fn with_start_from_point(mut self, x: usize, y: usize) -> Self {
        self.start_from_point = (x, y);
        self
    }

    pub fn with_signal_cut(mut self, cut: f64) -> Self {
        self.signal_cut = Some(cut);
        self
    }

    pub fn with_multicore(mut self, workers: usize) -> Self {
        self.multicore = workers;
        self
    }

    pub fn with_blank_value(mut self, blank: f64) -> Self {
        self.blank_value = Some(blank);
        self
    }

    pub fn with_neighbor_guesses(mut self, enabled: bool) -> Self {
        self.use_neighbor_as_guess = enabled;
        self
    }

    pub fn with_absorption(mut self, absorption: bool) -> Self {
        self.absorption = absorption;
        self
    }

    pub fn with_lm(mut self, lm: LmConfig) -> Self {
        self.lm = lm;
        self
    }

    pub fn with_guess_cube(mut self, guess_cube: Array3<f64>) -> Self {
        self.guess_cube = Some(guess_cube);
        self
    }

    pub fn with_errmap(mut self, errmap: Array2<f64>) -> Self {
        self.errmap = Some(errmap);
        self
    }

    pub fn with_position_order(mut self, order: Array2<f64>) -> Self {
        self.position_order = Some(order);
        self
    }

    pub fn blank(&self) -> f64 {
        self.blank_value.unwrap_or(f64::NAN)
    }
}

/// Outcome counts of a run; the four counts add up to `ny · nx`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitEachReport {
    pub n_fit: usize,
    pub n_failed: usize,
    pub n_below_cut: usize,
    /// Masked, all-NaN or non-finite-guess pixels
    pub n_ineligible: usize,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

/// Read-only view of what a run fits
#[derive(Debug, Clone, Copy)]
pub struct FitInput<'a> {
    /// `[z, y, x]` flux
    pub cube: ArrayView3<'a, f64>,
    pub xarr: &'a SpectralAxis,
    pub errorcube: Option<ArrayView3<'a, f64>>,
    /// `(y, x)`, false excludes a pixel
    pub maskmap: Option<ArrayView2<'a, bool>>,
    pub registry: &'a FitterRegistry,
}

/// How the signal cut treats the candidates
#[derive(Debug, Clone, PartialEq)]
enum Gate {
    Disabled,
    SkipAll(String),
    Threshold(f64),
}

impl Gate {
    fn new(signal_cut: Option<f64>, has_errors: bool) -> Result<Self> {
        match signal_cut {
            Some(c) if c == 0.0 => Ok(Gate::Disabled),
            Some(c) if !(c.is_finite() && c > 0.0) => Err(CubeError::InvalidConfig(format!(
                "signal_cut must be a non-negative number, got {c}"
            ))),
            None => Ok(Gate::SkipAll(
                "If signal_cut is set, pixels are fit only where the peak S/N reaches it; \
                 it is unset, so no pixel was fit. Pass signal_cut = 0 to fit every pixel."
                    .to_string(),
            )),
            Some(c) if !has_errors => Ok(Gate::SkipAll(format!(
                "If signal_cut is set, an error map or error cube is needed to measure S/N; \
                 signal_cut = {c} was given without either, so no pixel was fit."
            ))),
            Some(c) => Ok(Gate::Threshold(c)),
        }
    }
}

struct Engine<'a, 'c> {
    input: FitInput<'a>,
    config: &'c FitEachConfig,
    fitter: Fitter,
    guesses: Option<Array1<f64>>,
}

/// Outcome of one pixel
type PixelResult = std::result::Result<SpectrumFit, FitFailure>;

impl Engine<'_, '_> {
    fn pixel_error(&self, y: usize, x: usize) -> Option<Array1<f64>> {
        let nz = self.input.cube.dim().0;
        if let Some(errmap) = &self.config.errmap {
            return Some(Array1::from_elem(nz, errmap[[y, x]]));
        }
        self.input
            .errorcube
            .map(|errors| errors.slice(s![.., y, x]).to_owned())
    }

    /// Peak of data/error over the channels where both are finite
    fn peak_snr(&self, y: usize, x: usize) -> f64 {
        let spectrum = self.input.cube.slice(s![.., y, x]);
        let Some(error) = self.pixel_error(y, x) else {
            return f64::NAN;
        };
        let sign = if self.config.absorption { -1.0 } else { 1.0 };
        spectrum
            .iter()
            .zip(error.iter())
            .map(|(d, e)| sign * d / e)
            .filter(|snr| snr.is_finite())
            .fold(f64::NAN, f64::max)
    }

    fn flat_or_cube_guess(&self, y: usize, x: usize) -> Vec<f64> {
        match &self.config.guess_cube {
            Some(cube) => cube.slice(s![.., y, x]).to_vec(),
            None => self.guesses.as_ref().map(|g| g.to_vec()).unwrap_or_default(),
        }
    }

    fn is_eligible(&self, y: usize, x: usize) -> bool {
        let unmasked = self.input.maskmap.map_or(true, |mask| mask[[y, x]]);
        let has_data = self
            .input
            .cube
            .slice(s![.., y, x])
            .iter()
            .any(|v| v.is_finite());
        unmasked && has_data && self.flat_or_cube_guess(y, x).iter().all(|g| g.is_finite())
    }

    /// Guess for `(y, x)`: guess cube, else the earliest-traversed fit
    /// neighbour, else the flat guesses.
    fn guess_for(&self, y: usize, x: usize, fit: &ModelFit, rank: &Array2<usize>) -> Vec<f64> {
        if self.config.guess_cube.is_none() && self.config.use_neighbor_as_guess {
            let (ny, nx) = fit.spatial_shape();
            let neighbour = (-1i64..=1)
                .flat_map(|dy| (-1i64..=1).map(move |dx| (dy, dx)))
                .filter(|&(dy, dx)| (dy, dx) != (0, 0))
                .filter_map(|(dy, dx)| {
                    let ny_ = y as i64 + dy;
                    let nx_ = x as i64 + dx;
                    (ny_ >= 0 && nx_ >= 0 && (ny_ as usize) < ny && (nx_ as usize) < nx)
                        .then_some((ny_ as usize, nx_ as usize))
                })
                .filter(|&(ny_, nx_)| fit.has_fit[[ny_, nx_]])
                .min_by_key(|&(ny_, nx_)| rank[[ny_, nx_]]);
            if let Some((ny_, nx_)) = neighbour {
                return fit.params_at(ny_, nx_);
            }
        }
        self.flat_or_cube_guess(y, x)
    }

    fn fit_pixel(&self, y: usize, x: usize, guess: &[f64]) -> PixelResult {
        let error = self.pixel_error(y, x);
        fit_spectrum(
            &self.fitter,
            self.input.xarr.values(),
            self.input.cube.slice(s![.., y, x]),
            error.as_ref().map(|e| e.view()),
            guess,
            &self.config.lm,
        )
    }
}

/// Parameter count of the run, from the guess cube or the flat guesses
fn resolve_npars(base: &Fitter, config: &FitEachConfig, (ny, nx): (usize, usize)) -> Result<usize> {
    let npars = match (&config.guess_cube, config.guesses.is_empty()) {
        (Some(cube), flat_empty) => {
            let (n, gy, gx) = cube.dim();
            if (gy, gx) != (ny, nx) {
                return Err(CubeError::ShapeMismatch(format!(
                    "guess cube covers {gy}x{gx} pixels, cube has {ny}x{nx}"
                )));
            }
            if !flat_empty && config.guesses.len() != n {
                return Err(CubeError::InvalidConfig(format!(
                    "guess cube has {n} planes but {} flat guesses were given",
                    config.guesses.len()
                )));
            }
            n
        }
        (None, false) => config.guesses.len(),
        (None, true) => {
            return Err(CubeError::InvalidConfig(
                "no guesses given for fiteach".to_string(),
            ))
        }
    };

    if npars != base.npars() && npars % base.component_npars() != 0 {
        return Err(CubeError::InvalidConfig(format!(
            "{} takes {} parameters (or a multiple of {}), got {npars} guesses",
            config.fittype,
            base.npars(),
            base.component_npars()
        )));
    }
    Ok(npars)
}

fn check_map_shape<T>(map: Option<&Array2<T>>, name: &str, shape: (usize, usize)) -> Result<()> {
    match map {
        Some(map) if map.dim() != shape => Err(CubeError::ShapeMismatch(format!(
            "{name} is {:?}, cube spatial shape is {shape:?}",
            map.dim()
        ))),
        _ => Ok(()),
    }
}

/// Split the traversal into waves of mutually independent pixels.
fn build_waves(
    order: &[(usize, usize)],
    config: &FitEachConfig,
) -> Vec<Vec<(usize, usize)>> {
    if order.is_empty() {
        return Vec::new();
    }
    if !config.use_neighbor_as_guess || config.guess_cube.is_some() {
        return vec![order.to_vec()];
    }
    if config.position_order.is_some() {
        return order.iter().map(|&p| vec![p]).collect();
    }

    let (x0, y0) = config.start_from_point;
    let mut rings: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for &(y, x) in order {
        let ring = y.abs_diff(y0).max(x.abs_diff(x0));
        rings.entry(ring).or_default().push((y, x));
    }
    rings.into_values().collect()
}

/// Fit every spatial pixel of `input` with `config.fittype`.
///
/// # Arguments
/// * `input` - Cube, spectral axis, optional error cube and mask, registry
/// * `config` - Fitter, guesses, traversal, signal cut and pool size
///
/// # Returns
/// * `Ok((ModelFit, FitEachReport))` - Results and outcome counts
/// * `Err(CubeError)` - Configuration problems, detected before any fit
pub fn fit_each(input: FitInput<'_>, config: &FitEachConfig) -> Result<(ModelFit, FitEachReport)> {
    let started = Instant::now();
    let (nz, ny, nx) = input.cube.dim();
    if input.xarr.len() != nz {
        return Err(CubeError::ShapeMismatch(format!(
            "spectral axis has {} channels, cube has {nz}",
            input.xarr.len()
        )));
    }

    let base = input.registry.resolve(&config.fittype)?;
    let npars = resolve_npars(base, config, (ny, nx))?;
    let fitter = base.with_npars(npars)?;

    check_map_shape(config.errmap.as_ref(), "errmap", (ny, nx))?;
    check_map_shape(config.position_order.as_ref(), "position_order", (ny, nx))?;
    if let Some(errors) = &input.errorcube {
        if errors.dim() != input.cube.dim() {
            return Err(CubeError::ShapeMismatch(format!(
                "error cube is {:?}, cube is {:?}",
                errors.dim(),
                input.cube.dim()
            )));
        }
    }
    if let Some(mask) = &input.maskmap {
        if mask.dim() != (ny, nx) {
            return Err(CubeError::ShapeMismatch(format!(
                "mask is {:?}, cube spatial shape is {:?}",
                mask.dim(),
                (ny, nx)
            )));
        }
    }
    if config.multicore == 0 {
        return Err(CubeError::InvalidConfig("multicore must be at least 1".to_string()));
    }
    let (x0, y0) = config.start_from_point;
    if x0 >= nx || y0 >= ny {
        return Err(CubeError::InvalidConfig(format!(
            "start point ({x0}, {y0}) is outside the {nx}x{ny} map"
        )));
    }
    let gate = Gate::new(
        config.signal_cut,
        config.errmap.is_some() || input.errorcube.is_some(),
    )?;

    let engine = Engine {
        input,
        config,
        fitter,
        guesses: (!config.guesses.is_empty()).then(|| Array1::from(config.guesses.clone())),
    };
    let blank = config.blank();
    let mut report = FitEachReport::default();

    let mut candidates = Vec::with_capacity(ny * nx);
    for y in 0..ny {
        for x in 0..nx {
            if engine.is_eligible(y, x) {
                candidates.push((y, x));
            } else {
                report.n_ineligible += 1;
            }
        }
    }

    match &config.position_order {
        Some(order) => candidates.sort_by(|a, b| order[[a.0, a.1]].total_cmp(&order[[b.0, b.1]])),
        None => {
            let distance = |&(y, x): &(usize, usize)| {
                let dx = x as f64 - x0 as f64;
                let dy = y as f64 - y0 as f64;
                dx * dx + dy * dy
            };
            // stable sort keeps row-major order among equal distances
            candidates.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
        }
    }

    let to_fit: Vec<(usize, usize)> = match &gate {
        Gate::Disabled => candidates,
        Gate::SkipAll(message) => {
            log::warn!("{message}");
            report.warnings.push(message.clone());
            report.n_below_cut = candidates.len();
            Vec::new()
        }
        Gate::Threshold(cut) => {
            let (kept, below): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|&(y, x)| engine.peak_snr(y, x) >= *cut);
            for (y, x) in &below {
                log::debug!("pixel ({x}, {y}) below signal cut {cut}");
            }
            report.n_below_cut = below.len();
            kept
        }
    };

    let mut rank = Array2::from_elem((ny, nx), usize::MAX);
    for (i, &(y, x)) in to_fit.iter().enumerate() {
        rank[[y, x]] = i;
    }

    let mut fit = ModelFit::blank(&config.fittype, npars, (ny, nx), blank);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.multicore)
        .build()?;

    let waves = build_waves(&to_fit, config);
    for wave in &waves {
        let outcomes: Vec<PixelResult> = pool.install(|| {
            wave.par_iter()
                .map(|&(y, x)| {
                    let guess = engine.guess_for(y, x, &fit, &rank);
                    engine.fit_pixel(y, x, &guess)
                })
                .collect()
        });

        for (&(y, x), outcome) in wave.iter().zip(outcomes) {
            match outcome {
                Ok(solution) => {
                    fit.set_fit(y, x, &solution.params, &solution.errors);
                    report.n_fit += 1;
                }
                Err(failure) => {
                    log::debug!("pixel ({x}, {y}) not fit: {failure}");
                    report.n_failed += 1;
                }
            }
        }
    }

    report.elapsed = started.elapsed();
    log::info!(
        "fiteach {}: {} fit, {} failed, {} below signal cut, {} ineligible in {:.2?} ({} waves, {} workers)",
        config.fittype,
        report.n_fit,
        report.n_failed,
        report.n_below_cut,
        report.n_ineligible,
        report.elapsed,
        waves.len(),
        config.multicore
    );

    Ok((fit, report))
}
