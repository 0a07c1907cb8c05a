//! Fitter registry: model name → (model, parameter count)
//!
//! The built-in models live in one immutable map shared by every registry.
//! Each registry adds a private overlay on top; lookups consult the overlay
//! first. Cloning a registry shares the base and copies the overlay, so a
//! spectrum extracted from a cube can register new fitters without the cube
//! or any sibling spectrum seeing them.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CubeError, Result};
use crate::models::{component_count, evaluate_components, ModelKind, SpectralModel};

/// A named model plus the number of parameters one fit of it takes
#[derive(Debug, Clone)]
pub struct Fitter {
    model: Arc<dyn SpectralModel>,
    npars: usize,
}

impl Fitter {
    /// Wrap `model`, fitting `npars` parameters at a time (a whole number of
    /// components).
    pub fn new(model: Arc<dyn SpectralModel>, npars: usize) -> Result<Self> {
        component_count(npars, model.npars())?;
        Ok(Self { model, npars })
    }

    fn builtin(kind: ModelKind) -> Self {
        Self {
            npars: kind.npars(),
            model: Arc::new(kind),
        }
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn model(&self) -> &dyn SpectralModel {
        self.model.as_ref()
    }

    /// Parameter count of one fit
    pub fn npars(&self) -> usize {
        self.npars
    }

    /// Parameters of a single component
    pub fn component_npars(&self) -> usize {
        self.model.npars()
    }

    /// Components encoded by `nparams` values
    pub fn components(&self, nparams: usize) -> Result<usize> {
        component_count(nparams, self.model.npars())
    }

    /// The same model fitting `npars` parameters at a time
    pub fn with_npars(&self, npars: usize) -> Result<Self> {
        Self::new(Arc::clone(&self.model), npars)
    }

    /// Names of all `npars` parameters; components are numbered when there
    /// is more than one.
    pub fn parameter_names(&self) -> Vec<String> {
        let names = self.model.parnames();
        let ncomp = self.npars / names.len().max(1);
        (0..ncomp)
            .flat_map(|k| {
                names.iter().map(move |name| {
                    if ncomp == 1 {
                        name.to_string()
                    } else {
                        format!("{name}{k}")
                    }
                })
            })
            .collect()
    }

    /// Evaluate every component of `params` at each `x`, writing into `out`.
    pub fn evaluate_into(&self, x: impl IntoIterator<Item = f64>, params: &[f64], out: &mut [f64]) {
        for (slot, xi) in out.iter_mut().zip(x) {
            *slot = evaluate_components(self.model.as_ref(), xi, params);
        }
    }

    /// All components of `params` describe usable profiles
    pub fn is_valid(&self, params: &[f64]) -> bool {
        let per = self.model.npars();
        per > 0
            && !params.is_empty()
            && params.len() % per == 0
            && params.chunks_exact(per).all(|c| self.model.is_valid(c))
    }

    pub fn normalize(&self, params: &mut [f64]) {
        let per = self.model.npars();
        for component in params.chunks_exact_mut(per) {
            self.model.normalize(component);
        }
    }
}

static BUILTIN_FITTERS: Lazy<Arc<BTreeMap<String, Fitter>>> = Lazy::new(|| {
    Arc::new(
        ModelKind::ALL
            .into_iter()
            .map(|kind| (kind.name().to_string(), Fitter::builtin(kind)))
            .collect(),
    )
});

#[derive(Debug, Clone)]
pub struct FitterRegistry {
    base: Arc<BTreeMap<String, Fitter>>,
    overlay: BTreeMap<String, Fitter>,
}

impl Default for FitterRegistry {
    fn default() -> Self {
        Self {
            base: Arc::clone(&BUILTIN_FITTERS),
            overlay: BTreeMap::new(),
        }
    }
}

impl FitterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` under `name` with `npars` parameters per fit.
    ///
    /// Replaces an earlier overlay entry of the same name and shadows a
    /// built-in one. Only this registry is affected.
    pub fn add_fitter(
        &mut self,
        name: &str,
        model: Arc<dyn SpectralModel>,
        npars: usize,
    ) -> Result<()> {
        let fitter = Fitter::new(model, npars)?;
        self.overlay.insert(name.trim().to_ascii_lowercase(), fitter);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Fitter> {
        let key = name.trim().to_ascii_lowercase();
        self.overlay.get(&key).or_else(|| self.base.get(&key))
    }

    /// Look up `name`, failing with [`CubeError::UnknownFitter`]
    pub fn resolve(&self, name: &str) -> Result<&Fitter> {
        self.get(name)
            .ok_or_else(|| CubeError::UnknownFitter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn npars(&self, name: &str) -> Option<usize> {
        self.get(name).map(Fitter::npars)
    }

    /// Every registered name, overlay and base merged
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .base
            .keys()
            .chain(self.overlay.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
