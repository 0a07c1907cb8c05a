//! Several cubes fit as one
//!
//! A [`CubeStack`] joins member cubes end to end along the spectral axis.
//! Members are shared through `Arc` and never modified; the stack keeps its
//! own header, spectral axis, registry and fit state.

use ndarray::{s, Array2, Array3, ArrayView3, CowArray, Ix2, Ix3};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cube::{Cube, FitState, SpectralCube};
use crate::error::{CubeError, Result};
use crate::header::Header;
use crate::registry::FitterRegistry;
use crate::xarr::SpectralAxis;

const SPECTRAL_WCS_KEYS: [&str; 5] = ["CTYPE3", "CRVAL3", "CDELT3", "CRPIX3", "CUNIT3"];

/// Limits applied while building a stack
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// Upper bound on the header merge
    pub timeout: Duration,
    /// `HISTORY` and `COMMENT` entries kept, each
    pub max_free_text: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_free_text: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CubeStack {
    members: Vec<Arc<Cube>>,
    header: Header,
    xarr: SpectralAxis,
    registry: FitterRegistry,
    state: FitState,
}

impl CubeStack {
    pub fn new(members: Vec<Arc<Cube>>) -> Result<Self> {
        Self::with_options(members, StackOptions::default())
    }

    /// Stack `members` in order.
    ///
    /// The header starts as a copy of the first member's and takes every
    /// member's keyword cards on top; free text is appended up to
    /// `options.max_free_text`. The spectral WCS keywords stay those of the
    /// first member, which describe the start of the joined axis.
    pub fn with_options(members: Vec<Arc<Cube>>, options: StackOptions) -> Result<Self> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let first = members
            .first()
            .ok_or_else(|| CubeError::InvalidConfig("a cube stack needs at least one cube".to_string()))?;

        let (_, ny, nx) = first.cube.dim();
        for (i, member) in members.iter().enumerate().skip(1) {
            let (_, my, mx) = member.cube.dim();
            if (my, mx) != (ny, nx) {
                return Err(CubeError::ShapeMismatch(format!(
                    "cube {i} is {mx}x{my} pixels, cube 0 is {nx}x{ny}"
                )));
            }
        }

        let axes: Vec<&SpectralAxis> = members.iter().map(|m| &m.xarr).collect();
        let xarr = SpectralAxis::concatenate(&axes)?;

        let mut header = first.header.clone();
        let mut dropped = 0;
        for member in members.iter().skip(1) {
            header.merge_cards_from(&member.header, deadline, options.timeout)?;
            dropped += header.extend_free_text(&member.header, options.max_free_text);
        }
        for key in SPECTRAL_WCS_KEYS {
            match first.header.get(key) {
                Some(value) => header.set(key, value.clone()),
                None => {
                    header.remove(key);
                }
            }
        }
        header.set_naxis(3, xarr.len());
        if dropped > 0 {
            log::warn!("stack header: dropped {dropped} HISTORY/COMMENT entries over the cap");
        }

        log::info!(
            "stacked {} cubes into {} channels in {:.2?}",
            members.len(),
            xarr.len(),
            started.elapsed()
        );

        Ok(Self {
            registry: first.registry().clone(),
            members,
            header,
            xarr,
            state: FitState::default(),
        })
    }

    pub fn members(&self) -> &[Arc<Cube>] {
        &self.members
    }

    pub fn registry_mut(&mut self) -> &mut FitterRegistry {
        &mut self.registry
    }

    /// Cached model cube, if one has been built
    pub fn modelcube(&self) -> Option<&Array3<f64>> {
        self.state.modelcube.as_ref()
    }
}

impl SpectralCube for CubeStack {
    /// Borrowed for a single member; the joined cube otherwise.
    fn flux(&self) -> CowArray<'_, f64, Ix3> {
        match self.members.as_slice() {
            [only] => CowArray::from(only.cube.view()),
            members => {
                let views: Vec<_> = members.iter().map(|m| m.cube.view()).collect();
                CowArray::from(join_spectrally(&views))
            }
        }
    }

    /// Present only when every member has an error cube
    fn error_flux(&self) -> Option<CowArray<'_, f64, Ix3>> {
        let views = self
            .members
            .iter()
            .map(|m| m.errorcube.as_ref().map(|e| e.view()))
            .collect::<Option<Vec<_>>>()?;
        match views.len() {
            1 => views.into_iter().next().map(CowArray::from),
            _ => Some(CowArray::from(join_spectrally(&views))),
        }
    }

    /// Pixels unmasked in every member
    fn spatial_mask(&self) -> Option<CowArray<'_, bool, Ix2>> {
        match self.members.as_slice() {
            [only] => Some(CowArray::from(only.maskmap.view())),
            members => {
                let mut mask = Array2::from_elem(members[0].maskmap.dim(), true);
                for member in members {
                    mask.zip_mut_with(&member.maskmap, |a, &b| *a &= b);
                }
                Some(CowArray::from(mask))
            }
        }
    }

    /// Members share it, so no joined flux is built
    fn spatial_shape(&self) -> (usize, usize) {
        let (_, ny, nx) = self.members[0].cube.dim();
        (ny, nx)
    }

    fn xarr(&self) -> &SpectralAxis {
        &self.xarr
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn registry(&self) -> &FitterRegistry {
        &self.registry
    }

    fn fit_state(&self) -> &FitState {
        &self.state
    }

    fn fit_state_mut(&mut self) -> &mut FitState {
        &mut self.state
    }
}

/// Concatenate cubes of equal spatial shape along the spectral axis.
fn join_spectrally(views: &[ArrayView3<'_, f64>]) -> Array3<f64> {
    let (ny, nx) = views.first().map_or((0, 0), |v| (v.dim().1, v.dim().2));
    let nz = views.iter().map(|v| v.dim().0).sum();
    let mut joined = Array3::zeros((nz, ny, nx));
    let mut z = 0;
    for view in views {
        let len = view.dim().0;
        joined.slice_mut(s![z..z + len, .., ..]).assign(view);
        z += len;
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{make_test_cube, TestCubeConfig};

    fn member(seed: u64) -> Cube {
        make_test_cube(&TestCubeConfig::default().with_seed(seed))
            .unwrap()
            .into_cube()
            .unwrap()
    }

    #[test]
    fn test_single_member_flux_is_borrowed() {
        let cube = Arc::new(member(0));
        let stack = CubeStack::new(vec![Arc::clone(&cube)]).unwrap();
        assert!(stack.flux().is_view());
        assert_eq!(stack.flux().view(), cube.cube.view());
        assert_eq!(stack.header().naxis(3), Some(30));
    }

    #[test]
    fn test_two_members_join_spectrally() {
        let a = Arc::new(member(0));
        let b = Arc::new(member(1));
        let stack = CubeStack::new(vec![Arc::clone(&a), Arc::clone(&b)]).unwrap();

        let flux = stack.flux();
        assert!(!flux.is_view());
        assert_eq!(flux.dim(), (60, 9, 9));
        assert_eq!(flux[[30, 2, 3]], b.cube[[0, 2, 3]]);
        assert_eq!(stack.spatial_shape(), (9, 9));
        assert_eq!(stack.xarr().len(), 60);
        assert_eq!(stack.header().naxis(3), Some(60));
        assert_eq!(stack.header().get_f64("CRVAL3"), a.header.get_f64("CRVAL3"));
        assert!(stack.error_flux().is_none());
    }

    #[test]
    fn test_free_text_is_appended_and_capped() {
        let mut a = member(0);
        let mut b = member(1);
        a.header.add_history("history and comment keywords");
        for i in 0..5 {
            b.header.add_comment(format!("comment {i}"));
        }
        let options = StackOptions {
            max_free_text: 3,
            ..StackOptions::default()
        };
        let stack = CubeStack::with_options(vec![Arc::new(a), Arc::new(b)], options).unwrap();
        assert_eq!(stack.header().history(), ["history and comment keywords"]);
        assert_eq!(stack.header().comments().len(), 3);
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let options = StackOptions {
            timeout: Duration::ZERO,
            ..StackOptions::default()
        };
        let result = CubeStack::with_options(vec![Arc::new(member(0)), Arc::new(member(1))], options);
        assert!(matches!(result, Err(CubeError::Timeout { .. })));
    }

    #[test]
    fn test_members_must_share_spatial_shape() {
        let small = Cube::new(Array3::zeros((30, 4, 4)), Header::new()).unwrap();
        let result = CubeStack::new(vec![Arc::new(member(0)), Arc::new(small)]);
        assert!(matches!(result, Err(CubeError::ShapeMismatch(_))));
        assert!(matches!(CubeStack::new(Vec::new()), Err(CubeError::InvalidConfig(_))));
    }

    #[test]
    fn test_spatial_shape_of_non_square_members() {
        let a = Cube::new(Array3::zeros((5, 4, 6)), Header::new()).unwrap();
        let b = Cube::new(Array3::ones((3, 4, 6)), Header::new()).unwrap();
        let stack = CubeStack::new(vec![Arc::new(a), Arc::new(b)]).unwrap();
        assert_eq!(stack.spatial_shape(), (4, 6));
        assert_eq!(stack.flux().dim(), (8, 4, 6));
    }
}
