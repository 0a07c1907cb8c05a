//! Error type shared by every cubefit module

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading, slicing, fitting or stacking cubes
#[derive(Error, Debug)]
pub enum CubeError {
    /// Bad user configuration, detected before any work is done
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two arrays (or an array and its header) disagree on shape
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A crop or slice request selects nothing inside the cube
    #[error("region out of bounds: {0}")]
    Bounds(String),

    #[error("unknown fitter '{0}'")]
    UnknownFitter(String),

    /// A single-spectrum fit produced no usable solution
    #[error("fit failed: {0}")]
    FitFailed(#[from] crate::spectrum::FitFailure),

    #[error("unit error: {0}")]
    Units(String),

    #[error("WCS error: {0}")]
    Wcs(String),

    #[error("missing header keyword {0}")]
    MissingKeyword(String),

    /// A bounded operation ran past its deadline
    #[error("{operation} exceeded its {limit:?} time limit")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("FITS I/O error: {0}")]
    Fits(#[from] fitsio::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, CubeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CubeError::UnknownFitter("voigt".to_string());
        assert_eq!(error.to_string(), "unknown fitter 'voigt'");

        let error = CubeError::Timeout {
            operation: "stack header merge",
            limit: Duration::from_secs(5),
        };
        assert!(error.to_string().contains("stack header merge exceeded"));
    }
}
