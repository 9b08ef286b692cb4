use thiserror::Error;

use crate::particle::{Detector, ParticleType};

/// Setup and usage errors of the fitters.
///
/// None of these depend on event data quality: they indicate a hypothesis or
/// topology mismatch in the calling code and are never retried. Fit quality
/// problems (no convergence, unphysical values) are reported through
/// [`crate::solver::FitStatus`] instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("expected {expected} photons for this topology, got {got}")]
    PhotonCountMismatch { expected: usize, got: usize },

    #[error("invalid sigma {sigma} for {variable}: must be finite and >= 0")]
    InvalidSigma { variable: String, sigma: f64 },

    #[error("invalid value {value} for {variable}")]
    InvalidValue { variable: String, value: f64 },

    #[error("z vertex fitting not enabled for this fitter")]
    ZVertexNotEnabled,

    #[error("z vertex sigma not set although z vertex fitting is enabled")]
    ZVertexSigmaUnset,

    #[error("this fitter has no measured baryon")]
    BaryonNotMeasured,

    #[error("fitter not configured: {0} missing")]
    NotConfigured(&'static str),

    #[error("fitted values requested without a successful fit")]
    NotFitted,

    #[error("no uncertainties for {particle:?} in {detector:?}")]
    UnknownParticle {
        particle: ParticleType,
        detector: Detector,
    },

    #[error("invalid decay tree: {0}")]
    InvalidTree(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, FitError>;
