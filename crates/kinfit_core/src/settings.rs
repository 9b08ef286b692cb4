use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::particle::ParticleType;

/// Iteration control of the constrained least-squares solver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub max_iterations: usize,
    /// Largest accepted |g_i(x)| at convergence (MeV for momentum/mass constraints).
    pub constraint_tolerance: f64,
    /// Largest accepted change of chi^2 between two iterations at convergence.
    pub chi2_tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            constraint_tolerance: 1e-5,
            chi2_tolerance: 1e-7,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(FitError::InvalidSettings(
                "max_iterations must be greater than zero".into(),
            ));
        }
        if !(self.constraint_tolerance > 0.0) {
            return Err(FitError::InvalidSettings(
                "constraint_tolerance must be positive".into(),
            ));
        }
        if !(self.chi2_tolerance > 0.0) {
            return Err(FitError::InvalidSettings(
                "chi2_tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Nominal calorimeter surfaces (cm) used to turn measured angles into shower positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorGeometry {
    /// Inner radius of the central (ball) calorimeter around the nominal target center.
    pub central_radius: f64,
    /// Distance of the forward wall's front face from the nominal target center along the beam.
    pub forward_distance: f64,
}

impl Default for DetectorGeometry {
    fn default() -> Self {
        Self {
            central_radius: 25.4,
            forward_distance: 145.7,
        }
    }
}

impl DetectorGeometry {
    pub fn validate(&self) -> Result<()> {
        if !(self.central_radius > 0.0) || !(self.forward_distance > 0.0) {
            return Err(FitError::InvalidSettings(
                "detector distances must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Everything a fitter needs besides the uncertainty model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitterSettings {
    pub solver: SolverSettings,
    pub geometry: DetectorGeometry,
    /// Particle at rest hit by the beam photon.
    pub target: ParticleType,
}

impl Default for FitterSettings {
    fn default() -> Self {
        Self {
            solver: SolverSettings::default(),
            geometry: DetectorGeometry::default(),
            target: ParticleType::Proton,
        }
    }
}

impl FitterSettings {
    pub fn validate(&self) -> Result<()> {
        self.solver.validate()?;
        self.geometry.validate()
    }
}
