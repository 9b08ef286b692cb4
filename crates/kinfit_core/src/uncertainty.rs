//! Measurement uncertainties fed into the fitters.

use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::particle::{Detector, Particle, ParticleType};

/// Sigmas for one measured particle.
///
/// `sigma_ek == 0` marks the kinetic energy as unmeasured (free in the fit).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Uncertainties {
    pub sigma_ek: f64,
    pub sigma_theta: f64,
    pub sigma_phi: f64,
    /// Shower depth (cm) used when the particle does not carry its own.
    pub shower_depth: f64,
    pub sigma_shower_depth: f64,
}

/// Supplies per-particle resolutions.
///
/// Must be deterministic for a given particle; random smearing belongs to
/// simulation, not here. Shared read-only between fitters.
pub trait UncertaintyModel: Send + Sync {
    fn sigmas(&self, particle: &Particle) -> Result<Uncertainties>;

    fn beam_energy_sigma(&self, photon_energy: f64) -> f64;
}

/// Fixed sigmas per detector region and particle type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub photon_central: Uncertainties,
    pub photon_forward: Uncertainties,
    pub proton_central: Uncertainties,
    pub proton_forward: Uncertainties,
    /// Beam energy sigma (MeV), independent of the beam energy.
    pub beam_sigma: f64,
}

impl Constant {
    fn lookup(&self, particle: &Particle) -> Result<Uncertainties> {
        match (particle.ptype, particle.detector) {
            (ParticleType::Photon, Detector::Central) => Ok(self.photon_central),
            (ParticleType::Photon, Detector::Forward) => Ok(self.photon_forward),
            (ParticleType::Proton, Detector::Central) => Ok(self.proton_central),
            (ParticleType::Proton, Detector::Forward) => Ok(self.proton_forward),
            (ptype, detector) => Err(FitError::UnknownParticle {
                particle: ptype,
                detector,
            }),
        }
    }
}

impl UncertaintyModel for Constant {
    fn sigmas(&self, particle: &Particle) -> Result<Uncertainties> {
        self.lookup(particle)
    }

    fn beam_energy_sigma(&self, _photon_energy: f64) -> f64 {
        self.beam_sigma
    }
}

/// Like [`Constant`], but `sigma_ek` is a fraction of the kinetic energy
/// and the beam sigma a fraction of the beam energy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantRelativeE {
    pub base: Constant,
}

impl ConstantRelativeE {
    /// Same relative sigmas for every particle and region:
    /// `rel_e` of the energy, `angle` (rad) for both angles.
    pub fn uniform(rel_e: f64, angle: f64, rel_beam: f64) -> Self {
        let u = Uncertainties {
            sigma_ek: rel_e,
            sigma_theta: angle,
            sigma_phi: angle,
            shower_depth: 0.0,
            sigma_shower_depth: 0.0,
        };
        Self {
            base: Constant {
                photon_central: u,
                photon_forward: u,
                proton_central: u,
                proton_forward: u,
                beam_sigma: rel_beam,
            },
        }
    }

    /// Values extracted from simulation of the long target setup.
    pub fn mc_long_target() -> Self {
        let deg = std::f64::consts::PI / 180.0;
        let make = |e: f64, theta: f64, phi: f64| Uncertainties {
            sigma_ek: e,
            sigma_theta: theta * deg,
            sigma_phi: phi * deg,
            shower_depth: 0.0,
            sigma_shower_depth: 0.0,
        };
        Self {
            base: Constant {
                photon_central: make(0.0107, 3.79, 1.78),
                photon_forward: make(0.035, 0.42, 1.15),
                proton_central: make(0.0, 5.5, 5.3),
                proton_forward: make(0.0, 2.8, 4.45),
                beam_sigma: 0.001,
            },
        }
    }
}

impl UncertaintyModel for ConstantRelativeE {
    fn sigmas(&self, particle: &Particle) -> Result<Uncertainties> {
        let mut u = self.base.lookup(particle)?;
        u.sigma_ek *= particle.ek;
        Ok(u)
    }

    fn beam_energy_sigma(&self, photon_energy: f64) -> f64 {
        self.base.beam_sigma * photon_energy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_model_scales_energy_sigma() {
        let model = ConstantRelativeE::uniform(0.02, 0.01, 0.005);
        let photon = Particle::new(ParticleType::Photon, Detector::Central, 250.0, 1.0, 0.0);
        let u = model.sigmas(&photon).expect("photon is known");
        assert!((u.sigma_ek - 5.0).abs() < 1e-12);
        assert_eq!(u.sigma_theta, 0.01);
        assert!((model.beam_energy_sigma(400.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn long_target_model_leaves_proton_energy_unmeasured() {
        let model = ConstantRelativeE::mc_long_target();
        let proton = Particle::new(ParticleType::Proton, Detector::Forward, 80.0, 0.2, 0.0);
        let u = model.sigmas(&proton).expect("proton is known");
        assert_eq!(u.sigma_ek, 0.0);
        assert!(u.sigma_theta > 0.0);
    }

    #[test]
    fn unknown_particle_is_rejected() {
        let model = Constant::default();
        let pion = Particle::new(ParticleType::PiPlus, Detector::Central, 80.0, 1.0, 0.0);
        let err = model.sigmas(&pion).expect_err("pions have no entry");
        assert!(matches!(err, FitError::UnknownParticle { .. }));
    }
}
