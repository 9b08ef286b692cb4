//! Particle species, detector regions and measured particles.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lorentz::{LorentzVec, Vec3};

/// Particle species known to the fitters. Masses in MeV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParticleType {
    /// Pseudo particle standing for the initial state (beam photon + target).
    BeamTarget,
    Proton,
    Neutron,
    Photon,
    Pi0,
    PiPlus,
    PiMinus,
    Eta,
    Omega,
    EtaPrime,
}

impl ParticleType {
    pub fn mass(self) -> f64 {
        match self {
            ParticleType::BeamTarget => 0.0,
            ParticleType::Proton => 938.272,
            ParticleType::Neutron => 939.565,
            ParticleType::Photon => 0.0,
            ParticleType::Pi0 => 134.977,
            ParticleType::PiPlus | ParticleType::PiMinus => 139.570,
            ParticleType::Eta => 547.862,
            ParticleType::Omega => 782.66,
            ParticleType::EtaPrime => 957.78,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParticleType::BeamTarget => "(beam+target)",
            ParticleType::Proton => "p",
            ParticleType::Neutron => "n",
            ParticleType::Photon => "γ",
            ParticleType::Pi0 => "π0",
            ParticleType::PiPlus => "π+",
            ParticleType::PiMinus => "π-",
            ParticleType::Eta => "η",
            ParticleType::Omega => "ω",
            ParticleType::EtaPrime => "η'",
        }
    }

    /// Baryons are the particles fitted in the baryon slot.
    pub fn is_baryon(self) -> bool {
        matches!(self, ParticleType::Proton | ParticleType::Neutron)
    }
}

impl fmt::Display for ParticleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Calorimeter region a particle was reconstructed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Detector {
    /// Spherical shell around the target.
    Central,
    /// Flat wall perpendicular to the beam, downstream.
    Forward,
}

/// A reconstructed detector hit cluster, before any particle hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub detector: Detector,
    /// Deposited energy (MeV).
    pub energy: f64,
    /// Polar angle seen from the nominal target center.
    pub theta: f64,
    pub phi: f64,
    /// Shower depth inside the calorimeter (cm), if the reconstruction provides one.
    pub shower_depth: Option<f64>,
}

/// A measured particle: a type hypothesis attached to measured kinematics.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub ptype: ParticleType,
    pub detector: Detector,
    /// Kinetic energy (MeV).
    pub ek: f64,
    pub theta: f64,
    pub phi: f64,
    pub shower_depth: Option<f64>,
    /// Cluster this particle was built from, for bookkeeping only.
    pub candidate: Option<Arc<Candidate>>,
}

impl Particle {
    pub fn new(ptype: ParticleType, detector: Detector, ek: f64, theta: f64, phi: f64) -> Self {
        Self {
            ptype,
            detector,
            ek,
            theta,
            phi,
            shower_depth: None,
            candidate: None,
        }
    }

    /// Interprets a candidate as a particle of the given type; the deposited
    /// energy is taken as kinetic energy.
    pub fn from_candidate(ptype: ParticleType, candidate: &Arc<Candidate>) -> Self {
        Self {
            ptype,
            detector: candidate.detector,
            ek: candidate.energy,
            theta: candidate.theta,
            phi: candidate.phi,
            shower_depth: candidate.shower_depth,
            candidate: Some(Arc::clone(candidate)),
        }
    }

    /// Builds a particle from a four-momentum, taking the kinetic energy
    /// relative to the type's nominal mass.
    pub fn from_lorentz(ptype: ParticleType, detector: Detector, p4: &LorentzVec<f64>) -> Self {
        Self::new(ptype, detector, p4.e - ptype.mass(), p4.theta(), p4.phi())
    }

    pub fn with_shower_depth(mut self, depth: f64) -> Self {
        self.shower_depth = Some(depth);
        self
    }

    pub fn mass(&self) -> f64 {
        self.ptype.mass()
    }

    pub fn p4(&self) -> LorentzVec<f64> {
        LorentzVec::from_kinetic(self.ek, self.mass(), Vec3::unit(self.theta, self.phi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_lorentz_recovers_kinematics() {
        let original = Particle::new(ParticleType::Proton, Detector::Forward, 42.0, 0.2, 1.0);
        let rebuilt = Particle::from_lorentz(ParticleType::Proton, Detector::Forward, &original.p4());
        assert!((rebuilt.ek - 42.0).abs() < 1e-9);
        assert!((rebuilt.theta - 0.2).abs() < 1e-12);
        assert!((rebuilt.phi - 1.0).abs() < 1e-12);
    }

    #[test]
    fn from_candidate_keeps_back_reference() {
        let candidate = Arc::new(Candidate {
            detector: Detector::Central,
            energy: 150.0,
            theta: 1.0,
            phi: -0.5,
            shower_depth: Some(12.0),
        });
        let photon = Particle::from_candidate(ParticleType::Photon, &candidate);
        assert_eq!(photon.ek, 150.0);
        assert_eq!(photon.shower_depth, Some(12.0));
        let back = photon.candidate.as_ref().expect("candidate should be linked");
        assert!(Arc::ptr_eq(back, &candidate));
    }

    #[test]
    fn only_nucleons_are_baryons() {
        assert!(ParticleType::Proton.is_baryon());
        assert!(ParticleType::Neutron.is_baryon());
        assert!(!ParticleType::Photon.is_baryon());
        assert!(!ParticleType::EtaPrime.is_baryon());
    }
}
