//! Per-slot fit variables of one measured particle.

use crate::error::{FitError, Result};
use crate::lorentz::{LorentzVec, Vec3};
use crate::particle::{Detector, Particle};
use crate::settings::DetectorGeometry;
use crate::traits::Scalar;
use crate::uncertainty::UncertaintyModel;
use crate::variable::{Domain, FitVariable};

pub const EK: usize = 0;
pub const THETA: usize = 1;
pub const PHI: usize = 2;
pub const SHOWER_DEPTH: usize = 3;

/// Direction of flight seen from the interaction point.
///
/// Without a vertex the measured angles are the direction. With a vertex the
/// shower position on the calorimeter surface (`face(θ) + depth` along the
/// measured angles from the nominal target center) is looked at from
/// `(0, 0, z_vertex)`.
pub(crate) fn direction<T: Scalar>(
    detector: Detector,
    geometry: &DetectorGeometry,
    theta: T,
    phi: T,
    vertex: Option<(T, T)>,
) -> Vec3<T> {
    let unit = Vec3::unit(theta, phi);
    let Some((depth, z_vertex)) = vertex else {
        return unit;
    };
    let face = match detector {
        Detector::Central => T::cst(geometry.central_radius),
        Detector::Forward => T::cst(geometry.forward_distance) / theta.cos(),
    };
    let position = unit * (face + depth) - Vec3::new(T::zero(), T::zero(), z_vertex);
    position / position.r()
}

/// Four fit variables `[Ek, theta, phi, shower depth]` of one slot.
///
/// A slot is allocated once per fitter and overwritten for every event; the
/// shower depth only enters the fit while vertex fitting is active.
#[derive(Debug, Clone)]
pub struct FitParticle {
    pub(crate) vars: [FitVariable; 4],
    measured: Option<Particle>,
}

impl FitParticle {
    pub fn new() -> Self {
        Self {
            vars: [
                FitVariable::new("Ek", Domain::POSITIVE),
                FitVariable::new("theta", Domain::POLAR),
                FitVariable::new("phi", Domain::UNBOUNDED),
                FitVariable::new("shower_depth", Domain::UNBOUNDED),
            ],
            measured: None,
        }
    }

    /// Overwrites the slot with a measured particle and its sigmas from `model`.
    /// On error the slot is left unset.
    pub fn set(&mut self, particle: &Particle, model: &dyn UncertaintyModel) -> Result<()> {
        let result = self.overwrite(particle, model);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn overwrite(&mut self, particle: &Particle, model: &dyn UncertaintyModel) -> Result<()> {
        let sigmas = model.sigmas(particle)?;
        let depth = particle.shower_depth.unwrap_or(sigmas.shower_depth);

        self.vars[EK].set(particle.ek, sigmas.sigma_ek)?;
        self.vars[THETA].set(particle.theta, sigmas.sigma_theta)?;
        self.vars[PHI].set(particle.phi, sigmas.sigma_phi)?;
        self.vars[SHOWER_DEPTH].set(depth, sigmas.sigma_shower_depth)?;

        match &mut self.measured {
            Some(measured) => measured.clone_from(particle),
            None => self.measured = Some(particle.clone()),
        }
        Ok(())
    }

    /// Sets a particle without measurement: all kinematic variables are free
    /// and start at the particle's values, the shower depth is fixed at 0.
    pub(crate) fn set_unmeasured(&mut self, particle: Particle) -> Result<()> {
        let result = self
            .vars
            .iter_mut()
            .zip([particle.ek, particle.theta, particle.phi, 0.0])
            .try_for_each(|(var, value)| var.set(value, 0.0));
        if result.is_ok() {
            self.measured = Some(particle);
        } else {
            self.clear();
        }
        result
    }

    /// Forgets the particle; the slot reads as unset until the next `set`.
    pub fn clear(&mut self) {
        for var in &mut self.vars {
            var.clear();
        }
        self.measured = None;
    }

    /// Copies the contents of another slot without touching this slot's identity.
    pub(crate) fn assign_from(&mut self, other: &FitParticle) {
        self.vars.clone_from(&other.vars);
        self.measured.clone_from(&other.measured);
    }

    /// Back to the values of the last [`FitParticle::set`].
    pub(crate) fn restore(&mut self) {
        for var in &mut self.vars {
            var.restore();
        }
    }

    pub fn measured(&self) -> Result<&Particle> {
        self.measured.as_ref().ok_or(FitError::NotConfigured("particle"))
    }

    pub fn is_set(&self) -> bool {
        self.measured.is_some()
    }

    pub fn variables(&self) -> &[FitVariable; 4] {
        &self.vars
    }

    pub fn is_ek_unmeasured(&self) -> bool {
        !self.vars[EK].is_measured()
    }

    /// Start value for an unmeasured kinetic energy; the snapshot is kept.
    pub(crate) fn seed_ek(&mut self, ek: f64) {
        self.vars[EK].value = ek;
    }

    pub fn values_before(&self) -> Vec<f64> {
        self.vars.iter().map(|v| v.value_before).collect()
    }

    pub fn sigmas_before(&self) -> Vec<f64> {
        self.vars.iter().map(|v| v.sigma_before).collect()
    }

    /// Pulls of the last fit; stale or `NaN` before a successful one.
    pub fn pulls(&self) -> Vec<f64> {
        self.vars.iter().map(|v| v.pull).collect()
    }

    /// Four-momentum from the current variable values.
    pub fn lorentz_vec(
        &self,
        geometry: &DetectorGeometry,
        z_vertex: Option<f64>,
    ) -> Result<LorentzVec<f64>> {
        let particle = self.measured()?;
        let vertex = z_vertex.map(|z| (self.vars[SHOWER_DEPTH].value, z));
        let dir = direction(
            particle.detector,
            geometry,
            self.vars[THETA].value,
            self.vars[PHI].value,
            vertex,
        );
        Ok(LorentzVec::from_kinetic(
            self.vars[EK].value,
            particle.mass(),
            dir,
        ))
    }

    /// The particle as currently fitted: same type, detector and candidate
    /// as the measured one, kinematics from the variables.
    pub fn as_fitted(&self, geometry: &DetectorGeometry, z_vertex: Option<f64>) -> Result<Particle> {
        let measured = self.measured()?;
        let mut fitted = measured.clone();
        fitted.ek = self.vars[EK].value;
        fitted.shower_depth = Some(self.vars[SHOWER_DEPTH].value);
        match z_vertex {
            None => {
                fitted.theta = self.vars[THETA].value;
                fitted.phi = self.vars[PHI].value;
            }
            Some(z) => {
                let dir = direction(
                    measured.detector,
                    geometry,
                    self.vars[THETA].value,
                    self.vars[PHI].value,
                    Some((self.vars[SHOWER_DEPTH].value, z)),
                );
                fitted.theta = dir.theta();
                fitted.phi = dir.phi();
            }
        }
        Ok(fitted)
    }
}

impl Default for FitParticle {
    fn default() -> Self {
        Self::new()
    }
}
