//! Event generation helpers shared by the fitter tests.

use crate::lorentz::{LorentzVec, Vec3};
use crate::particle::{Detector, Particle, ParticleType};
use crate::uncertainty::UncertaintyModel;
use rand::Rng;
use rand_distr::{Distribution, Normal};

pub const PROTON_MASS: f64 = 938.272;

/// Lorentz boost of `v` into the frame moving with `-beta`.
pub fn boost(v: LorentzVec<f64>, beta: Vec3<f64>) -> LorentzVec<f64> {
    let b2 = beta.r2();
    if b2 == 0.0 {
        return v;
    }
    let gamma = 1.0 / (1.0 - b2).sqrt();
    let bp = beta.dot(&v.p);
    let p = v.p + beta * ((gamma - 1.0) / b2 * bp + gamma * v.e);
    LorentzVec::new(p, gamma * (v.e + bp))
}

/// Splits `parent` into two daughters, the first flying along `dir` in the parent's rest frame.
pub fn two_body(
    parent: LorentzVec<f64>,
    m1: f64,
    m2: f64,
    dir: Vec3<f64>,
) -> (LorentzVec<f64>, LorentzVec<f64>) {
    let m = parent.m();
    let p = ((m * m - (m1 + m2).powi(2)) * (m * m - (m1 - m2).powi(2))).sqrt() / (2.0 * m);
    let first = LorentzVec::new(dir * p, (p * p + m1 * m1).sqrt());
    let second = LorentzVec::new(-dir * p, (p * p + m2 * m2).sqrt());
    let beta = parent.p / parent.e;
    (boost(first, beta), boost(second, beta))
}

pub fn initial_state(beam: f64) -> LorentzVec<f64> {
    LorentzVec::new(Vec3::new(0.0, 0.0, beam), beam + PROTON_MASS)
}

/// Decays a meson into two photons whose rest frame axis is perpendicular
/// to both the beam and the meson's flight direction, which keeps the
/// photons away from the beam axis.
pub fn two_photons(meson: LorentzVec<f64>) -> [LorentzVec<f64>; 2] {
    let z = Vec3::new(0.0, 0.0, 1.0);
    let p = meson.p;
    let normal = Vec3::new(z.y * p.z - z.z * p.y, z.z * p.x - z.x * p.z, z.x * p.y - z.y * p.x);
    let (a, b) = two_body(meson, 0.0, 0.0, normal / normal.r());
    [a, b]
}

/// `γ p → p π0 → p γ γ` with exact kinematics.
pub fn pi0_event(beam: f64) -> (Particle, Vec<Particle>) {
    let pi0_mass = ParticleType::Pi0.mass();
    let (pi0, proton) = two_body(
        initial_state(beam),
        pi0_mass,
        PROTON_MASS,
        Vec3::unit(1.2, 0.4),
    );
    let photons = two_photons(pi0)
        .iter()
        .map(|p4| Particle::from_lorentz(ParticleType::Photon, Detector::Central, p4))
        .collect();
    (
        Particle::from_lorentz(ParticleType::Proton, Detector::Central, &proton),
        photons,
    )
}

/// `γ p → p π0 π0 → p 4γ`, the pions emitted back to back in the rest frame
/// of their pair.
pub fn two_pi0_event(beam: f64) -> (Particle, Vec<Particle>) {
    let pi0_mass = ParticleType::Pi0.mass();
    let pair_mass = 2.0 * pi0_mass + 60.0;
    let (pair, proton) = two_body(initial_state(beam), pair_mass, PROTON_MASS, Vec3::unit(1.0, 0.3));
    let (first, second) = two_body(pair, pi0_mass, pi0_mass, Vec3::unit(1.3, 2.2));
    let photons = two_photons(first)
        .iter()
        .chain(two_photons(second).iter())
        .map(|p4| Particle::from_lorentz(ParticleType::Photon, Detector::Central, p4))
        .collect();
    (
        Particle::from_lorentz(ParticleType::Proton, Detector::Central, &proton),
        photons,
    )
}

/// Smears the measured kinematics with the model's sigmas.
pub fn smear<R: Rng>(particle: &Particle, model: &dyn UncertaintyModel, rng: &mut R) -> Particle {
    let sigmas = model.sigmas(particle).expect("particle known to the model");
    let mut draw = |value: f64, sigma: f64| {
        if sigma > 0.0 {
            value + Normal::new(0.0, sigma).expect("positive sigma").sample(rng)
        } else {
            value
        }
    };
    let mut smeared = particle.clone();
    smeared.ek = draw(particle.ek, sigmas.sigma_ek);
    smeared.theta = draw(particle.theta, sigmas.sigma_theta);
    smeared.phi = draw(particle.phi, sigmas.sigma_phi);
    smeared
}

pub fn mean_and_stddev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}
