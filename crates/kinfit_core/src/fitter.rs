//! Slot bookkeeping shared by the kinematic fitters.
//!
//! A [`Fitter`] owns a fixed set of particle slots (slot 0 is the baryon,
//! slots `1..=n` the photons), the beam energy and an optional z-vertex
//! nuisance variable. Configuration calls overwrite these in place; a solve
//! maps them onto a flat variable vector and writes the results back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FitError, Result};
use crate::fit_particle::{direction, FitParticle, EK, PHI, SHOWER_DEPTH, THETA};
use crate::lorentz::{LorentzVec, Vec3};
use crate::particle::{Detector, Particle, ParticleType};
use crate::settings::{DetectorGeometry, FitterSettings};
use crate::solver::{FitResult, LagrangeSolver, Solver, SolverVariable};
use crate::traits::{ConstraintSystem, Scalar};
use crate::uncertainty::UncertaintyModel;
use crate::variable::{Domain, FitVariable};

/// Energy plus three momentum components.
pub const GLOBAL_CONSTRAINTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitterState {
    Idle,
    Configured,
    /// The last fit succeeded and the fitted accessors are valid.
    Fitted,
}

/// How the recoil baryon enters the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaryonMode {
    /// A measured candidate, given with [`Fitter::set_baryon`].
    Measured,
    /// No candidate: energy and direction are free and start from the
    /// missing momentum of the photons.
    Unmeasured(ParticleType),
}

/// Where a residual reads one kinematic quantity from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Var(usize),
    Const(f64),
}

impl Source {
    fn read<T: Scalar>(self, x: &[T]) -> T {
        match self {
            Source::Var(i) => x[i],
            Source::Const(value) => T::cst(value),
        }
    }
}

#[derive(Debug, Clone)]
struct ParticleTerm {
    detector: Detector,
    mass: f64,
    ek: Source,
    theta: Source,
    phi: Source,
    depth: Source,
    /// Angles are those of a calorimeter shower, re-derived from the vertex.
    shower: bool,
}

impl ParticleTerm {
    fn p4<T: Scalar>(
        &self,
        x: &[T],
        geometry: &DetectorGeometry,
        z_vertex: Option<Source>,
    ) -> LorentzVec<T> {
        let vertex = z_vertex
            .filter(|_| self.shower)
            .map(|z| (self.depth.read(x), z.read(x)));
        let dir = direction(
            self.detector,
            geometry,
            self.theta.read(x),
            self.phi.read(x),
            vertex,
        );
        LorentzVec::from_kinetic(self.ek.read(x), T::cst(self.mass), dir)
    }
}

/// `M(Σ members) - mass = 0` over slot indices.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MassTerm {
    pub members: Vec<usize>,
    pub mass: f64,
}

/// Residuals of `beam + target - Σ slots = 0`, plus optional invariant masses.
struct FitProblem<'m> {
    dimension: usize,
    geometry: DetectorGeometry,
    beam: Source,
    target_mass: f64,
    particles: Vec<ParticleTerm>,
    z_vertex: Option<Source>,
    masses: &'m [MassTerm],
}

impl<T: Scalar> ConstraintSystem<T> for FitProblem<'_> {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn constraint_count(&self) -> usize {
        GLOBAL_CONSTRAINTS + self.masses.len()
    }

    fn apply(&self, x: &[T], out: &mut [T]) {
        let beam = self.beam.read(x);
        let initial = LorentzVec::new(
            Vec3::new(T::zero(), T::zero(), beam),
            beam + T::cst(self.target_mass),
        );
        let p4s: Vec<LorentzVec<T>> = self
            .particles
            .iter()
            .map(|p| p.p4(x, &self.geometry, self.z_vertex))
            .collect();

        let balance = initial - p4s.iter().copied().sum::<LorentzVec<T>>();
        out[0] = balance.e;
        out[1] = balance.p.x;
        out[2] = balance.p.y;
        out[3] = balance.p.z;

        for (k, term) in self.masses.iter().enumerate() {
            let total: LorentzVec<T> = term.members.iter().map(|&i| p4s[i]).sum();
            out[GLOBAL_CONSTRAINTS + k] = total.m() - T::cst(term.mass);
        }
    }
}

/// Identity of one entry of the flat solver vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarRef {
    Beam,
    Slot { slot: usize, var: usize },
    ZVertex,
}

pub struct Fitter {
    name: String,
    settings: FitterSettings,
    model: Arc<dyn UncertaintyModel>,
    solver: Box<dyn Solver>,
    beam: FitVariable,
    baryon_mode: BaryonMode,
    slots: Vec<FitParticle>,
    photons_set: bool,
    z_vertex: Option<FitVariable>,
    /// Order of [`FitResult::pulls`], fixed for the fitter's lifetime.
    layout: Vec<VarRef>,
    result: Option<FitResult>,
}

/// Beam, then per slot Ek, theta, phi (and shower depth with a vertex), then
/// the z vertex.
fn fixed_layout(n_slots: usize, z_vertex: bool) -> Vec<VarRef> {
    let per_slot = if z_vertex { SHOWER_DEPTH + 1 } else { SHOWER_DEPTH };
    let mut layout = vec![VarRef::Beam];
    for slot in 0..n_slots {
        layout.extend((0..per_slot).map(|var| VarRef::Slot { slot, var }));
    }
    if z_vertex {
        layout.push(VarRef::ZVertex);
    }
    layout
}

impl Fitter {
    pub(crate) fn new(
        name: &str,
        n_photons: usize,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
        z_vertex: bool,
        baryon_mode: BaryonMode,
    ) -> Result<Self> {
        settings.validate()?;
        info!(
            fitter = name,
            photons = n_photons,
            z_vertex,
            ?baryon_mode,
            "creating kinematic fitter"
        );
        Ok(Self {
            name: name.to_string(),
            settings,
            model,
            solver: Box::new(LagrangeSolver::new(settings.solver)),
            beam: FitVariable::new("beam_energy", Domain::POSITIVE),
            baryon_mode,
            slots: (0..=n_photons).map(|_| FitParticle::new()).collect(),
            photons_set: n_photons == 0,
            z_vertex: z_vertex.then(|| FitVariable::new("z_vertex", Domain::UNBOUNDED)),
            layout: fixed_layout(n_photons + 1, z_vertex),
            result: None,
        })
    }

    pub(crate) fn set_solver(&mut self, solver: Box<dyn Solver>) {
        self.solver = solver;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &FitterSettings {
        &self.settings
    }

    pub fn photon_count(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn state(&self) -> FitterState {
        if self.result.as_ref().is_some_and(FitResult::is_success) {
            FitterState::Fitted
        } else if self.check_configured().is_ok() {
            FitterState::Configured
        } else {
            FitterState::Idle
        }
    }

    pub fn baryon_mode(&self) -> BaryonMode {
        self.baryon_mode
    }

    /// Sets the beam photon energy (MeV); its sigma comes from the uncertainty model.
    /// On error the beam is unset.
    pub fn set_beam_energy(&mut self, energy: f64) -> Result<()> {
        self.result = None;
        let sigma = self.model.beam_energy_sigma(energy);
        let result = self.beam.set(energy, sigma);
        if result.is_err() {
            self.beam.clear();
        }
        result
    }

    /// On error the baryon is unset.
    pub fn set_baryon(&mut self, baryon: &Particle) -> Result<()> {
        self.result = None;
        if let BaryonMode::Unmeasured(_) = self.baryon_mode {
            return Err(FitError::BaryonNotMeasured);
        }
        self.slots[0].set(baryon, self.model.as_ref())
    }

    /// Overwrites all photon slots; the count is fixed when the fitter is built.
    /// On error the photons are unset.
    pub fn set_photons(&mut self, photons: &[Particle]) -> Result<()> {
        self.result = None;
        self.photons_set = false;
        let expected = self.photon_count();
        if photons.len() != expected {
            return Err(FitError::PhotonCountMismatch {
                expected,
                got: photons.len(),
            });
        }
        for (slot, photon) in self.slots[1..].iter_mut().zip(photons) {
            slot.set(photon, self.model.as_ref())?;
        }
        self.photons_set = true;
        Ok(())
    }

    /// Sigma of the z vertex (cm). Zero keeps the vertex fixed at 0 and the
    /// fit identical to one without vertex variable.
    pub fn set_z_vertex_sigma(&mut self, sigma: f64) -> Result<()> {
        self.result = None;
        let z = self.z_vertex.as_mut().ok_or(FitError::ZVertexNotEnabled)?;
        let result = z.set(0.0, sigma);
        if result.is_err() {
            z.clear();
        }
        result
    }

    pub fn has_z_vertex(&self) -> bool {
        self.z_vertex.is_some()
    }

    fn check_configured(&self) -> Result<()> {
        if !self.beam.value_before.is_finite() {
            return Err(FitError::NotConfigured("beam energy"));
        }
        if self.baryon_mode == BaryonMode::Measured && !self.slots[0].is_set() {
            return Err(FitError::NotConfigured("baryon"));
        }
        if !self.photons_set {
            return Err(FitError::NotConfigured("photons"));
        }
        self.check_z_vertex()
    }

    pub(crate) fn check_z_vertex(&self) -> Result<()> {
        match &self.z_vertex {
            Some(z) if !z.sigma_before.is_finite() => Err(FitError::ZVertexSigmaUnset),
            _ => Ok(()),
        }
    }

    /// The z vertex when it takes part in the fit.
    fn active_vertex(&self) -> Option<&FitVariable> {
        self.z_vertex.as_ref().filter(|z| z.sigma_before > 0.0)
    }

    fn vertex_value(&self) -> Option<f64> {
        self.active_vertex().map(|z| z.value)
    }

    /// Whether the angles of a slot are shower angles seen from the target center.
    fn is_shower(&self, slot: usize) -> bool {
        slot != 0 || self.baryon_mode == BaryonMode::Measured
    }

    /// The vertex the direction of a slot is re-derived from.
    fn slot_vertex(&self, slot: usize) -> Option<f64> {
        self.vertex_value().filter(|_| self.is_shower(slot))
    }

    /// Copies prepared photon slots in order, bypassing the uncertainty model.
    pub(crate) fn assign_photons<'a>(&mut self, photons: impl IntoIterator<Item = &'a FitParticle>) {
        self.result = None;
        for (slot, source) in self.slots[1..].iter_mut().zip(photons) {
            slot.assign_from(source);
        }
        self.photons_set = true;
    }

    pub(crate) fn model(&self) -> &dyn UncertaintyModel {
        self.model.as_ref()
    }

    /// Initial state four-momentum from the beam energy.
    pub(crate) fn initial_state(&self) -> LorentzVec<f64> {
        let e = self.beam.value;
        LorentzVec::new(Vec3::new(0.0, 0.0, e), e + self.settings.target.mass())
    }

    /// Initial state minus all photons, as measured.
    fn missing_momentum(&self) -> Result<LorentzVec<f64>> {
        let geometry = self.settings.geometry;
        let mut missing = self.initial_state();
        for slot in &self.slots[1..] {
            missing -= slot.lorentz_vec(&geometry, None)?;
        }
        Ok(missing)
    }

    /// Resets every variable to its measurement and seeds unmeasured baryon
    /// kinematics from the missing momentum of the photons.
    fn prepare(&mut self) -> Result<()> {
        self.beam.restore();
        for slot in &mut self.slots {
            slot.restore();
        }
        if let Some(z) = &mut self.z_vertex {
            z.restore();
        }

        match self.baryon_mode {
            BaryonMode::Unmeasured(ptype) => {
                let missing = self.missing_momentum()?;
                let mass = ptype.mass();
                let ek = (missing.p.r2() + mass * mass).sqrt() - mass;
                let baryon = Particle::new(
                    ptype,
                    Detector::Central,
                    ek,
                    missing.p.theta(),
                    missing.p.phi(),
                );
                self.slots[0].set_unmeasured(baryon)?;
            }
            BaryonMode::Measured if self.slots[0].is_ek_unmeasured() => {
                let missing = self.missing_momentum()?;
                let mass = self.slots[0].measured()?.mass();
                let ek = (missing.p.r2() + mass * mass).sqrt() - mass;
                if ek.is_finite() && ek > 0.0 {
                    self.slots[0].seed_ek(ek);
                }
            }
            BaryonMode::Measured => {}
        }
        Ok(())
    }

    /// Flattens the current slots into solver variables and residuals; the
    /// third element names each solver variable.
    fn build<'m>(
        &self,
        masses: &'m [MassTerm],
    ) -> Result<(FitProblem<'m>, Vec<SolverVariable>, Vec<VarRef>)> {
        let vertex_active = self.active_vertex().is_some();
        let mut variables = Vec::new();
        let mut layout = Vec::new();

        let mut push = |var: &FitVariable, r: VarRef| {
            layout.push(r);
            variables.push(SolverVariable {
                value: var.value,
                sigma: var.sigma_before,
                domain: var.domain,
            });
            Source::Var(variables.len() - 1)
        };

        let beam = push(&self.beam, VarRef::Beam);
        let mut particles = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let vars = slot.variables();
            let mut source = |var: usize| push(&vars[var], VarRef::Slot { slot: index, var });
            let ek = source(EK);
            let theta = source(THETA);
            let phi = source(PHI);
            let depth_var = &vars[SHOWER_DEPTH];
            let shower = self.is_shower(index);
            let depth = if vertex_active && shower && depth_var.is_measured() {
                source(SHOWER_DEPTH)
            } else {
                Source::Const(depth_var.value)
            };
            particles.push(ParticleTerm {
                detector: slot.measured()?.detector,
                mass: slot.measured()?.mass(),
                ek,
                theta,
                phi,
                depth,
                shower,
            });
        }
        let z_vertex = match self.active_vertex() {
            Some(z) => Some(push(z, VarRef::ZVertex)),
            None => None,
        };

        let problem = FitProblem {
            dimension: variables.len(),
            geometry: self.settings.geometry,
            beam,
            target_mass: self.settings.target.mass(),
            particles,
            z_vertex,
            masses,
        };
        Ok((problem, variables, layout))
    }

    fn var_mut(&mut self, r: VarRef) -> Option<&mut FitVariable> {
        match r {
            VarRef::Beam => Some(&mut self.beam),
            VarRef::Slot { slot, var } => self.slots.get_mut(slot).map(|s| &mut s.vars[var]),
            VarRef::ZVertex => self.z_vertex.as_mut(),
        }
    }

    /// Runs one constrained fit with the given extra mass constraints.
    pub(crate) fn run(&mut self, masses: &[MassTerm]) -> Result<FitResult> {
        self.check_configured()?;
        self.result = None;
        self.prepare()?;
        let (problem, variables, active) = self.build(masses)?;
        let mut outcome = self.solver.solve(&problem, &variables);

        if outcome.result.is_success() {
            for (k, &r) in active.iter().enumerate() {
                let (value, sigma, pull) =
                    (outcome.values[k], outcome.sigmas[k], outcome.result.pulls[k]);
                if let Some(var) = self.var_mut(r) {
                    var.store_fitted(value, sigma, pull);
                }
            }
        }
        // variables held fixed in this fit keep their entry with a NaN pull
        let pulls = self
            .layout
            .iter()
            .map(|r| {
                active
                    .iter()
                    .position(|a| a == r)
                    .map_or(f64::NAN, |k| outcome.result.pulls[k])
            })
            .collect();
        outcome.result.pulls = pulls;

        debug!(
            fitter = %self.name,
            status = ?outcome.result.status,
            chi2 = outcome.result.chi_square,
            ndof = outcome.result.ndof,
            iterations = outcome.result.iterations,
            "fit done"
        );
        self.result = Some(outcome.result.clone());
        Ok(outcome.result)
    }

    pub fn result(&self) -> Option<&FitResult> {
        self.result.as_ref()
    }

    pub(crate) fn require_success(&self) -> Result<()> {
        match &self.result {
            Some(result) if result.is_success() => Ok(()),
            _ => Err(FitError::NotFitted),
        }
    }

    /// Variable names in the order of [`FitResult::pulls`].
    pub fn variable_names(&self) -> Vec<String> {
        self.layout
            .iter()
            .map(|r| match *r {
                VarRef::Beam => "beam_energy".to_string(),
                VarRef::ZVertex => "z_vertex".to_string(),
                VarRef::Slot { slot, var } => {
                    let name = self.slots[slot].vars[var].name;
                    if slot == 0 {
                        format!("baryon.{name}")
                    } else {
                        format!("photon[{}].{name}", slot - 1)
                    }
                }
            })
            .collect()
    }

    pub fn fitted_baryon(&self) -> Result<Particle> {
        self.require_success()?;
        self.slots[0].as_fitted(&self.settings.geometry, self.slot_vertex(0))
    }

    pub fn fitted_photons(&self) -> Result<Vec<Particle>> {
        self.require_success()?;
        self.slots[1..]
            .iter()
            .map(|slot| slot.as_fitted(&self.settings.geometry, self.slot_vertex(1)))
            .collect()
    }

    /// Fitted beam photon four-momentum (along +z).
    pub fn fitted_beam(&self) -> Result<LorentzVec<f64>> {
        self.require_success()?;
        let e = self.beam.value;
        Ok(LorentzVec::new(Vec3::new(0.0, 0.0, e), e))
    }

    pub fn fitted_beam_energy(&self) -> Result<f64> {
        self.require_success()?;
        Ok(self.beam.value)
    }

    pub fn fitted_z_vertex(&self) -> Result<f64> {
        let z = self.z_vertex.as_ref().ok_or(FitError::ZVertexNotEnabled)?;
        self.require_success()?;
        Ok(z.value)
    }

    /// Fitted four-momentum of a slot (0 = baryon).
    pub(crate) fn fitted_p4(&self, slot: usize) -> Result<LorentzVec<f64>> {
        self.slots[slot].lorentz_vec(&self.settings.geometry, self.slot_vertex(slot))
    }

    pub fn beam_pull(&self) -> f64 {
        self.beam.pull
    }

    pub fn z_vertex_pull(&self) -> f64 {
        self.z_vertex.as_ref().map_or(f64::NAN, |z| z.pull)
    }

    /// `[Ek, theta, phi, shower depth]` pulls of the baryon.
    pub fn baryon_pulls(&self) -> Vec<f64> {
        self.slots[0].pulls()
    }

    pub fn photon_pulls(&self) -> Vec<Vec<f64>> {
        self.slots[1..].iter().map(FitParticle::pulls).collect()
    }

    pub fn baryon(&self) -> &FitParticle {
        &self.slots[0]
    }

    pub fn photons(&self) -> &[FitParticle] {
        &self.slots[1..]
    }

    pub fn beam(&self) -> &FitVariable {
        &self.beam
    }

    pub fn z_vertex(&self) -> Option<&FitVariable> {
        self.z_vertex.as_ref()
    }
}

impl std::fmt::Debug for Fitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fitter")
            .field("name", &self.name)
            .field("photons", &self.photon_count())
            .field("z_vertex", &self.z_vertex.is_some())
            .field("state", &self.state())
            .finish()
    }
}
