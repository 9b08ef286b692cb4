//! Fit of `beam + target → baryon + n photons` with one global
//! four-momentum constraint.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::Result;
use crate::fitter::{BaryonMode, Fitter};
use crate::particle::ParticleType;
use crate::settings::FitterSettings;
use crate::solver::{FitResult, Solver};
use crate::uncertainty::UncertaintyModel;

/// Flat kinematic fitter.
///
/// Built once per hypothesis; per event call the `set_*` methods (see
/// [`Fitter`]) and then [`KinFitter::do_fit`].
#[derive(Debug)]
pub struct KinFitter {
    fitter: Fitter,
}

impl KinFitter {
    pub fn new(
        name: &str,
        n_photons: usize,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
    ) -> Result<Self> {
        Ok(Self {
            fitter: Fitter::new(name, n_photons, model, settings, false, BaryonMode::Measured)?,
        })
    }

    /// Like [`KinFitter::new`], with the z vertex as additional variable.
    /// Its sigma must be set with [`Fitter::set_z_vertex_sigma`] before fitting.
    pub fn with_z_vertex(
        name: &str,
        n_photons: usize,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
    ) -> Result<Self> {
        Ok(Self {
            fitter: Fitter::new(name, n_photons, model, settings, true, BaryonMode::Measured)?,
        })
    }

    /// Fitter for events without a baryon candidate: the baryon's energy and
    /// direction are free (no pulls) and start from the missing momentum.
    /// [`Fitter::set_baryon`] is rejected.
    pub fn without_baryon(
        name: &str,
        n_photons: usize,
        baryon: ParticleType,
        model: Arc<dyn UncertaintyModel>,
        settings: FitterSettings,
    ) -> Result<Self> {
        Ok(Self {
            fitter: Fitter::new(
                name,
                n_photons,
                model,
                settings,
                false,
                BaryonMode::Unmeasured(baryon),
            )?,
        })
    }

    /// Replaces the default [`crate::solver::LagrangeSolver`].
    pub fn with_solver(mut self, solver: Box<dyn Solver>) -> Self {
        self.fitter.set_solver(solver);
        self
    }

    /// Fits the configured event. Fit failures are reported in the result's
    /// status; `Err` means the fitter is not fully configured.
    pub fn do_fit(&mut self) -> Result<FitResult> {
        self.fitter.run(&[])
    }
}

impl Deref for KinFitter {
    type Target = Fitter;

    fn deref(&self) -> &Fitter {
        &self.fitter
    }
}

impl DerefMut for KinFitter {
    fn deref_mut(&mut self) -> &mut Fitter {
        &mut self.fitter
    }
}
