//! The `kinfit_core` crate tests decay hypotheses against reconstructed
//! particles by constrained kinematic fitting.
//! Residuals are written once, generic over the scalar type, and run both
//! with `f64` and with dual numbers for their Jacobians.
//!
//! Key components:
//! - **Variables**: `FitVariable` (value/sigma/pull) and `FitParticle` (one slot of four variables).
//! - **Fitters**: `KinFitter` (global four-momentum balance) and `TreeFitter`
//!   (decay tree with invariant mass constraints and photon permutations).
//! - **Solver**: iterated Lagrange-multiplier solver behind the `Solver` trait.
//! - **Permutations**: `ProtonPermutation` for choosing the baryon candidate.
pub mod autodiff;
pub mod error;
pub mod fit_particle;
pub mod fitter;
pub mod kinfitter;
pub mod lorentz;
pub mod particle;
pub mod permutation;
pub mod settings;
pub mod solver;
pub mod traits;
pub mod tree;
pub mod treefitter;
pub mod uncertainty;
pub mod variable;

#[cfg(test)]
mod test_util;

pub use error::{FitError, Result};
pub use fitter::BaryonMode;
pub use kinfitter::KinFitter;
pub use solver::{FitResult, FitStatus};
pub use treefitter::{IterationFilter, TreeFitter};
