use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can flow through constraint residuals.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {
    /// Lifts a plain constant (a mass, a geometry length) into the scalar type.
    /// Constants never carry a derivative.
    fn cst(value: f64) -> Self {
        Self::from_f64(value).unwrap_or_else(Self::nan)
    }
}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A set of equality constraints `g(x) = 0` over a flat vector of fit variables.
///
/// Implemented once generically over `T` so that the same residual code runs
/// with `f64` (values) and with dual numbers (Jacobian columns).
pub trait ConstraintSystem<T: Scalar> {
    /// Number of fit variables the residual reads.
    fn dimension(&self) -> usize;

    /// Number of residual equations.
    fn constraint_count(&self) -> usize;

    /// Evaluates all residuals.
    /// x: current variable vector (length `dimension()`)
    /// out: buffer for the residuals (length `constraint_count()`)
    fn apply(&self, x: &[T], out: &mut [T]);
}
