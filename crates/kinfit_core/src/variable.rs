use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Closed interval a variable must stay in while the solver iterates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub min: f64,
    pub max: f64,
}

impl Domain {
    pub const UNBOUNDED: Domain = Domain {
        min: f64::NEG_INFINITY,
        max: f64::INFINITY,
    };

    /// Strictly positive values (energies, lengths).
    pub const POSITIVE: Domain = Domain {
        min: f64::MIN_POSITIVE,
        max: f64::INFINITY,
    };

    /// Polar angle.
    pub const POLAR: Domain = Domain {
        min: 0.0,
        max: std::f64::consts::PI,
    };

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

/// A single scalar fit parameter.
///
/// `sigma == 0` marks an unmeasured (free) parameter: it has no prior and
/// gets no pull.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitVariable {
    pub name: &'static str,
    pub value: f64,
    pub value_before: f64,
    pub sigma: f64,
    pub sigma_before: f64,
    pub pull: f64,
    pub domain: Domain,
}

impl FitVariable {
    pub fn new(name: &'static str, domain: Domain) -> Self {
        Self {
            name,
            value: f64::NAN,
            value_before: f64::NAN,
            sigma: f64::NAN,
            sigma_before: f64::NAN,
            pull: f64::NAN,
            domain,
        }
    }

    /// Overwrites value and sigma and records them as the pre-fit snapshot.
    pub fn set(&mut self, value: f64, sigma: f64) -> Result<()> {
        if !sigma.is_finite() || sigma < 0.0 {
            return Err(FitError::InvalidSigma {
                variable: self.name.to_string(),
                sigma,
            });
        }
        if !value.is_finite() {
            return Err(FitError::InvalidValue {
                variable: self.name.to_string(),
                value,
            });
        }
        self.value = value;
        self.sigma = sigma;
        self.snapshot();
        Ok(())
    }

    /// Takes the current value and sigma as the pre-fit state.
    pub fn snapshot(&mut self) {
        self.value_before = self.value;
        self.sigma_before = self.sigma;
        self.pull = f64::NAN;
    }

    /// Back to the unset state of [`FitVariable::new`].
    pub fn clear(&mut self) {
        *self = Self::new(self.name, self.domain);
    }

    /// Resets the fitted state to the snapshot taken by the last [`FitVariable::set`].
    pub fn restore(&mut self) {
        self.value = self.value_before;
        self.sigma = self.sigma_before;
        self.pull = f64::NAN;
    }

    pub fn is_measured(&self) -> bool {
        self.sigma_before > 0.0
    }

    /// Writes the solver output back.
    pub(crate) fn store_fitted(&mut self, value: f64, sigma: f64, pull: f64) {
        self.value = value;
        self.sigma = sigma;
        self.pull = pull;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_records_snapshot_and_clears_pull() {
        let mut v = FitVariable::new("Ek", Domain::POSITIVE);
        v.set(100.0, 2.0).expect("valid assignment");
        v.store_fitted(101.0, 1.5, -0.7);
        assert_eq!(v.value_before, 100.0);
        assert_eq!(v.pull, -0.7);

        v.set(90.0, 1.0).expect("valid assignment");
        assert_eq!(v.value, 90.0);
        assert_eq!(v.value_before, 90.0);
        assert!(v.pull.is_nan());
    }

    #[test]
    fn negative_or_nan_sigma_is_rejected() {
        let mut v = FitVariable::new("theta", Domain::POLAR);
        let err = v.set(1.0, -0.1).expect_err("negative sigma");
        assert!(format!("{err}").contains("theta"));
        assert!(v.set(1.0, f64::NAN).is_err());
        assert!(v.set(f64::INFINITY, 0.1).is_err());
    }

    #[test]
    fn zero_sigma_means_unmeasured() {
        let mut v = FitVariable::new("Ek", Domain::POSITIVE);
        v.set(10.0, 0.0).expect("zero sigma is allowed");
        assert!(!v.is_measured());
        v.set(10.0, 0.5).expect("valid assignment");
        assert!(v.is_measured());
    }

    #[test]
    fn domains() {
        assert!(Domain::POLAR.contains(0.0));
        assert!(!Domain::POLAR.contains(-1e-9));
        assert!(!Domain::POSITIVE.contains(0.0));
        assert!(Domain::UNBOUNDED.contains(-1e300));
    }
}
