//! Three- and four-vectors over a generic [`Scalar`].
//!
//! The same vector code runs with plain `f64` values when building fitted
//! particles and with dual numbers inside the constraint residuals.

use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::traits::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Scalar> Vec3<T> {
    pub fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(T::zero(), T::zero(), T::zero())
    }

    /// Unit vector pointing along polar angle `theta` and azimuth `phi`.
    pub fn unit(theta: T, phi: T) -> Self {
        let (sin_theta, cos_theta) = theta.sin_cos();
        let (sin_phi, cos_phi) = phi.sin_cos();
        Self::new(sin_theta * cos_phi, sin_theta * sin_phi, cos_theta)
    }

    pub fn from_r_theta_phi(r: T, theta: T, phi: T) -> Self {
        Self::unit(theta, phi) * r
    }

    pub fn dot(&self, other: &Self) -> T {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn r2(&self) -> T {
        self.dot(self)
    }

    pub fn r(&self) -> T {
        self.r2().sqrt()
    }

    pub fn theta(&self) -> T {
        let rho = (self.x * self.x + self.y * self.y).sqrt();
        rho.atan2(self.z)
    }

    pub fn phi(&self) -> T {
        self.y.atan2(self.x)
    }
}

impl<T: Scalar> Add for Vec3<T> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl<T: Scalar> Sub for Vec3<T> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl<T: Scalar> Neg for Vec3<T> {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl<T: Scalar> Mul<T> for Vec3<T> {
    type Output = Self;
    fn mul(self, rhs: T) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl<T: Scalar> Div<T> for Vec3<T> {
    type Output = Self;
    fn div(self, rhs: T) -> Self {
        Self::new(self.x / rhs, self.y / rhs, self.z / rhs)
    }
}

/// Four-momentum `(p, E)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LorentzVec<T> {
    pub p: Vec3<T>,
    pub e: T,
}

impl<T: Scalar> LorentzVec<T> {
    pub fn new(p: Vec3<T>, e: T) -> Self {
        Self { p, e }
    }

    pub fn zero() -> Self {
        Self::new(Vec3::zero(), T::zero())
    }

    /// Four-momentum of a particle of `mass` with kinetic energy `ek` moving along `direction`.
    /// `direction` must be a unit vector.
    pub fn from_kinetic(ek: T, mass: T, direction: Vec3<T>) -> Self {
        let e = ek + mass;
        // |p| = sqrt(E^2 - m^2) = sqrt(Ek (Ek + 2m)), stable for massless particles
        let p = (ek * (ek + mass + mass)).sqrt();
        Self::new(direction * p, e)
    }

    pub fn m2(&self) -> T {
        self.e * self.e - self.p.r2()
    }

    /// Invariant mass; spacelike vectors give a negative mass instead of NaN.
    pub fn m(&self) -> T {
        let m2 = self.m2();
        if m2 < T::zero() {
            -(-m2).sqrt()
        } else {
            m2.sqrt()
        }
    }

    pub fn p_abs(&self) -> T {
        self.p.r()
    }

    pub fn theta(&self) -> T {
        self.p.theta()
    }

    pub fn phi(&self) -> T {
        self.p.phi()
    }
}

impl<T: Scalar> Add for LorentzVec<T> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.p + rhs.p, self.e + rhs.e)
    }
}

impl<T: Scalar> Sub for LorentzVec<T> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.p - rhs.p, self.e - rhs.e)
    }
}

impl<T: Scalar> AddAssign for LorentzVec<T> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<T: Scalar> SubAssign for LorentzVec<T> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<T: Scalar> std::iter::Sum for LorentzVec<T> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, v| acc + v)
    }
}
