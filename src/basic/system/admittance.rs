use derive_more::{Deref, DerefMut, From, Into};
use nalgebra::Vector2;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Represents an admittance value in a power system.
///
/// `Admittance` is a wrapper around a complex number representing the
/// admittance value `Y = G + jB`.
#[derive(Clone, Copy, Default, PartialEq, Debug, Serialize, Deserialize, From, Into, Deref, DerefMut)]
pub struct Admittance(pub Complex64);

impl Admittance {
    /// Admittance of a series impedance `Z = R + jX`.
    pub fn from_impedance(z: Complex64) -> Self {
        Self(z.inv())
    }

    /// Conductance (real part).
    pub fn g(&self) -> f64 {
        self.0.re
    }

    /// Susceptance (imaginary part).
    pub fn b(&self) -> f64 {
        self.0.im
    }
}

/// Represents a port with two bus indices.
///
/// `Port2` holds the two terminals of a branch-level element.
#[derive(Default, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, From)]
pub struct Port2(pub Vector2<i64>);

impl Port2 {
    pub fn new(from: i64, to: i64) -> Self {
        Self(Vector2::new(from, to))
    }

    pub fn from_bus(&self) -> i64 {
        self.0[0]
    }

    pub fn to_bus(&self) -> i64 {
        self.0[1]
    }
}
