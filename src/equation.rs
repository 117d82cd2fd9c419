//! Equations of motion for a charged particle in a magnetic field.
//!
//! Two forms are provided:
//!
//! - [`MagneticEquation`] integrates in arc length with momentum coordinates,
//!   the form the driver's error control is written for.
//! - [`TimeEquation`] integrates in τ = c·t (mm) with velocity coordinates
//!   v = p / M (β), the form the Nyström stepper needs. It is meant to be
//!   driven through the [`ByTime`](crate::by_time::ByTime) adapter.

use crate::field::FieldSampler;
use crate::state::{cross, norm_sq, KINETIC_ENERGY, LAB_TIME, MAX_STATE_LEN, PROPER_TIME, SPIN};
use crate::units::{C_LIGHT, PROTON_MASS_C2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Independent variable of an equation's derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Parametrization {
    /// Derivatives with respect to arc length s (mm)
    ArcLength,
    /// Derivatives with respect to τ = c·t (mm)
    Time,
}

/// Charge, rest mass and momentum magnitude of the tracked particle.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Particle {
    /// Charge in units of the positron charge
    pub charge: f64,
    /// Rest mass (MeV/c²)
    pub mass: f64,
    /// Momentum magnitude (MeV/c)
    pub momentum: f64,
}

impl Particle {
    /// Create a particle
    pub const fn new(charge: f64, mass: f64, momentum: f64) -> Self {
        Self {
            charge,
            mass,
            momentum,
        }
    }

    /// Proton with the given momentum magnitude
    pub const fn proton(momentum: f64) -> Self {
        Self::new(1.0, PROTON_MASS_C2, momentum)
    }

    /// Total energy, i.e. relativistic mass in energy units
    pub fn relativistic_mass(&self) -> f64 {
        (self.momentum * self.momentum + self.mass * self.mass).sqrt()
    }

    /// Kinetic energy, computed without cancellation for small momenta
    pub fn kinetic_energy(&self) -> f64 {
        let p2 = self.momentum * self.momentum;
        p2 / (self.relativistic_mass() + self.mass)
    }

    /// Speed as a fraction of c
    pub fn beta(&self) -> f64 {
        self.momentum / self.relativistic_mass()
    }

    /// Lorentz factor
    pub fn gamma(&self) -> f64 {
        if self.mass > 0.0 {
            self.relativistic_mass() / self.mass
        } else {
            f64::INFINITY
        }
    }
}

/// Right-hand side of the particle's ODE system.
pub trait EquationOfMotion<const N: usize> {
    /// Evaluate the derivative `dydx` of state `y`
    fn rhs(&self, y: &[f64; N], dydx: &mut [f64; N]);

    /// Relativistic mass of the particle (MeV)
    fn relativistic_mass(&self) -> f64;

    /// Particle charge (e+)
    fn charge(&self) -> f64;

    /// Independent variable of the derivatives
    fn parametrization(&self) -> Parametrization;
}

#[inline]
fn field_at<F: FieldSampler, const N: usize>(field: &F, y: &[f64; N]) -> [f64; 3] {
    let time = if N > LAB_TIME { y[LAB_TIME] } else { 0.0 };
    field.field(&[y[0], y[1], y[2]], time)
}

/// Lorentz-force equation in arc length, momentum coordinates.
///
/// dx/ds = p̂, dp/ds = (q c / |p|) p × B. Lab and proper time advance by
/// E/(|p| c) and m/(|p| c); spin precesses with g = 2.
#[derive(Debug, Clone)]
pub struct MagneticEquation<F> {
    field: F,
    particle: Particle,
}

impl<F: FieldSampler> MagneticEquation<F> {
    /// Create the equation for `particle` moving through `field`
    pub fn new(field: F, particle: Particle) -> Self {
        Self { field, particle }
    }

    /// Replace the particle (e.g. after an energy loss)
    pub fn set_particle(&mut self, particle: Particle) {
        self.particle = particle;
    }

    /// The particle being propagated
    pub fn particle(&self) -> &Particle {
        &self.particle
    }

    /// The field being sampled
    pub fn field(&self) -> &F {
        &self.field
    }
}

impl<F: FieldSampler, const N: usize> EquationOfMotion<N> for MagneticEquation<F> {
    fn rhs(&self, y: &[f64; N], dydx: &mut [f64; N]) {
        let p_sq = norm_sq(&y[3..6]);
        if p_sq == 0.0 {
            dydx.fill(0.0);
            return;
        }
        let inv_p = 1.0 / p_sq.sqrt();
        let b = field_at(&self.field, y);
        let cof = self.particle.charge * C_LIGHT * inv_p;

        let force = cross(&y[3..6], &b);
        for i in 0..3 {
            dydx[i] = y[3 + i] * inv_p;
            dydx[3 + i] = cof * force[i];
        }

        if N > KINETIC_ENERGY {
            dydx[KINETIC_ENERGY] = 0.0;
        }
        if N > LAB_TIME {
            dydx[LAB_TIME] = self.particle.relativistic_mass() * inv_p / C_LIGHT;
        }
        if N > PROPER_TIME {
            dydx[PROPER_TIME] = self.particle.mass * inv_p / C_LIGHT;
        }
        spin_rhs(y, dydx, cof, &b);
    }

    fn relativistic_mass(&self) -> f64 {
        self.particle.relativistic_mass()
    }

    fn charge(&self) -> f64 {
        self.particle.charge
    }

    fn parametrization(&self) -> Parametrization {
        Parametrization::ArcLength
    }
}

/// Lorentz-force equation in τ = c·t, velocity coordinates.
///
/// dx/dτ = v, dv/dτ = (q c / M) v × B, with M the relativistic mass.
/// Only meaningful on states whose components 3..6 hold p / M.
#[derive(Debug, Clone)]
pub struct TimeEquation<F> {
    field: F,
    particle: Particle,
}

impl<F: FieldSampler> TimeEquation<F> {
    /// Create the equation for `particle` moving through `field`
    pub fn new(field: F, particle: Particle) -> Self {
        Self { field, particle }
    }

    /// Replace the particle
    pub fn set_particle(&mut self, particle: Particle) {
        self.particle = particle;
    }

    /// The particle being propagated
    pub fn particle(&self) -> &Particle {
        &self.particle
    }
}

impl<F: FieldSampler, const N: usize> EquationOfMotion<N> for TimeEquation<F> {
    fn rhs(&self, y: &[f64; N], dydx: &mut [f64; N]) {
        let b = field_at(&self.field, y);
        let cof = self.particle.charge * C_LIGHT / self.particle.relativistic_mass();

        let force = cross(&y[3..6], &b);
        for i in 0..3 {
            dydx[i] = y[3 + i];
            dydx[3 + i] = cof * force[i];
        }

        if N > KINETIC_ENERGY {
            dydx[KINETIC_ENERGY] = 0.0;
        }
        if N > LAB_TIME {
            dydx[LAB_TIME] = 1.0 / C_LIGHT;
        }
        if N > PROPER_TIME {
            dydx[PROPER_TIME] = 1.0 / (self.particle.gamma() * C_LIGHT);
        }
        spin_rhs(y, dydx, cof, &b);
    }

    fn relativistic_mass(&self) -> f64 {
        self.particle.relativistic_mass()
    }

    fn charge(&self) -> f64 {
        self.particle.charge
    }

    fn parametrization(&self) -> Parametrization {
        Parametrization::Time
    }
}

// dS = cof (S × B); slots past the proper time without a full spin vector stay zero.
#[inline]
fn spin_rhs<const N: usize>(y: &[f64; N], dydx: &mut [f64; N], cof: f64, b: &[f64; 3]) {
    if N == MAX_STATE_LEN {
        let torque = cross(&y[SPIN..SPIN + 3], b);
        for i in 0..3 {
            dydx[SPIN + i] = cof * torque[i];
        }
    } else if N > SPIN {
        dydx[SPIN..].fill(0.0);
    }
}
