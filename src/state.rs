//! Integration state: the fixed-layout state vector plus its arc length.
//!
//! Layout of the state vector:
//!
//! | index  | content                                  |
//! |--------|------------------------------------------|
//! | 0..3   | position (mm)                            |
//! | 3..6   | momentum (MeV/c), velocity inside ByTime |
//! | 6      | kinetic energy (MeV), carried unchanged  |
//! | 7      | lab time of flight (ns)                  |
//! | 8      | proper time of flight (ns)               |
//! | 9..12  | spin                                     |

use crate::equation::Particle;
use crate::error::{IntegrationError, Result};

/// Smallest supported state length (position + momentum)
pub const MIN_STATE_LEN: usize = 6;
/// Largest supported state length (with times and spin)
pub const MAX_STATE_LEN: usize = 12;

/// Index of the kinetic energy component
pub const KINETIC_ENERGY: usize = 6;
/// Index of the lab time component
pub const LAB_TIME: usize = 7;
/// Index of the proper time component
pub const PROPER_TIME: usize = 8;
/// Index of the first spin component
pub const SPIN: usize = 9;

/// Check that a state length is usable by the steppers and the driver.
pub fn check_state_len<const N: usize>() -> Result<()> {
    if (MIN_STATE_LEN..=MAX_STATE_LEN).contains(&N) {
        Ok(())
    } else {
        Err(IntegrationError::StateLayout { len: N })
    }
}

#[inline]
pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub(crate) fn norm_sq(a: &[f64]) -> f64 {
    dot(a, a)
}

#[inline]
pub(crate) fn cross(a: &[f64], b: &[f64]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// State of a particle along its trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldTrack<const N: usize> {
    /// State vector (see module docs for the layout)
    pub y: [f64; N],
    /// Arc length travelled so far (mm)
    pub curve_length: f64,
}

impl<const N: usize> FieldTrack<N> {
    /// Wrap a raw state vector.
    pub fn new(y: [f64; N], curve_length: f64) -> Result<Self> {
        check_state_len::<N>()?;
        Ok(Self { y, curve_length })
    }

    /// Build the state of `particle` at `position` heading along `direction`.
    ///
    /// `direction` need not be normalized, but must be non-zero. Kinetic
    /// energy is filled in when the layout has room for it; times and spin
    /// start at zero.
    pub fn from_particle(
        position: [f64; 3],
        direction: [f64; 3],
        particle: &Particle,
        curve_length: f64,
    ) -> Result<Self> {
        check_state_len::<N>()?;
        let dir_mag = norm_sq(&direction).sqrt();
        if dir_mag <= 0.0 || !dir_mag.is_finite() {
            return Err(IntegrationError::invalid_input(
                "momentum direction must be a non-zero finite vector",
            ));
        }
        let p = particle.momentum / dir_mag;

        let mut y = [0.0; N];
        y[..3].copy_from_slice(&position);
        for i in 0..3 {
            y[3 + i] = direction[i] * p;
        }
        if N > KINETIC_ENERGY {
            y[KINETIC_ENERGY] = particle.kinetic_energy();
        }
        Ok(Self { y, curve_length })
    }

    /// Position (mm)
    pub fn position(&self) -> [f64; 3] {
        [self.y[0], self.y[1], self.y[2]]
    }

    /// Momentum vector (MeV/c)
    pub fn momentum(&self) -> [f64; 3] {
        [self.y[3], self.y[4], self.y[5]]
    }

    /// Momentum magnitude
    pub fn momentum_mag(&self) -> f64 {
        norm_sq(&self.y[3..6]).sqrt()
    }

    /// Unit vector along the momentum. Zero momentum yields a zero vector.
    pub fn momentum_direction(&self) -> [f64; 3] {
        let p = self.momentum_mag();
        if p > 0.0 {
            [self.y[3] / p, self.y[4] / p, self.y[5] / p]
        } else {
            [0.0; 3]
        }
    }

    /// Lab time of flight, when the layout carries it.
    pub fn lab_time(&self) -> Option<f64> {
        (N > LAB_TIME).then(|| self.y[LAB_TIME])
    }

    /// Proper time of flight, when the layout carries it.
    pub fn proper_time(&self) -> Option<f64> {
        (N > PROPER_TIME).then(|| self.y[PROPER_TIME])
    }

    /// Spin vector, when the layout carries it.
    pub fn spin(&self) -> Option<[f64; 3]> {
        (N == MAX_STATE_LEN).then(|| [self.y[SPIN], self.y[SPIN + 1], self.y[SPIN + 2]])
    }

    /// Set lab and proper time. Returns false if the layout has no time slots.
    pub fn set_times(&mut self, lab: f64, proper: f64) -> bool {
        if N > PROPER_TIME {
            self.y[LAB_TIME] = lab;
            self.y[PROPER_TIME] = proper;
            true
        } else {
            false
        }
    }

    /// Set the spin vector. Returns false if the layout has no spin slots.
    pub fn set_spin(&mut self, spin: [f64; 3]) -> bool {
        if N == MAX_STATE_LEN {
            self.y[SPIN..SPIN + 3].copy_from_slice(&spin);
            true
        } else {
            false
        }
    }
}
