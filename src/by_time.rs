//! Arc-length / momentum facade over a stepper that integrates in time.
//!
//! The driver works with arc length and momentum. Some steppers (Nyström)
//! need the second-order form x'' = f(x, x') in velocity coordinates.
//! [`ByTime`] converts on the way in and out:
//!
//! - momentum components 3..6 are divided by the relativistic mass M before
//!   the inner call and multiplied back afterwards (state, derivative and
//!   error estimate);
//! - the requested arc length h becomes h / |v| in τ = c·t.

use crate::equation::Parametrization;
use crate::error::{IntegrationError, Result};
use crate::state::norm_sq;
use crate::stepper::Stepper;

/// Speeds (in units of c) below this cannot be converted to a time step.
pub const MIN_SPEED: f64 = 1e-12;

/// Decorator running a time-parametrized stepper from arc-length requests.
///
/// The inner stepper must integrate a
/// [`TimeEquation`](crate::equation::TimeEquation).
#[derive(Debug, Clone)]
pub struct ByTime<S> {
    inner: S,
}

impl<S> ByTime<S> {
    /// Wrap `inner`
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped stepper
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the wrapped stepper
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stepper<N>, const N: usize> Stepper<N> for ByTime<S> {
    fn rhs(&mut self, y: &[f64; N], dydx: &mut [f64; N]) {
        let mass = self.inner.relativistic_mass();
        let mut y_vel = *y;
        for v in &mut y_vel[3..6] {
            *v /= mass;
        }
        self.inner.rhs(&y_vel, dydx);
        for d in &mut dydx[3..6] {
            *d *= mass;
        }
    }

    fn step(
        &mut self,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
        y_err: &mut [f64; N],
    ) -> Result<()> {
        let mass = self.inner.relativistic_mass();
        let inv_mass = 1.0 / mass;
        let mut y_vel = *y;
        let mut dydx_vel = *dydx;
        for i in 3..6 {
            y_vel[i] *= inv_mass;
            dydx_vel[i] *= inv_mass;
        }

        let speed = norm_sq(&y_vel[3..6]).sqrt();
        if speed.is_nan() || speed < MIN_SPEED {
            return Err(IntegrationError::DegenerateVelocity { speed });
        }

        self.inner.step(&y_vel, &dydx_vel, h / speed, y_out, y_err)?;

        for i in 3..6 {
            y_out[i] *= mass;
            y_err[i] *= mass;
        }
        Ok(())
    }

    fn order(&self) -> u32 {
        self.inner.order()
    }

    fn chord_distance(&mut self) -> f64 {
        self.inner.chord_distance()
    }

    fn evaluations(&self) -> u64 {
        self.inner.evaluations()
    }

    fn auxiliary_evaluations(&self) -> u64 {
        self.inner.auxiliary_evaluations()
    }

    fn relativistic_mass(&self) -> f64 {
        self.inner.relativistic_mass()
    }

    fn parametrization(&self) -> Parametrization {
        Parametrization::Time
    }
}
