//! Single-step solvers.
//!
//! A [`Stepper`] advances a state by exactly one trial length and returns a
//! local error estimate. The driver owns the step-size control; a stepper
//! only counts the right-hand side evaluations it makes.
//!
//! Fixed-step methods without an embedded error estimate implement
//! [`FixedStep`] and are turned into steppers by [`Doubling`], which
//! compares one full step with two half steps.

use crate::equation::{EquationOfMotion, Parametrization};
use crate::error::Result;
use crate::state::{dot, norm_sq};

/// One-step solver for a state of `N` components.
pub trait Stepper<const N: usize> {
    /// Evaluate the right-hand side of the underlying equation
    fn rhs(&mut self, y: &[f64; N], dydx: &mut [f64; N]);

    /// Advance `y` by exactly `h`, writing the new state and the per-component
    /// error estimate
    fn step(
        &mut self,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
        y_err: &mut [f64; N],
    ) -> Result<()>;

    /// Order used to derive the step-resize exponents
    fn order(&self) -> u32;

    /// Largest deviation of the last step's path from its straight chord
    fn chord_distance(&mut self) -> f64;

    /// Total right-hand side evaluations so far
    fn evaluations(&self) -> u64;

    /// Evaluations spent inside `chord_distance`, included in `evaluations`
    fn auxiliary_evaluations(&self) -> u64 {
        0
    }

    /// Relativistic mass of the particle being propagated
    fn relativistic_mass(&self) -> f64;

    /// Independent variable of the derivatives from `rhs`
    fn parametrization(&self) -> Parametrization;
}

/// Distance from `point` to the segment `start`–`end`.
///
/// Falls back to the distance from `start` when the segment is degenerate.
pub fn chord_deviation(point: &[f64], start: &[f64], end: &[f64]) -> f64 {
    let chord = [end[0] - start[0], end[1] - start[1], end[2] - start[2]];
    let rel = [point[0] - start[0], point[1] - start[1], point[2] - start[2]];
    let chord_sq = norm_sq(&chord);
    if chord_sq == 0.0 {
        return norm_sq(&rel).sqrt();
    }

    let t = dot(&rel, &chord) / chord_sq;
    if t <= 0.0 {
        norm_sq(&rel).sqrt()
    } else if t >= 1.0 {
        let d = [point[0] - end[0], point[1] - end[1], point[2] - end[2]];
        norm_sq(&d).sqrt()
    } else {
        (norm_sq(&rel) - t * t * chord_sq).max(0.0).sqrt()
    }
}

/// A fixed-step integration formula without error estimate.
pub trait FixedStep<const N: usize> {
    /// Convergence order of the formula
    fn order(&self) -> u32;

    /// Advance `y` by `h` using `dydx` as the derivative at `y`.
    ///
    /// Returns the number of additional right-hand side evaluations.
    fn advance<E: EquationOfMotion<N>>(
        &self,
        eq: &E,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
    ) -> u64;
}

/// Forward Euler, order 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitEuler;

impl<const N: usize> FixedStep<N> for ExplicitEuler {
    fn order(&self) -> u32 {
        1
    }

    fn advance<E: EquationOfMotion<N>>(
        &self,
        _eq: &E,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
    ) -> u64 {
        for i in 0..N {
            y_out[i] = y[i] + h * dydx[i];
        }
        0
    }
}

/// Classical fourth-order Runge-Kutta.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicalRk4;

impl<const N: usize> FixedStep<N> for ClassicalRk4 {
    fn order(&self) -> u32 {
        4
    }

    #[allow(clippy::needless_range_loop)]
    fn advance<E: EquationOfMotion<N>>(
        &self,
        eq: &E,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
    ) -> u64 {
        let half = 0.5 * h;
        let mut yt = [0.0; N];
        let mut k2 = [0.0; N];
        let mut k3 = [0.0; N];
        let mut k4 = [0.0; N];

        for i in 0..N {
            yt[i] = y[i] + half * dydx[i];
        }
        eq.rhs(&yt, &mut k2);
        for i in 0..N {
            yt[i] = y[i] + half * k2[i];
        }
        eq.rhs(&yt, &mut k3);
        for i in 0..N {
            yt[i] = y[i] + h * k3[i];
        }
        eq.rhs(&yt, &mut k4);

        for i in 0..N {
            y_out[i] = y[i] + h / 6.0 * (dydx[i] + 2.0 * (k2[i] + k3[i]) + k4[i]);
        }
        3
    }
}

/// Fourth-order Runge-Kutta-Nyström for x'' = f(x, x').
///
/// Treats components 0..3 as position and 3..6 as its first derivative
/// (Abramowitz & Stegun 25.5.20). Remaining components are advanced with
/// the classical weights. Only valid when dx/dt equals the state's own
/// components 3..6, i.e. through [`ByTime`](crate::by_time::ByTime) over a
/// [`TimeEquation`](crate::equation::TimeEquation).
#[derive(Debug, Clone, Copy, Default)]
pub struct NystromRk4;

impl<const N: usize> FixedStep<N> for NystromRk4 {
    fn order(&self) -> u32 {
        4
    }

    #[allow(clippy::needless_range_loop)]
    fn advance<E: EquationOfMotion<N>>(
        &self,
        eq: &E,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
    ) -> u64 {
        let half = 0.5 * h;
        let mut yt = [0.0; N];
        let mut f2 = [0.0; N];
        let mut f3 = [0.0; N];
        let mut f4 = [0.0; N];
        // k_i = (h/2) * acceleration at stage i
        let mut k1 = [0.0; 3];
        let mut k2 = [0.0; 3];
        let mut k3 = [0.0; 3];

        for i in 0..3 {
            k1[i] = half * dydx[3 + i];
        }

        // Stage 2 and 3 share the position x + h/2 (x' + k1/2)
        for i in 0..3 {
            yt[i] = y[i] + half * (y[3 + i] + 0.5 * k1[i]);
            yt[3 + i] = y[3 + i] + k1[i];
        }
        for i in 6..N {
            yt[i] = y[i] + half * dydx[i];
        }
        eq.rhs(&yt, &mut f2);
        for i in 0..3 {
            k2[i] = half * f2[3 + i];
            yt[3 + i] = y[3 + i] + k2[i];
        }
        for i in 6..N {
            yt[i] = y[i] + half * f2[i];
        }
        eq.rhs(&yt, &mut f3);
        for i in 0..3 {
            k3[i] = half * f3[3 + i];
        }

        for i in 0..3 {
            yt[i] = y[i] + h * (y[3 + i] + k3[i]);
            yt[3 + i] = y[3 + i] + 2.0 * k3[i];
        }
        for i in 6..N {
            yt[i] = y[i] + h * f3[i];
        }
        eq.rhs(&yt, &mut f4);

        for i in 0..3 {
            let k4 = half * f4[3 + i];
            y_out[i] = y[i] + h * (y[3 + i] + (k1[i] + k2[i] + k3[i]) / 3.0);
            y_out[3 + i] = y[3 + i] + (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4) / 3.0;
        }
        for i in 6..N {
            y_out[i] = y[i] + h / 6.0 * (dydx[i] + 2.0 * (f2[i] + f3[i]) + f4[i]);
        }
        3
    }
}

/// Step-doubling error estimator over a fixed-step formula.
///
/// The returned state is the result of two half steps; the error is its
/// difference with a single full step. The chord distance is measured at
/// the half-step point, so it costs no extra evaluations.
#[derive(Debug, Clone)]
pub struct Doubling<M, E, const N: usize> {
    method: M,
    equation: E,
    evaluations: u64,
    initial: [f64; 3],
    middle: [f64; 3],
    last: [f64; 3],
}

/// Explicit Euler with step doubling
pub type EulerStepper<E, const N: usize> = Doubling<ExplicitEuler, E, N>;
/// Classical RK4 with step doubling
pub type ClassicalRk4Stepper<E, const N: usize> = Doubling<ClassicalRk4, E, N>;
/// Nyström RK4 with step doubling
pub type NystromStepper<E, const N: usize> = Doubling<NystromRk4, E, N>;

impl<M: FixedStep<N>, E: EquationOfMotion<N>, const N: usize> Doubling<M, E, N> {
    /// Wrap `method` applied to `equation`
    pub fn new(method: M, equation: E) -> Self {
        Self {
            method,
            equation,
            evaluations: 0,
            initial: [0.0; 3],
            middle: [0.0; 3],
            last: [0.0; 3],
        }
    }

    /// The equation being integrated
    pub fn equation(&self) -> &E {
        &self.equation
    }

    /// Mutable access to the equation (e.g. to change the particle)
    pub fn equation_mut(&mut self) -> &mut E {
        &mut self.equation
    }
}

impl<M: FixedStep<N>, E: EquationOfMotion<N>, const N: usize> Stepper<N> for Doubling<M, E, N> {
    fn rhs(&mut self, y: &[f64; N], dydx: &mut [f64; N]) {
        self.equation.rhs(y, dydx);
        self.evaluations += 1;
    }

    fn step(
        &mut self,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
        y_err: &mut [f64; N],
    ) -> Result<()> {
        let half = 0.5 * h;
        let mut y_mid = [0.0; N];
        let mut dydx_mid = [0.0; N];
        let mut y_full = [0.0; N];

        let mut evals = self
            .method
            .advance(&self.equation, y, dydx, half, &mut y_mid);
        self.equation.rhs(&y_mid, &mut dydx_mid);
        evals += 1;
        evals += self
            .method
            .advance(&self.equation, &y_mid, &dydx_mid, half, y_out);
        evals += self.method.advance(&self.equation, y, dydx, h, &mut y_full);
        self.evaluations += evals;

        for i in 0..N {
            y_err[i] = y_out[i] - y_full[i];
        }

        self.initial.copy_from_slice(&y[..3]);
        self.middle.copy_from_slice(&y_mid[..3]);
        self.last.copy_from_slice(&y_out[..3]);
        Ok(())
    }

    fn order(&self) -> u32 {
        self.method.order()
    }

    fn chord_distance(&mut self) -> f64 {
        chord_deviation(&self.middle, &self.initial, &self.last)
    }

    fn evaluations(&self) -> u64 {
        self.evaluations
    }

    fn relativistic_mass(&self) -> f64 {
        self.equation.relativistic_mass()
    }

    fn parametrization(&self) -> Parametrization {
        self.equation.parametrization()
    }
}
