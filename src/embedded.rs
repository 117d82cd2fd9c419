//! Embedded Runge-Kutta steppers driven by a Butcher tableau.

use crate::coefficients::{Tableau, CASH_KARP, DORMAND_PRINCE, MAX_STAGES};
use crate::equation::{EquationOfMotion, Parametrization};
use crate::error::Result;
use crate::stepper::{chord_deviation, Stepper};

/// Embedded-pair stepper: the error estimate is a by-product of the stages.
///
/// The chord distance needs the midpoint of the last step. With an FSAL
/// tableau the derivative at the end point is already known and the
/// midpoint comes from cubic Hermite interpolation for free; otherwise an
/// auxiliary half step is taken from the saved start point and its
/// evaluations are reported through `auxiliary_evaluations`.
#[derive(Debug, Clone)]
pub struct EmbeddedRk<E, const N: usize> {
    tableau: Tableau,
    equation: E,
    k: [[f64; N]; MAX_STAGES],
    evaluations: u64,
    auxiliary: u64,
    // Data of the last step, kept for the chord distance
    y_start: [f64; N],
    dydx_start: [f64; N],
    y_end: [f64; N],
    h_last: f64,
}

impl<E: EquationOfMotion<N>, const N: usize> EmbeddedRk<E, N> {
    /// Stepper for an arbitrary embedded tableau
    pub fn with_tableau(tableau: Tableau, equation: E) -> Self {
        Self {
            tableau,
            equation,
            k: [[0.0; N]; MAX_STAGES],
            evaluations: 0,
            auxiliary: 0,
            y_start: [0.0; N],
            dydx_start: [0.0; N],
            y_end: [0.0; N],
            h_last: 0.0,
        }
    }

    /// Cash-Karp 4(5) stepper
    pub fn cash_karp(equation: E) -> Self {
        Self::with_tableau(CASH_KARP, equation)
    }

    /// Dormand-Prince 4(5) stepper
    pub fn dormand_prince(equation: E) -> Self {
        Self::with_tableau(DORMAND_PRINCE, equation)
    }

    /// The tableau in use
    pub fn tableau(&self) -> &Tableau {
        &self.tableau
    }

    /// The equation being integrated
    pub fn equation(&self) -> &E {
        &self.equation
    }

    /// Mutable access to the equation
    pub fn equation_mut(&mut self) -> &mut E {
        &mut self.equation
    }

    /// Fill the stages for a step of `h`; stage 0 is `dydx`.
    #[allow(clippy::needless_range_loop)]
    fn compute_stages(&mut self, y: &[f64; N], dydx: &[f64; N], h: f64) -> u64 {
        let stages = self.tableau.stages;
        let mut y_temp = [0.0; N];
        self.k[0] = *dydx;

        for i in 1..stages {
            for n in 0..N {
                let mut sum = 0.0;
                for j in 0..i {
                    sum += self.tableau.a[i][j] * self.k[j][n];
                }
                y_temp[n] = y[n] + h * sum;
            }
            self.equation.rhs(&y_temp, &mut self.k[i]);
        }
        (stages - 1) as u64
    }

    /// Half step from the saved start point, used for the chord midpoint.
    #[allow(clippy::needless_range_loop)]
    fn auxiliary_midpoint(&mut self) -> [f64; 3] {
        let y = self.y_start;
        let dydx = self.dydx_start;
        let half = 0.5 * self.h_last;
        let evals = self.compute_stages(&y, &dydx, half);
        self.evaluations += evals;
        self.auxiliary += evals;

        let mut mid = [0.0; 3];
        for n in 0..3 {
            let mut sum = 0.0;
            for i in 0..self.tableau.stages {
                sum += self.tableau.b[i] * self.k[i][n];
            }
            mid[n] = y[n] + half * sum;
        }
        mid
    }
}

impl<E: EquationOfMotion<N>, const N: usize> Stepper<N> for EmbeddedRk<E, N> {
    fn rhs(&mut self, y: &[f64; N], dydx: &mut [f64; N]) {
        self.equation.rhs(y, dydx);
        self.evaluations += 1;
    }

    #[allow(clippy::needless_range_loop)]
    fn step(
        &mut self,
        y: &[f64; N],
        dydx: &[f64; N],
        h: f64,
        y_out: &mut [f64; N],
        y_err: &mut [f64; N],
    ) -> Result<()> {
        self.evaluations += self.compute_stages(y, dydx, h);

        let stages = self.tableau.stages;
        for n in 0..N {
            let mut sum = 0.0;
            let mut err = 0.0;
            for i in 0..stages {
                sum += self.tableau.b[i] * self.k[i][n];
                err += self.tableau.b_err[i] * self.k[i][n];
            }
            y_out[n] = y[n] + h * sum;
            y_err[n] = h * err;
        }

        self.y_start = *y;
        self.dydx_start = *dydx;
        self.y_end = *y_out;
        self.h_last = h;
        Ok(())
    }

    fn order(&self) -> u32 {
        self.tableau.order
    }

    fn chord_distance(&mut self) -> f64 {
        let mid = if self.tableau.fsal {
            // Last stage holds the derivative at the end point
            let f1 = self.k[self.tableau.stages - 1];
            let mut mid = [0.0; 3];
            for i in 0..3 {
                mid[i] = 0.5 * (self.y_start[i] + self.y_end[i])
                    + self.h_last / 8.0 * (self.dydx_start[i] - f1[i]);
            }
            mid
        } else {
            self.auxiliary_midpoint()
        };
        chord_deviation(&mid, &self.y_start[..3], &self.y_end[..3])
    }

    fn evaluations(&self) -> u64 {
        self.evaluations
    }

    fn auxiliary_evaluations(&self) -> u64 {
        self.auxiliary
    }

    fn relativistic_mass(&self) -> f64 {
        self.equation.relativistic_mass()
    }

    fn parametrization(&self) -> Parametrization {
        self.equation.parametrization()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::{MagneticEquation, Particle};
    use crate::field::UniformField;
    use crate::state::norm_sq;
    use crate::units::{C_LIGHT, PROTON_MASS_C2, TESLA};

    fn equation() -> MagneticEquation<UniformField> {
        MagneticEquation::new(
            UniformField::new([0.0, 0.0, -TESLA]),
            Particle::proton(0.5 * PROTON_MASS_C2),
        )
    }

    /// Exact position after arc length `s` for momentum along +x in B = -z
    fn circle_position(radius: f64, s: f64) -> [f64; 3] {
        // Proton in -z field turns counter-clockwise seen from +z
        let phi = s / radius;
        [radius * phi.sin(), radius * (1.0 - phi.cos()), 0.0]
    }

    fn run_step(
        stepper: &mut EmbeddedRk<MagneticEquation<UniformField>, 6>,
        h: f64,
    ) -> ([f64; 6], [f64; 6]) {
        let p = stepper.equation().particle().momentum;
        let y = [0.0, 0.0, 0.0, p, 0.0, 0.0];
        let mut dydx = [0.0; 6];
        let mut out = [0.0; 6];
        let mut err = [0.0; 6];
        stepper.rhs(&y, &mut dydx);
        stepper.step(&y, &dydx, h, &mut out, &mut err).unwrap();
        (out, err)
    }

    #[test]
    fn test_cash_karp_accuracy() {
        let mut stepper: EmbeddedRk<_, 6> = EmbeddedRk::cash_karp(equation());
        let p = stepper.equation().particle().momentum;
        let radius = p / (C_LIGHT * TESLA);
        let (out, err) = run_step(&mut stepper, 100.0);
        let exact = circle_position(radius, 100.0);

        let dev = ((out[0] - exact[0]).powi(2) + (out[1] - exact[1]).powi(2)).sqrt();
        println!(
            "Cash-Karp one step: deviation {:.3e}, estimate {:.3e}",
            dev,
            norm_sq(&err[..3]).sqrt()
        );
        assert!(dev < 1e-5, "deviation {}", dev);
        assert!(norm_sq(&err[..3]).sqrt() < 1e-3);
        assert!((norm_sq(&out[3..6]).sqrt() - p).abs() / p < 1e-7);
        assert_eq!(stepper.evaluations(), 6);
    }

    #[test]
    fn test_dormand_prince_accuracy() {
        let mut stepper: EmbeddedRk<_, 6> = EmbeddedRk::dormand_prince(equation());
        let p = stepper.equation().particle().momentum;
        let radius = p / (C_LIGHT * TESLA);
        let (out, _) = run_step(&mut stepper, 100.0);
        let exact = circle_position(radius, 100.0);

        let dev = ((out[0] - exact[0]).powi(2) + (out[1] - exact[1]).powi(2)).sqrt();
        assert!(dev < 1e-5, "deviation {}", dev);
        assert_eq!(stepper.evaluations(), 7);
    }

    #[test]
    fn test_chord_distance_and_auxiliary_evaluations() {
        let mut ck: EmbeddedRk<_, 6> = EmbeddedRk::cash_karp(equation());
        let mut dp: EmbeddedRk<_, 6> = EmbeddedRk::dormand_prince(equation());
        let p = ck.equation().particle().momentum;
        let radius = p / (C_LIGHT * TESLA);
        let h = 200.0;
        let sagitta = radius * (1.0 - (0.5 * h / radius).cos());

        run_step(&mut ck, h);
        run_step(&mut dp, h);
        let before_ck = ck.evaluations();
        let before_dp = dp.evaluations();

        let d_ck = ck.chord_distance();
        let d_dp = dp.chord_distance();
        println!("sagitta {:.6}, CK {:.6}, DP {:.6}", sagitta, d_ck, d_dp);
        assert!((d_ck - sagitta).abs() / sagitta < 1e-4);
        assert!((d_dp - sagitta).abs() / sagitta < 1e-2);

        assert_eq!(ck.auxiliary_evaluations(), 5);
        assert_eq!(ck.evaluations(), before_ck + 5);
        assert_eq!(dp.auxiliary_evaluations(), 0);
        assert_eq!(dp.evaluations(), before_dp);
    }
}
