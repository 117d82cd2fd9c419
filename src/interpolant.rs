//! Hermite interpolation between two stepper end points.
//!
//! Given position, velocity and acceleration at both ends of an interval of
//! length h, the position is reconstructed by the unique quintic matching
//! all six conditions, per spatial component:
//!
//! ```text
//! x(ξ) = p0 + p1 ξ + p2 ξ² + p3 ξ³ + p4 ξ⁴ + p5 ξ⁵,   ξ ∈ [0, 1]
//! ```
//!
//! The velocity is the derivative of that quintic, a quartic, whose
//! coefficients are only built the first time a velocity is requested.
//! No field evaluations are made.

use std::cell::OnceCell;

use crate::error::{IntegrationError, Result};
use crate::tracker::RowView;

/// Quintic position / quartic velocity interpolant over one step.
#[derive(Debug, Clone)]
pub struct Interpolant {
    h: f64,
    position: [[f64; 3]; 6],
    velocity: OnceCell<[[f64; 3]; 5]>,
}

impl Interpolant {
    /// Build from end points `y1`, `y2` (position then velocity), their
    /// accelerations `f1`, `f2`, and the interval length `h`.
    pub fn new(y1: &[f64; 6], y2: &[f64; 6], f1: &[f64; 3], f2: &[f64; 3], h: f64) -> Result<Self> {
        if h == 0.0 || !h.is_finite() {
            return Err(IntegrationError::invalid_input(format!(
                "interpolation interval must be finite and non-zero, got {}",
                h
            )));
        }

        let h2 = 0.5 * h * h;
        let mut p = [[0.0; 3]; 6];
        for k in 0..3 {
            let (x1, v1, a1) = (y1[k], h * y1[k + 3], h2 * f1[k]);
            let (x2, v2, a2) = (y2[k], h * y2[k + 3], h2 * f2[k]);

            p[0][k] = x1;
            p[1][k] = v1;
            p[2][k] = a1;
            p[3][k] = -10.0 * x1 - 6.0 * v1 - 3.0 * a1 + a2 - 4.0 * v2 + 10.0 * x2;
            p[4][k] = 15.0 * x1 + 8.0 * v1 + 3.0 * a1 - 2.0 * a2 + 7.0 * v2 - 15.0 * x2;
            p[5][k] = -6.0 * x1 - 3.0 * v1 - a1 + a2 - 3.0 * v2 + 6.0 * x2;
        }

        Ok(Self {
            h,
            position: p,
            velocity: OnceCell::new(),
        })
    }

    /// Interpolate across one recorded tracker step.
    ///
    /// Uses the start block of `start` and the end block of `end` (often the
    /// same row); the interval is the elapsed tracker time τ, matching the
    /// recorded velocities and accelerations.
    pub fn from_rows(start: &RowView<'_>, end: &RowView<'_>) -> Result<Self> {
        let (s, e) = (start.start(), end.end());
        let mut y1 = [0.0; 6];
        let mut y2 = [0.0; 6];
        y1[..3].copy_from_slice(&s.position());
        y1[3..].copy_from_slice(&s.velocity());
        y2[..3].copy_from_slice(&e.position());
        y2[3..].copy_from_slice(&e.velocity());
        let f1 = s.acceleration();
        let f2 = e.acceleration();

        Self::new(&y1, &y2, &f1, &f2, e.time() - s.time())
    }

    /// Length of the interpolation interval
    pub fn interval(&self) -> f64 {
        self.h
    }

    /// Position at fraction `xi` of the interval
    pub fn interpolate_position(&self, xi: f64) -> [f64; 3] {
        horner(&self.position, xi)
    }

    /// Velocity at fraction `xi` of the interval
    pub fn interpolate_velocity(&self, xi: f64) -> [f64; 3] {
        horner(self.velocity_coefficients(), xi)
    }

    /// Whether the velocity polynomial has been built yet
    pub fn has_velocity_polynomials(&self) -> bool {
        self.velocity.get().is_some()
    }

    fn velocity_coefficients(&self) -> &[[f64; 3]; 5] {
        self.velocity.get_or_init(|| {
            let inv_h = 1.0 / self.h;
            let mut q = [[0.0; 3]; 5];
            for (k, row) in q.iter_mut().enumerate() {
                let factor = (k + 1) as f64 * inv_h;
                for c in 0..3 {
                    row[c] = factor * self.position[k + 1][c];
                }
            }
            q
        })
    }
}

fn horner<const K: usize>(coeffs: &[[f64; 3]; K], xi: f64) -> [f64; 3] {
    let mut out = coeffs[K - 1];
    for row in coeffs[..K - 1].iter().rev() {
        for c in 0..3 {
            out[c] = out[c] * xi + row[c];
        }
    }
    out
}
