//! Adaptive step-size driver.
//!
//! [`Driver::accurate_advance`] integrates a [`FieldTrack`] over a requested
//! arc length to a relative accuracy `eps`, splitting the interval into
//! sub-steps whose size is controlled by the stepper's error estimate
//! (Numerical Recipes, "Adaptive Stepsize Control for Runge-Kutta", 16.2).
//!
//! Step resizing uses exponents derived from the stepper order p:
//!
//! ```text
//! h_shrink = safety * h * err^(-1/p)
//! h_grow   = safety * h * err^(-1/(p+1))
//! ```
//!
//! with growth capped at `max_step_increase` (through `errcon`) and
//! shrinking floored at `max_step_decrease`.

use tracing::{debug, info, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{IntegrationError, Result};
use crate::state::{check_state_len, norm_sq, FieldTrack, MAX_STATE_LEN, SPIN};
use crate::stepper::Stepper;
use crate::tracker::{ArmToken, StepTracker};

const PER_MILLION: f64 = 1e-6;
const PER_THOUSAND: f64 = 1e-3;

/// Valid range (exclusive) of the smallest step fraction
pub const SMALLEST_FRACTION_RANGE: (f64, f64) = (1e-16, 1e-8);

/// Driver tuning parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DriverConfig {
    /// Steps at or below this length bypass error control (mm)
    pub hmin: f64,
    /// Safety factor applied to every resize
    pub safety: f64,
    /// Largest growth factor between consecutive steps
    pub max_step_increase: f64,
    /// Smallest shrink factor for a failed trial
    pub max_step_decrease: f64,
    /// Trials per sub-step before the last one is accepted anyway
    pub max_trials: u32,
    /// Sub-step budget per advance, divided by the stepper order
    pub max_step_base: u32,
    /// Stop when the step falls below this fraction of the start arc length
    pub smallest_fraction: f64,
    /// Warnings per driver before further ones drop to debug level
    pub max_warnings: u32,
    /// Keep chord-distance evaluations out of the tracker's counts
    pub exclude_chord_evaluations: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            hmin: 1e-5,
            safety: 0.9,
            max_step_increase: 5.0,
            max_step_decrease: 0.1,
            max_trials: 100,
            max_step_base: 250,
            smallest_fraction: 1e-12,
            max_warnings: 10,
            exclude_chord_evaluations: true,
        }
    }
}

impl DriverConfig {
    /// Set the minimum controlled step
    #[must_use]
    pub fn with_hmin(mut self, hmin: f64) -> Self {
        self.hmin = hmin;
        self
    }

    /// Set the safety factor
    #[must_use]
    pub fn with_safety(mut self, safety: f64) -> Self {
        self.safety = safety;
        self
    }

    /// Set the trial limit per sub-step
    #[must_use]
    pub fn with_max_trials(mut self, max_trials: u32) -> Self {
        self.max_trials = max_trials;
        self
    }

    /// Set the sub-step budget base
    #[must_use]
    pub fn with_max_step_base(mut self, base: u32) -> Self {
        self.max_step_base = base;
        self
    }

    /// Set the smallest step fraction
    #[must_use]
    pub fn with_smallest_fraction(mut self, fraction: f64) -> Self {
        self.smallest_fraction = fraction;
        self
    }

    /// Set the warning budget
    #[must_use]
    pub fn with_max_warnings(mut self, max_warnings: u32) -> Self {
        self.max_warnings = max_warnings;
        self
    }

    /// Choose whether chord-distance evaluations are counted by the tracker
    #[must_use]
    pub fn with_exclude_chord_evaluations(mut self, exclude: bool) -> Self {
        self.exclude_chord_evaluations = exclude;
        self
    }

    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.hmin.is_finite() && self.hmin >= 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "hmin must be finite and non-negative, got {}",
                self.hmin
            )));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(IntegrationError::invalid_input(format!(
                "safety must be in (0, 1], got {}",
                self.safety
            )));
        }
        if !(self.max_step_increase.is_finite() && self.max_step_increase > 1.0) {
            return Err(IntegrationError::invalid_input(format!(
                "max_step_increase must exceed 1, got {}",
                self.max_step_increase
            )));
        }
        if !(self.max_step_decrease > 0.0 && self.max_step_decrease < 1.0) {
            return Err(IntegrationError::invalid_input(format!(
                "max_step_decrease must be in (0, 1), got {}",
                self.max_step_decrease
            )));
        }
        if self.max_trials == 0 || self.max_step_base == 0 {
            return Err(IntegrationError::invalid_input(
                "max_trials and max_step_base must be positive",
            ));
        }
        check_smallest_fraction(self.smallest_fraction)
    }
}

fn check_smallest_fraction(fraction: f64) -> Result<()> {
    let (lo, hi) = SMALLEST_FRACTION_RANGE;
    if fraction > lo && fraction < hi {
        Ok(())
    } else {
        Err(IntegrationError::invalid_input(format!(
            "smallest fraction {} outside ({:e}, {:e})",
            fraction, lo, hi
        )))
    }
}

/// Counters accumulated over the lifetime of a driver.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DriverStats {
    /// Sub-steps attempted by `accurate_advance`
    pub total_steps: u64,
    /// Sub-steps whose chord exceeded the step length
    pub bad_steps: u64,
    /// Sub-steps whose chord stayed within the step length
    pub good_steps: u64,
    /// Sub-steps that met the tolerance on the first trial
    pub full_integrations: u64,
    /// Sub-steps that needed a smaller step or missed the tolerance
    pub partial_integrations: u64,
    /// Sub-steps at or below `hmin`
    pub small_steps: u64,
    /// Small steps taken as the first sub-step of an advance
    pub initial_small_steps: u64,
    /// Largest error of a small step (mm)
    pub max_small_step_error: f64,
    /// Summed error of small steps (mm)
    pub small_step_position_error: f64,
    /// Summed squared normalized position error of controlled steps
    pub large_step_position_error: f64,
    /// Summed squared normalized momentum error of controlled steps, times h²
    pub large_step_momentum_error: f64,
    /// Total length of small steps (mm)
    pub small_step_length: f64,
    /// Total length of controlled steps (mm)
    pub large_step_length: f64,
    /// Trials abandoned because the step could no longer change x
    pub underflows: u64,
    /// Trials rejected for exceeding the tolerance
    pub rejected_trials: u64,
    /// Advances that ran out of sub-steps
    pub too_many_steps: u64,
}

/// Rate-limiting state for the driver's warnings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    /// Warnings issued so far
    pub warnings: u32,
    /// Largest relative excess of an end-point distance over its step
    pub max_rel_error: f64,
}

impl Diagnostics {
    /// Count a warning; false once the budget is spent.
    fn note_warning(&mut self, limit: u32) -> bool {
        self.warnings = self.warnings.saturating_add(1);
        self.warnings <= limit
    }
}

macro_rules! warn_limited {
    ($self:ident, $($arg:tt)+) => {
        if $self.diagnostics.note_warning($self.config.max_warnings) {
            warn!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Result of one error-controlled sub-step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoodStep {
    /// Length actually integrated
    pub hdid: f64,
    /// Suggested length of the next sub-step
    pub hnext: f64,
    /// Squared normalized error of the accepted trial
    pub error_sq: f64,
}

/// Result of one uncontrolled step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuickStep {
    /// Deviation of the path from its chord
    pub chord_distance: f64,
    /// Combined error length (mm)
    pub error: f64,
    /// Squared position error (mm²)
    pub error_position_sq: f64,
    /// Squared momentum error relative to the start momentum
    pub error_momentum_rel_sq: f64,
}

/// Adaptive driver around a single-step solver.
#[derive(Debug, Clone)]
pub struct Driver<S, const N: usize> {
    stepper: S,
    config: DriverConfig,
    pshrink: f64,
    pgrow: f64,
    errcon: f64,
    max_steps: u32,
    stats: DriverStats,
    diagnostics: Diagnostics,
    tracker: Option<StepTracker>,
}

impl<S: Stepper<N>, const N: usize> Driver<S, N> {
    /// Create a driver for `stepper`
    pub fn new(stepper: S, config: DriverConfig) -> Result<Self> {
        check_state_len::<N>()?;
        config.validate()?;

        let mut driver = Self {
            stepper,
            pshrink: 0.0,
            pgrow: 0.0,
            errcon: 0.0,
            max_steps: 0,
            config,
            stats: DriverStats::default(),
            diagnostics: Diagnostics::default(),
            tracker: None,
        };
        driver.adjust_to_stepper();
        Ok(driver)
    }

    fn adjust_to_stepper(&mut self) {
        self.reset_parameters(self.config.safety);
        self.max_steps = (self.config.max_step_base / self.stepper.order().max(1)).max(1);
    }

    /// Integrate `track` over arc length `hstep` with relative accuracy `eps`.
    ///
    /// `hinitial`, when in (1e-6·hstep, hstep), is used as the first trial
    /// step. On return the track holds the final state and arc length, also
    /// when the advance stopped early. Returns whether the whole interval
    /// was covered.
    pub fn accurate_advance(
        &mut self,
        track: &mut FieldTrack<N>,
        hstep: f64,
        eps: f64,
        hinitial: f64,
    ) -> Result<bool> {
        if !hstep.is_finite() || hstep < 0.0 {
            return Err(IntegrationError::invalid_input(format!(
                "requested step must be finite and non-negative, got {}",
                hstep
            )));
        }
        if hstep == 0.0 {
            warn_limited!(self, hstep, "proposed step is zero");
            return Ok(true);
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "accuracy must be positive and finite, got {}",
                eps
            )));
        }
        self.prepare_tracker(track)?;

        let hmin = self.config.hmin;
        let start_curve_length = track.curve_length;
        let x1 = start_curve_length;
        let x2 = x1 + hstep;

        let mut h = if hinitial > 0.0 && hinitial < hstep && hinitial > PER_MILLION * hstep {
            hinitial
        } else {
            hstep
        };

        let mut y = track.y;
        let mut dydx = [0.0; N];
        let mut x = x1;
        let mut last_step = false;
        let mut nstp: u32 = 1;

        loop {
            let start_pos = [y[0], y[1], y[2]];
            let y_start = y;

            self.stepper.rhs(&y, &mut dydx);
            self.stats.total_steps += 1;

            let hdid;
            let hnext;
            let step_succeeded;

            if h > hmin {
                let good = self.one_good_step(&mut y, &dydx, &mut x, h, eps)?;
                hdid = good.hdid;
                hnext = good.hnext;
                step_succeeded = hdid == h;
            } else {
                if h == 0.0 {
                    return Err(IntegrationError::StepBecameZero { x });
                }
                let mut sub = FieldTrack { y, curve_length: x };
                let quick = self.quick_advance(&mut sub, &dydx, h, None)?;
                y = sub.y;

                self.stats.small_steps += 1;
                self.stats.max_small_step_error = self.stats.max_small_step_error.max(quick.error);
                self.stats.small_step_position_error += quick.error;
                self.stats.small_step_length += h;
                if nstp <= 1 {
                    self.stats.initial_small_steps += 1;
                }

                let dyerr = quick.error / h;
                hdid = h;
                x += hdid;
                hnext = self.compute_new_step_size(dyerr / eps, h);
                step_succeeded = dyerr <= eps;
            }
            self.record_accepted(&y_start, &dydx, &y, hdid)?;

            if step_succeeded {
                self.stats.full_integrations += 1;
            } else {
                self.stats.partial_integrations += 1;
            }

            // The chord cannot be longer than the path
            let moved = [y[0] - start_pos[0], y[1] - start_pos[1], y[2] - start_pos[2]];
            let end_point_dist = norm_sq(&moved).sqrt();
            if end_point_dist >= hdid * (1.0 + PER_MILLION) {
                self.stats.bad_steps += 1;
                if end_point_dist >= hdid * (1.0 + PER_THOUSAND) {
                    let excess = end_point_dist / hdid - 1.0;
                    self.diagnostics.max_rel_error = self.diagnostics.max_rel_error.max(excess);
                    warn_limited!(
                        self,
                        end_point_dist,
                        hdid,
                        eps,
                        bad_steps = self.stats.bad_steps,
                        "end point further than step length"
                    );
                }
            } else {
                self.stats.good_steps += 1;
            }

            if h < eps * hstep || h < self.config.smallest_fraction * start_curve_length {
                last_step = true;
            } else {
                if hnext.abs() <= hmin {
                    // A short final interval legitimately needs a short step
                    if x < x2 * (1.0 - eps) && hstep > hmin {
                        warn_limited!(
                            self,
                            hnext,
                            hstep,
                            h,
                            done = x - x1,
                            step = nstp,
                            hmin,
                            "next step size below minimum"
                        );
                    }
                    h = hmin;
                } else {
                    h = hnext;
                }

                if x + h > x2 {
                    h = x2 - x;
                }
                if h == 0.0 {
                    debug!(x, x2, "step became zero through round-off, stopping");
                    last_step = true;
                }
            }

            let more = nstp <= self.max_steps && x < x2 && !last_step;
            nstp += 1;
            if !more {
                break;
            }
        }

        let succeeded = x >= x2;
        track.y = y;
        track.curve_length = x;

        if nstp > self.max_steps && !succeeded {
            self.stats.too_many_steps += 1;
            warn_limited!(
                self,
                fraction_done = (x - x1) / (x2 - x1),
                max_steps = self.max_steps,
                "too many steps, integration of the interval not completed"
            );
        }

        Ok(succeeded)
    }

    /// One error-controlled sub-step starting at arc length `x`.
    ///
    /// Trial steps shrink until the error estimate meets `eps`, the trial
    /// limit is reached or the step no longer changes `x`. `y` and `x` are
    /// replaced by the values at the end of the step actually taken.
    pub fn one_good_step(
        &mut self,
        y: &mut [f64; N],
        dydx: &[f64; N],
        x: &mut f64,
        htry: f64,
        eps: f64,
    ) -> Result<GoodStep> {
        let inv_eps_sq = 1.0 / (eps * eps);
        let momentum_sq = norm_sq(&y[3..6]);
        let spin_sq = if N == MAX_STATE_LEN {
            norm_sq(&y[SPIN..SPIN + 3])
        } else {
            0.0
        };

        let mut y_temp = [0.0; N];
        let mut y_err = [0.0; N];
        let mut h = htry;
        let mut h_used = h;
        let mut errpos_sq = 0.0;
        let mut errmom_sq = 0.0;
        let mut errmax_sq = 0.0;

        for _ in 0..self.config.max_trials {
            self.stepper.step(y, dydx, h, &mut y_temp, &mut y_err)?;
            h_used = h;

            let eps_pos = eps * h.max(self.config.hmin);
            errpos_sq = norm_sq(&y_err[..3]) / (eps_pos * eps_pos);
            errmom_sq = if momentum_sq > 0.0 {
                norm_sq(&y_err[3..6]) / momentum_sq * inv_eps_sq
            } else {
                0.0
            };
            errmax_sq = errpos_sq.max(errmom_sq);
            if spin_sq > 0.0 {
                let errspin_sq = norm_sq(&y_err[SPIN..SPIN + 3]) / spin_sq * inv_eps_sq;
                errmax_sq = errmax_sq.max(errspin_sq);
            }

            if errmax_sq <= 1.0 {
                break;
            }

            self.stats.rejected_trials += 1;
            let shrunk = self.config.safety * h * errmax_sq.powf(0.5 * self.pshrink);
            h = shrunk.max(self.config.max_step_decrease * h);

            if *x + h == *x {
                self.stats.underflows += 1;
                warn_limited!(
                    self,
                    x = *x,
                    h,
                    htry,
                    "step size underflow, accepting last trial"
                );
                break;
            }
        }

        self.stats.large_step_length += h_used;
        self.stats.large_step_position_error += errpos_sq;
        self.stats.large_step_momentum_error += errmom_sq * h_used * h_used;

        let hnext = if errmax_sq > self.errcon * self.errcon {
            self.config.safety * h_used * errmax_sq.powf(0.5 * self.pgrow)
        } else {
            self.config.max_step_increase * h_used
        };

        *x += h_used;
        *y = y_temp;

        Ok(GoodStep {
            hdid: h_used,
            hnext,
            error_sq: errmax_sq,
        })
    }

    /// One uncontrolled step of exactly `h`.
    ///
    /// The track is moved to the step's end. With a `token` the step is
    /// recorded by the attached tracker.
    pub fn quick_advance(
        &mut self,
        track: &mut FieldTrack<N>,
        dydx: &[f64; N],
        h: f64,
        token: Option<ArmToken>,
    ) -> Result<QuickStep> {
        let y_in = track.y;
        let mut y_out = [0.0; N];
        let mut y_err = [0.0; N];
        self.stepper.step(&y_in, dydx, h, &mut y_out, &mut y_err)?;

        let aux_before = self.stepper.auxiliary_evaluations();
        let chord_distance = self.stepper.chord_distance();
        let aux = self.stepper.auxiliary_evaluations() - aux_before;
        if self.config.exclude_chord_evaluations {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.exclude_evaluations(aux);
            }
        }

        track.y = y_out;
        track.curve_length += h;

        let momentum_sq = norm_sq(&y_in[3..6]);
        let error_position_sq = norm_sq(&y_err[..3]);
        let error_momentum_rel_sq = if momentum_sq > 0.0 {
            norm_sq(&y_err[3..6]) / momentum_sq
        } else {
            0.0
        };
        let error = if error_position_sq > error_momentum_rel_sq * h * h {
            error_position_sq.sqrt()
        } else {
            error_momentum_rel_sq.sqrt() * h
        };

        if let Some(token) = token {
            self.record_step(token, &y_in, dydx, &y_out, h)?;
        }

        Ok(QuickStep {
            chord_distance,
            error,
            error_position_sq,
            error_momentum_rel_sq,
        })
    }

    /// Initialize an attached, windowed tracker that has not seen a state yet.
    pub(crate) fn prepare_tracker(&mut self, track: &FieldTrack<N>) -> Result<()> {
        let mass = self.stepper.relativistic_mass();
        let parametrization = self.stepper.parametrization();
        if let Some(tracker) = self.tracker.as_mut() {
            if tracker.within_window() && !tracker.is_initialized() {
                tracker.initialize(track, mass, parametrization)?;
            }
        }
        Ok(())
    }

    fn record_step(
        &mut self,
        token: ArmToken,
        y0: &[f64; N],
        dydx0: &[f64; N],
        y1: &[f64; N],
        h: f64,
    ) -> Result<bool> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(false);
        };
        if !tracker.within_window() {
            return tracker.record_result(token, y0, dydx0, y1, dydx0, h, self.stepper.evaluations());
        }

        let mut dydx1 = [0.0; N];
        self.stepper.rhs(y1, &mut dydx1);
        tracker.exclude_evaluations(1);
        tracker.record_result(token, y0, dydx0, y1, &dydx1, h, self.stepper.evaluations())
    }

    fn record_accepted(
        &mut self,
        y0: &[f64; N],
        dydx0: &[f64; N],
        y1: &[f64; N],
        hdid: f64,
    ) -> Result<()> {
        let token = match self.tracker.as_mut() {
            Some(tracker) if tracker.within_window() => tracker.arm(),
            _ => return Ok(()),
        };
        if self.record_step(token, y0, dydx0, y1, hdid)? {
            if let Some(tracker) = self.tracker.as_mut() {
                let dt = hdid / tracker.last_velocity();
                tracker.update_time_arclength(dt, hdid);
            }
        }
        Ok(())
    }

    /// New step from a normalized error, without limits on the change.
    pub fn compute_new_step_size(&self, err_norm: f64, h: f64) -> f64 {
        if err_norm > 1.0 {
            self.config.safety * h * err_norm.powf(self.pshrink)
        } else if err_norm > 0.0 {
            self.config.safety * h * err_norm.powf(self.pgrow)
        } else {
            self.config.max_step_increase * h
        }
    }

    /// New step from a normalized error, limited to the configured factors.
    pub fn compute_new_step_size_within_limits(&self, err_norm: f64, h: f64) -> f64 {
        if err_norm > 1.0 {
            let shrunk = self.config.safety * h * err_norm.powf(self.pshrink);
            shrunk.max(self.config.max_step_decrease * h)
        } else if err_norm > self.errcon {
            self.config.safety * h * err_norm.powf(self.pgrow)
        } else {
            self.config.max_step_increase * h
        }
    }

    /// Derivative of the equation of motion at `track`
    pub fn get_derivatives(&mut self, track: &FieldTrack<N>, dydx: &mut [f64; N]) {
        self.stepper.rhs(&track.y, dydx);
    }

    /// Recompute the exponents for the stepper order and set the safety factor.
    pub fn reset_parameters(&mut self, safety: f64) {
        let order = f64::from(self.stepper.order());
        self.config.safety = safety;
        self.pshrink = -1.0 / order;
        self.pgrow = -1.0 / (1.0 + order);
        self.compute_errcon();
    }

    fn compute_errcon(&mut self) -> f64 {
        self.errcon = (self.config.max_step_increase / self.config.safety).powf(1.0 / self.pgrow);
        self.errcon
    }

    /// Replace the stepper and re-derive the exponents
    pub fn renew_stepper(&mut self, stepper: S) -> S {
        let old = std::mem::replace(&mut self.stepper, stepper);
        self.adjust_to_stepper();
        old
    }

    /// Set the safety factor
    pub fn set_safety(&mut self, safety: f64) {
        self.config.safety = safety;
        self.compute_errcon();
    }

    /// Set the grow exponent
    pub fn set_pgrow(&mut self, pgrow: f64) {
        self.pgrow = pgrow;
        self.compute_errcon();
    }

    /// Override the growth threshold
    pub fn set_errcon(&mut self, errcon: f64) {
        self.errcon = errcon;
    }

    /// Set the minimum controlled step
    pub fn set_hmin(&mut self, hmin: f64) {
        self.config.hmin = hmin;
    }

    /// Set the sub-step budget per advance
    pub fn set_max_steps(&mut self, max_steps: u32) {
        self.max_steps = max_steps;
    }

    /// Set the smallest step fraction; out-of-range values are rejected and
    /// the current value is kept.
    pub fn set_smallest_fraction(&mut self, fraction: f64) -> Result<()> {
        if let Err(err) = check_smallest_fraction(fraction) {
            warn_limited!(
                self,
                proposed = fraction,
                kept = self.config.smallest_fraction,
                "smallest fraction not changed"
            );
            return Err(err);
        }
        self.config.smallest_fraction = fraction;
        Ok(())
    }

    /// Spend one warning from the budget; false once it is exhausted.
    pub(crate) fn note_warning(&mut self) -> bool {
        self.diagnostics.note_warning(self.config.max_warnings)
    }

    /// Minimum controlled step
    pub fn hmin(&self) -> f64 {
        self.config.hmin
    }

    /// Safety factor
    pub fn safety(&self) -> f64 {
        self.config.safety
    }

    /// Shrink exponent
    pub fn pshrink(&self) -> f64 {
        self.pshrink
    }

    /// Grow exponent
    pub fn pgrow(&self) -> f64 {
        self.pgrow
    }

    /// Growth threshold
    pub fn errcon(&self) -> f64 {
        self.errcon
    }

    /// Sub-step budget per advance
    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// Smallest step fraction
    pub fn smallest_fraction(&self) -> f64 {
        self.config.smallest_fraction
    }

    /// Current configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The stepper
    pub fn stepper(&self) -> &S {
        &self.stepper
    }

    /// Mutable access to the stepper
    pub fn stepper_mut(&mut self) -> &mut S {
        &mut self.stepper
    }

    /// Accumulated statistics
    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Clear the statistics
    pub fn reset_stats(&mut self) {
        self.stats = DriverStats::default();
    }

    /// Warning state
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Attach a tracker, returning the one it replaces
    pub fn attach_tracker(&mut self, tracker: StepTracker) -> Option<StepTracker> {
        self.tracker.replace(tracker)
    }

    /// Detach the tracker
    pub fn detach_tracker(&mut self) -> Option<StepTracker> {
        self.tracker.take()
    }

    /// The attached tracker
    pub fn tracker(&self) -> Option<&StepTracker> {
        self.tracker.as_ref()
    }

    /// Mutable access to the attached tracker
    pub fn tracker_mut(&mut self) -> Option<&mut StepTracker> {
        self.tracker.as_mut()
    }

    /// Log the accumulated statistics.
    pub fn report_statistics(&self) {
        let s = &self.stats;
        let small_fraction = if s.total_steps > 0 {
            s.small_steps as f64 / s.total_steps as f64
        } else {
            0.0
        };
        info!(
            total_steps = s.total_steps,
            good_steps = s.good_steps,
            bad_steps = s.bad_steps,
            small_steps = s.small_steps,
            initial_small_steps = s.initial_small_steps,
            small_fraction,
            rejected_trials = s.rejected_trials,
            underflows = s.underflows,
            too_many_steps = s.too_many_steps,
            "driver step statistics"
        );
        info!(
            max_small_step_error = s.max_small_step_error,
            small_step_position_error = s.small_step_position_error,
            small_step_length = s.small_step_length,
            large_step_position_error = s.large_step_position_error,
            large_step_momentum_error = s.large_step_momentum_error,
            large_step_length = s.large_step_length,
            max_rel_error = self.diagnostics.max_rel_error,
            "driver error statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::Parametrization;
    use crate::tracker::RowLayout;

    /// Straight-line motion along the momentum, with a fixed error estimate.
    /// `stretch` scales the distance moved per unit step.
    struct StraightLine {
        error: f64,
        stretch: f64,
        evaluations: u64,
    }

    impl StraightLine {
        fn new(error: f64) -> Self {
            Self {
                error,
                stretch: 1.0,
                evaluations: 0,
            }
        }
    }

    impl Stepper<6> for StraightLine {
        fn rhs(&mut self, y: &[f64; 6], dydx: &mut [f64; 6]) {
            let p = norm_sq(&y[3..6]).sqrt();
            *dydx = [0.0; 6];
            for i in 0..3 {
                dydx[i] = y[3 + i] / p;
            }
            self.evaluations += 1;
        }

        fn step(
            &mut self,
            y: &[f64; 6],
            dydx: &[f64; 6],
            h: f64,
            y_out: &mut [f64; 6],
            y_err: &mut [f64; 6],
        ) -> Result<()> {
            for i in 0..6 {
                y_out[i] = y[i] + self.stretch * h * dydx[i];
                y_err[i] = self.error;
            }
            Ok(())
        }

        fn order(&self) -> u32 {
            4
        }

        fn chord_distance(&mut self) -> f64 {
            0.0
        }

        fn evaluations(&self) -> u64 {
            self.evaluations
        }

        fn relativistic_mass(&self) -> f64 {
            1.0
        }

        fn parametrization(&self) -> Parametrization {
            Parametrization::ArcLength
        }
    }

    fn track() -> FieldTrack<6> {
        FieldTrack::new([0.0, 0.0, 0.0, 1.0, 0.0, 0.0], 0.0).unwrap()
    }

    fn driver(error: f64) -> Driver<StraightLine, 6> {
        Driver::new(StraightLine::new(error), DriverConfig::default()).unwrap()
    }

    // ==================== Parameters ====================

    #[test]
    fn test_exponents_from_order() {
        let d = driver(0.0);
        assert!((d.pshrink() + 0.25).abs() < 1e-15);
        assert!((d.pgrow() + 0.2).abs() < 1e-15);
        let expected = (5.0f64 / 0.9).powf(-5.0);
        assert!((d.errcon() - expected).abs() < 1e-15, "errcon = {}", d.errcon());
        assert_eq!(d.max_steps(), 62);
    }

    #[test]
    fn test_compute_new_step_size() {
        let d = driver(0.0);
        let shrink = d.compute_new_step_size(16.0, 1.0);
        assert!((shrink - 0.9 * 0.5).abs() < 1e-12, "shrink = {}", shrink);
        let grow = d.compute_new_step_size(0.5f64.powi(5), 1.0);
        assert!((grow - 1.8).abs() < 1e-12, "grow = {}", grow);
        assert_eq!(d.compute_new_step_size(0.0, 2.0), 10.0);
    }

    #[test]
    fn test_compute_new_step_size_within_limits() {
        let d = driver(0.0);
        // Shrink floored at a tenth
        assert!((d.compute_new_step_size_within_limits(1e12, 1.0) - 0.1).abs() < 1e-15);
        // Below errcon the growth is capped
        assert_eq!(d.compute_new_step_size_within_limits(1e-6, 1.0), 5.0);
        let grow = d.compute_new_step_size_within_limits(0.5f64.powi(5), 1.0);
        assert!((grow - 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_setters_recompute_errcon() {
        let mut d = driver(0.0);
        d.set_safety(0.8);
        assert!((d.errcon() - (5.0f64 / 0.8).powf(-5.0)).abs() < 1e-15);
        d.set_pgrow(-0.25);
        assert!((d.errcon() - (5.0f64 / 0.8).powf(-4.0)).abs() < 1e-15);
        d.set_errcon(1e-3);
        assert_eq!(d.errcon(), 1e-3);
        d.reset_parameters(0.9);
        assert!((d.pgrow() + 0.2).abs() < 1e-15);
    }

    #[test]
    fn test_smallest_fraction_range() {
        let mut d = driver(0.0);
        assert!(d.set_smallest_fraction(1e-10).is_ok());
        assert_eq!(d.smallest_fraction(), 1e-10);
        assert!(matches!(
            d.set_smallest_fraction(1e-6),
            Err(IntegrationError::InvalidInput { .. })
        ));
        assert!(d.set_smallest_fraction(1e-16).is_err());
        assert_eq!(d.smallest_fraction(), 1e-10);
        assert_eq!(d.diagnostics().warnings, 2);
    }

    #[test]
    fn test_rejected_settings_share_warning_budget() {
        let config = DriverConfig::default().with_max_warnings(1);
        let mut d = Driver::new(StraightLine::new(0.0), config).unwrap();
        for _ in 0..3 {
            assert!(d.set_smallest_fraction(0.5).is_err());
        }
        assert_eq!(d.diagnostics().warnings, 3);
        assert!(!d.note_warning());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = DriverConfig::default().with_safety(1.5);
        assert!(Driver::new(StraightLine::new(0.0), bad).is_err());
        let bad = DriverConfig::default().with_smallest_fraction(0.1);
        assert!(Driver::new(StraightLine::new(0.0), bad).is_err());
    }

    // ==================== AccurateAdvance ====================

    #[test]
    fn test_zero_and_negative_requests() {
        let mut d = driver(0.0);
        let mut t = track();
        assert!(d.accurate_advance(&mut t, 0.0, 1e-6, 0.0).unwrap());
        assert_eq!(t, track());

        let result = d.accurate_advance(&mut t, -1.0, 1e-6, 0.0);
        assert!(matches!(result, Err(IntegrationError::InvalidInput { .. })));
        assert_eq!(t, track());

        assert!(d.accurate_advance(&mut t, 1.0, 0.0, 0.0).is_err());
        assert!(d.accurate_advance(&mut t, f64::NAN, 1e-6, 0.0).is_err());
        assert_eq!(d.stats().total_steps, 0);
    }

    #[test]
    fn test_exact_stepper_single_step() {
        let mut d = driver(0.0);
        let mut t = track();
        assert!(d.accurate_advance(&mut t, 100.0, 1e-6, 0.0).unwrap());
        assert_eq!(t.curve_length, 100.0);
        assert!((t.y[0] - 100.0).abs() < 1e-12);
        assert_eq!(d.stats().total_steps, 1);
        assert_eq!(d.stats().good_steps, 1);
    }

    #[test]
    fn test_initial_step_and_growth() {
        let mut d = driver(0.0);
        let mut t = track();
        // 10, then 5x growth to 50, then clamped to the remaining 40
        assert!(d.accurate_advance(&mut t, 100.0, 1e-6, 10.0).unwrap());
        assert_eq!(d.stats().total_steps, 3);
        assert_eq!(t.curve_length, 100.0);

        // Too small an initial guess is ignored
        let mut d = driver(0.0);
        let mut t = track();
        d.accurate_advance(&mut t, 100.0, 1e-6, 1e-5).unwrap();
        assert_eq!(d.stats().total_steps, 1);
    }

    #[test]
    fn test_endpoint_too_far_counts_bad_step() {
        let mut stepper = StraightLine::new(0.0);
        stepper.stretch = 2.0;
        let mut d = Driver::new(stepper, DriverConfig::default()).unwrap();
        let mut t = track();
        d.accurate_advance(&mut t, 10.0, 1e-6, 0.0).unwrap();
        assert_eq!(d.stats().bad_steps, 1);
        assert_eq!(d.stats().good_steps, 0);
        assert!((d.diagnostics().max_rel_error - 1.0).abs() < 1e-12);
        assert_eq!(d.diagnostics().warnings, 1);
    }

    #[test]
    fn test_sub_floor_steps_use_quick_advance() {
        let config = DriverConfig::default().with_hmin(1.0);
        let mut d = Driver::new(StraightLine::new(0.0), config).unwrap();
        let mut t = track();
        assert!(d.accurate_advance(&mut t, 0.5, 1e-6, 0.0).unwrap());
        assert_eq!(d.stats().small_steps, 1);
        assert_eq!(d.stats().initial_small_steps, 1);
        assert_eq!(t.curve_length, 0.5);
    }

    #[test]
    fn test_too_many_steps() {
        let mut d = driver(0.0);
        d.set_max_steps(2);
        let mut t = track();
        // 10 + 50 + 250 before the budget runs out
        let done = d.accurate_advance(&mut t, 1000.0, 1e-6, 10.0).unwrap();
        assert!(!done);
        assert_eq!(d.stats().too_many_steps, 1);
        assert_eq!(d.stats().total_steps, 3);
        assert_eq!(t.curve_length, 310.0);
        assert_eq!(d.diagnostics().warnings, 1);
    }

    #[test]
    fn test_target_reached_on_last_allowed_step() {
        let mut d = driver(0.0);
        d.set_max_steps(2);
        let mut t = track();
        // 10 then 50 lands exactly on the end of the interval
        let done = d.accurate_advance(&mut t, 60.0, 1e-6, 10.0).unwrap();
        assert!(done);
        assert_eq!(t.curve_length, 60.0);
        assert_eq!(d.stats().total_steps, 2);
        assert_eq!(d.stats().too_many_steps, 0);
        assert_eq!(d.diagnostics().warnings, 0);
    }

    // ==================== OneGoodStep ====================

    #[test]
    fn test_trial_limit_reports_step_taken() {
        let mut d = driver(1.0);
        let mut t = track();
        let mut dydx = [0.0; 6];
        d.get_derivatives(&t, &mut dydx);
        let mut x = 0.0;
        let step = d.one_good_step(&mut t.y, &dydx, &mut x, 1e-6, 1e-3).unwrap();

        assert_eq!(d.stats().rejected_trials, 100);
        assert_eq!(x, step.hdid);
        // Output belongs to the last trial, not the unused shrunk length
        assert!((t.y[0] - step.hdid).abs() < 1e-300 + step.hdid * 1e-12);
        assert!(step.hdid < 1e-100, "hdid = {:e}", step.hdid);
    }

    #[test]
    fn test_underflow_accepts_last_trial() {
        let mut d = driver(1.0);
        let mut t = track();
        let mut dydx = [0.0; 6];
        d.get_derivatives(&t, &mut dydx);
        let mut x = 1.0e6;
        let step = d.one_good_step(&mut t.y, &dydx, &mut x, 1e-6, 1e-3).unwrap();

        assert_eq!(d.stats().underflows, 1);
        assert!(step.hdid > 1e-11 && step.hdid < 1e-9, "hdid = {:e}", step.hdid);
        assert!(d.stats().rejected_trials < 100);
    }

    // ==================== QuickAdvance ====================

    #[test]
    fn test_quick_advance_error_measure() {
        let mut d = driver(0.01);
        let mut t = track();
        let mut dydx = [0.0; 6];
        d.get_derivatives(&t, &mut dydx);
        let q = d.quick_advance(&mut t, &dydx, 2.0, None).unwrap();

        assert_eq!(t.curve_length, 2.0);
        assert!((q.error_position_sq - 3e-4).abs() < 1e-15);
        assert!((q.error_momentum_rel_sq - 3e-4).abs() < 1e-15);
        // Position error is below the momentum error scaled by h
        assert!((q.error - 3e-4f64.sqrt() * 2.0).abs() < 1e-12);
    }

    // ==================== Tracking ====================

    #[test]
    fn test_accepted_steps_are_recorded() {
        let mut d = driver(0.0);
        d.attach_tracker(StepTracker::new(RowLayout::Compact));
        if let Some(tracker) = d.tracker_mut() {
            tracker.begin_window();
        }
        let mut t = track();
        d.accurate_advance(&mut t, 100.0, 1e-6, 10.0).unwrap();

        let tracker = d.tracker().unwrap();
        assert_eq!(tracker.len(), 3);
        let ends: Vec<f64> = tracker.rows().map(|r| r.end().arclength()).collect();
        assert_eq!(ends, vec![10.0, 60.0, 100.0]);
        // The end-point derivative for each row is excluded
        assert_eq!(tracker.evaluation_counts(), &[1, 2, 3]);
        assert_eq!(tracker.last_curve_length(), 100.0);
    }

    #[test]
    fn test_quick_advance_records_only_when_armed() {
        let mut d = driver(0.0);
        d.attach_tracker(StepTracker::default());
        let mut t = track();
        if let Some(tracker) = d.tracker_mut() {
            tracker.begin_window();
        }
        d.prepare_tracker(&t).unwrap();

        let mut dydx = [0.0; 6];
        d.get_derivatives(&t, &mut dydx);
        d.quick_advance(&mut t, &dydx, 1.0, None).unwrap();
        assert!(d.tracker().unwrap().is_empty());

        let token = d.tracker_mut().unwrap().arm();
        d.quick_advance(&mut t, &dydx, 1.0, Some(token)).unwrap();
        assert_eq!(d.tracker().unwrap().len(), 1);
        assert!(!d.tracker().unwrap().is_armed());
    }
}
