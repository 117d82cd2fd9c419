//! Chord-limited advance.
//!
//! A step is first sized so that the straight chord between its end points
//! stays within `delta_chord` of the curved path. That length is then
//! integrated, with a single quick step when its error is already small
//! enough, otherwise through [`Driver::accurate_advance`]. The tracker
//! window is open for the duration of the advance.

use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::driver::{Driver, QuickStep};
use crate::error::{IntegrationError, Result};
use crate::state::FieldTrack;
use crate::stepper::Stepper;

/// Chord finder parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChordConfig {
    /// Largest allowed deviation of the path from its chord (mm)
    pub delta_chord: f64,
    /// Fraction of the previous estimate used as the first trial
    pub first_fraction: f64,
    /// The full requested step is tried when the previous estimate reaches
    /// this fraction of it
    pub fraction_last: f64,
    /// Fraction of the chord-based estimate used for the next trial
    pub fraction_next: f64,
    /// Trials before the last one is used regardless of its chord
    pub max_trials: u32,
}

impl Default for ChordConfig {
    fn default() -> Self {
        Self {
            delta_chord: 0.25,
            first_fraction: 0.999,
            fraction_last: 1.0,
            fraction_next: 0.98,
            max_trials: 100,
        }
    }
}

impl ChordConfig {
    /// Set the chord tolerance
    #[must_use]
    pub fn with_delta_chord(mut self, delta_chord: f64) -> Self {
        self.delta_chord = delta_chord;
        self
    }

    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.delta_chord.is_finite() && self.delta_chord > 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "delta_chord must be positive, got {}",
                self.delta_chord
            )));
        }
        for (name, value) in [
            ("first_fraction", self.first_fraction),
            ("fraction_last", self.fraction_last),
            ("fraction_next", self.fraction_next),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(IntegrationError::invalid_input(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.max_trials == 0 {
            return Err(IntegrationError::invalid_input("max_trials must be positive"));
        }
        Ok(())
    }
}

/// Sizes steps by chord distance and integrates them through a [`Driver`].
#[derive(Debug, Clone)]
pub struct ChordFinder<S, const N: usize> {
    driver: Driver<S, N>,
    config: ChordConfig,
    last_step_estimate: f64,
    trials: u64,
    calls: u64,
}

impl<S: Stepper<N>, const N: usize> ChordFinder<S, N> {
    /// Wrap `driver`
    pub fn new(driver: Driver<S, N>, config: ChordConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            driver,
            config,
            last_step_estimate: f64::INFINITY,
            trials: 0,
            calls: 0,
        })
    }

    /// Advance `track` by at most `step_max`, keeping the chord within
    /// `delta_chord` and the error within `eps`.
    ///
    /// Returns the arc length actually covered.
    pub fn advance_chord_limited(
        &mut self,
        track: &mut FieldTrack<N>,
        step_max: f64,
        eps: f64,
    ) -> Result<f64> {
        if !(step_max.is_finite() && step_max > 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "maximum step must be positive and finite, got {}",
                step_max
            )));
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "accuracy must be positive and finite, got {}",
                eps
            )));
        }

        if let Some(tracker) = self.driver.tracker_mut() {
            tracker.begin_window();
        }
        let result = self.advance_in_window(track, step_max, eps);
        if let Some(tracker) = self.driver.tracker_mut() {
            tracker.disarm();
            tracker.end_window();
        }
        result
    }

    fn advance_in_window(
        &mut self,
        track: &mut FieldTrack<N>,
        step_max: f64,
        eps: f64,
    ) -> Result<f64> {
        self.driver.prepare_tracker(track)?;
        self.calls += 1;

        let start_curve_length = track.curve_length;
        let (end, step_possible, quick) = self.find_next_chord(track, step_max)?;

        if quick.error < eps * step_possible {
            *track = end;
            if let Some(tracker) = self.driver.tracker_mut() {
                let dt = step_possible / tracker.last_velocity();
                tracker.update_time_arclength(dt, step_possible);
            }
            return Ok(step_possible);
        }

        debug!(
            step = step_possible,
            error = quick.error,
            eps,
            "quick step not accurate enough, integrating chord length"
        );
        let hinitial = self.last_step_estimate.min(step_possible);
        if self
            .driver
            .accurate_advance(track, step_possible, eps, hinitial)?
        {
            Ok(step_possible)
        } else {
            Ok(track.curve_length - start_curve_length)
        }
    }

    /// Find a step whose chord stays within `delta_chord`.
    fn find_next_chord(
        &mut self,
        track: &FieldTrack<N>,
        step_max: f64,
    ) -> Result<(FieldTrack<N>, f64, QuickStep)> {
        let mut dydx = [0.0; N];
        self.driver.get_derivatives(track, &mut dydx);

        let mut step_trial = if self.last_step_estimate >= self.config.fraction_last * step_max {
            step_max
        } else {
            (self.config.first_fraction * self.last_step_estimate).min(step_max)
        };

        let mut trials = 0;
        loop {
            let mut end = *track;
            let token = self.driver.tracker_mut().map(|tracker| tracker.arm());
            let quick = self.driver.quick_advance(&mut end, &dydx, step_trial, token)?;
            trials += 1;
            self.trials += 1;

            let valid = quick.chord_distance <= self.config.delta_chord;
            let (next_trial, estimate) = self.new_step(step_trial, quick.chord_distance);
            if quick.chord_distance > 0.0 {
                self.last_step_estimate = estimate;
            }

            if valid || trials >= self.config.max_trials {
                if !valid {
                    if self.driver.note_warning() {
                        warn!(
                            trials,
                            step = step_trial,
                            chord = quick.chord_distance,
                            delta_chord = self.config.delta_chord,
                            "no step met the chord tolerance, using last trial"
                        );
                    } else {
                        debug!(
                            trials,
                            step = step_trial,
                            chord = quick.chord_distance,
                            "no step met the chord tolerance, using last trial"
                        );
                    }
                }
                return Ok((end, step_trial, quick));
            }
            step_trial = next_trial;
        }
    }

    /// Next trial and unconstrained estimate after a trial of `step_trial`
    /// produced chord distance `chord`.
    fn new_step(&self, step_trial: f64, chord: f64) -> (f64, f64) {
        let delta = self.config.delta_chord;
        let (mut next, estimate) = if chord > 0.0 {
            // Sagitta grows with the square of the step
            let estimate = step_trial * (delta / chord).sqrt();
            (self.config.fraction_next * estimate, estimate)
        } else {
            (2.0 * step_trial, self.last_step_estimate)
        };

        if next <= 0.001 * step_trial {
            next = if chord > 1000.0 * delta {
                0.03 * step_trial
            } else if chord > 100.0 * delta {
                0.1 * step_trial
            } else {
                0.5 * step_trial
            };
        } else if next > 1000.0 * step_trial {
            next = 1000.0 * step_trial;
        }
        (next, estimate)
    }

    /// The driver
    pub fn driver(&self) -> &Driver<S, N> {
        &self.driver
    }

    /// Mutable access to the driver
    pub fn driver_mut(&mut self) -> &mut Driver<S, N> {
        &mut self.driver
    }

    /// Unwrap the driver
    pub fn into_driver(self) -> Driver<S, N> {
        self.driver
    }

    /// Parameters
    pub fn config(&self) -> &ChordConfig {
        &self.config
    }

    /// Chord-based estimate of the next step, infinite before the first call
    pub fn last_step_estimate(&self) -> f64 {
        self.last_step_estimate
    }

    /// Forget the step estimate, e.g. when starting a new trajectory
    pub fn reset_step_estimate(&mut self) {
        self.last_step_estimate = f64::INFINITY;
    }

    /// Average number of chord trials per advance
    pub fn trials_per_call(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.trials as f64 / self.calls as f64
        }
    }
}
