//! # fieldprop: adaptive propagation of charged particles
//!
//! Integrates the trajectory of a charged particle through a magnetic field
//! by solving its equation of motion with adaptive Runge-Kutta steps, trading
//! step size against a requested accuracy.
//!
//! ## Features
//!
//! - **Driver** with Numerical Recipes style step-size control
//!   (`accurate_advance`, `one_good_step`, `quick_advance`)
//! - Embedded Cash-Karp and Dormand-Prince 4(5) steppers, plus step
//!   doubling over Euler, classical RK4 and Runge-Kutta-Nyström
//! - A time-parametrized adapter (`ByTime`) so velocity-form steppers can be
//!   driven by arc length
//! - Quintic Hermite interpolation between step end points, with no extra
//!   field evaluations
//! - A step **tracker** that records every accepted sub-step and can walk
//!   back steps that overshot an intersection
//! - Chord-limited advance that keeps each step's sagitta within a tolerance
//!
//! Units are millimetres, nanoseconds and MeV (see [`units`]).
//!
//! ## Basic Usage
//!
//! ```rust
//! use fieldprop::units::{PROTON_MASS_C2, TESLA};
//! use fieldprop::{
//!     Driver, DriverConfig, EmbeddedRk, FieldTrack, MagneticEquation, Particle, UniformField,
//! };
//!
//! let proton = Particle::proton(0.5 * PROTON_MASS_C2);
//! let field = UniformField::new([0.0, 0.0, -TESLA]);
//! let stepper: EmbeddedRk<_, 6> = EmbeddedRk::cash_karp(MagneticEquation::new(field, proton));
//! let mut driver = Driver::new(stepper, DriverConfig::default())?;
//!
//! let mut track = FieldTrack::from_particle([0.0; 3], [0.2, 0.6, 0.8], &proton, 0.0)?;
//! let completed = driver.accurate_advance(&mut track, 1000.0, 1e-6, 0.0)?;
//!
//! assert!(completed);
//! assert!((track.curve_length - 1000.0).abs() < 1e-9);
//! # Ok::<(), fieldprop::IntegrationError>(())
//! ```
//!
//! ## Recording Steps
//!
//! Attach a [`StepTracker`] to the driver and advance through a
//! [`ChordFinder`]; each accepted sub-step becomes one row, which
//! [`Interpolant::from_rows`] can interpolate:
//!
//! ```rust
//! use fieldprop::units::{PROTON_MASS_C2, TESLA};
//! use fieldprop::{
//!     ChordConfig, ChordFinder, Driver, DriverConfig, EmbeddedRk, FieldTrack, Interpolant,
//!     MagneticEquation, Particle, StepTracker, UniformField,
//! };
//!
//! let proton = Particle::proton(0.5 * PROTON_MASS_C2);
//! let field = UniformField::new([0.0, 0.0, -TESLA]);
//! let stepper: EmbeddedRk<_, 6> = EmbeddedRk::dormand_prince(MagneticEquation::new(field, proton));
//! let mut driver = Driver::new(stepper, DriverConfig::default())?;
//! driver.attach_tracker(StepTracker::default());
//!
//! let mut chord_finder = ChordFinder::new(driver, ChordConfig::default())?;
//! let mut track = FieldTrack::from_particle([0.0; 3], [1.0, 0.0, 0.0], &proton, 0.0)?;
//! chord_finder.advance_chord_limited(&mut track, 100.0, 1e-6)?;
//!
//! let tracker = chord_finder.driver().tracker().expect("tracker attached");
//! let row = tracker.row(0).expect("one row recorded");
//! let midpoint = Interpolant::from_rows(&row, &row)?.interpolate_position(0.5);
//! assert!(midpoint[1] > 0.0);
//! # Ok::<(), fieldprop::IntegrationError>(())
//! ```
//!
//! ## References
//!
//! 1. Press, W.H. et al. (1992). "Numerical Recipes in C", 2nd ed.,
//!    16.2 Adaptive Stepsize Control for Runge-Kutta. Cambridge.
//!
//! 2. Cash, J.R. & Karp, A.H. (1990). ACM TOMS 16, 201-222.
//!
//! 3. Dormand, J.R. & Prince, P.J. (1980). J. Comp. Appl. Math. 6, 19-26.
//!
//! 4. Abramowitz, M. & Stegun, I.A. (1964). "Handbook of Mathematical
//!    Functions", 25.5.20 (Runge-Kutta-Nyström).

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod by_time;
pub mod chord;
pub mod coefficients;
pub mod driver;
pub mod embedded;
pub mod equation;
pub mod error;
pub mod field;
pub mod interpolant;
pub mod state;
pub mod stepper;
pub mod tracker;
pub mod units;

pub use by_time::ByTime;
pub use chord::{ChordConfig, ChordFinder};
pub use coefficients::{Tableau, CASH_KARP, DORMAND_PRINCE};
pub use driver::{Diagnostics, Driver, DriverConfig, DriverStats, GoodStep, QuickStep};
pub use embedded::EmbeddedRk;
pub use equation::{EquationOfMotion, MagneticEquation, Parametrization, Particle, TimeEquation};
pub use error::{IntegrationError, Result};
pub use field::{CachedField, FieldSampler, QuadrupoleField, UniformField};
pub use interpolant::Interpolant;
pub use state::FieldTrack;
pub use stepper::{
    ClassicalRk4, ClassicalRk4Stepper, Doubling, EulerStepper, ExplicitEuler, FixedStep,
    NystromRk4, NystromStepper, Stepper,
};
pub use tracker::{ArmToken, RowLayout, RowView, StepTracker, TrackerOutput};
