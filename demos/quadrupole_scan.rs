//! Transverse scan through a quadrupole.
//!
//! Launches protons parallel to the axis of a 10 T/m quadrupole at several
//! offsets and compares the Cash-Karp driver with the Nyström stepper run in
//! time through `ByTime`. The quadrupole focuses in x and defocuses in y.
//!
//! Run with:
//!   cargo run --example quadrupole_scan

use fieldprop::units::{GEV, PROTON_MASS_C2, TESLA};
use fieldprop::{
    ByTime, CachedField, Doubling, Driver, DriverConfig, EmbeddedRk, FieldTrack,
    MagneticEquation, NystromRk4, Particle, QuadrupoleField, TimeEquation,
};

const LENGTH: f64 = 1000.0;
const PIECES: u32 = 10;
const EPS: f64 = 1e-6;

fn main() -> fieldprop::Result<()> {
    let proton = Particle::proton(1.0 * GEV);
    let quadrupole = QuadrupoleField::new(10.0 * TESLA / 1000.0);

    println!(
        "Proton, p = {:.0} MeV/c (m = {:.1} MeV), quadrupole 10 T/m, {LENGTH} mm",
        proton.momentum, PROTON_MASS_C2
    );
    println!();
    println!(
        "  {:>6} {:>6} | {:>10} {:>10} | {:>10} {:>10} | {:>6} {:>6}",
        "x0", "y0", "x (CK)", "y (CK)", "x (RKN)", "y (RKN)", "steps", "fields"
    );

    for offset in [1.0, 2.0, 5.0, 10.0] {
        let start = [offset, offset, 0.0];

        let field = CachedField::new(quadrupole, 0.0);
        let stepper: EmbeddedRk<_, 6> = EmbeddedRk::cash_karp(MagneticEquation::new(&field, proton));
        let mut driver = Driver::new(stepper, DriverConfig::default())?;
        let mut track = FieldTrack::<6>::from_particle(start, [0.0, 0.0, 1.0], &proton, 0.0)?;
        for _ in 0..PIECES {
            driver.accurate_advance(&mut track, LENGTH / f64::from(PIECES), EPS, 0.0)?;
        }
        let steps = driver.stats().total_steps;

        let inner: Doubling<_, _, 8> = Doubling::new(NystromRk4, TimeEquation::new(quadrupole, proton));
        let mut by_time = Driver::new(ByTime::new(inner), DriverConfig::default())?;
        let mut timed = FieldTrack::<8>::from_particle(start, [0.0, 0.0, 1.0], &proton, 0.0)?;
        for _ in 0..PIECES {
            by_time.accurate_advance(&mut timed, LENGTH / f64::from(PIECES), EPS, 0.0)?;
        }

        println!(
            "  {:>6.1} {:>6.1} | {:>10.4} {:>10.4} | {:>10.4} {:>10.4} | {:>6} {:>6}",
            offset,
            offset,
            track.position()[0],
            track.position()[1],
            timed.position()[0],
            timed.position()[1],
            steps,
            field.evaluation_count()
        );
    }

    Ok(())
}
