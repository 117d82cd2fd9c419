//! Recorded helix and a plane crossing.
//!
//! Propagates a proton through a uniform 1 T field with chord-limited steps,
//! records every step, locates where the track crosses the plane z = 400 mm
//! by bisecting the step interpolant, and walks the recording back to that
//! point before writing it to disk.
//!
//! Run with:
//!   cargo run --example helix_tracker

use fieldprop::units::{C_LIGHT, PROTON_MASS_C2, TESLA};
use fieldprop::{
    ChordConfig, ChordFinder, Driver, DriverConfig, EmbeddedRk, FieldTrack, Interpolant,
    MagneticEquation, Particle, StepTracker, TrackerOutput, UniformField,
};

const PLANE_Z: f64 = 400.0;

/// Fraction of the interpolant's interval where z crosses `plane`.
fn bisect_crossing(interp: &Interpolant, plane: f64) -> f64 {
    let (mut lo, mut hi) = (0.0, 1.0);
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if interp.interpolate_position(mid)[2] < plane {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

fn main() -> fieldprop::Result<()> {
    let proton = Particle::proton(0.5 * PROTON_MASS_C2);
    let field = UniformField::new([0.0, 0.0, -TESLA]);
    let stepper: EmbeddedRk<_, 6> = EmbeddedRk::dormand_prince(MagneticEquation::new(field, proton));

    let mut driver = Driver::new(stepper, DriverConfig::default())?;
    driver.attach_tracker(StepTracker::default());
    let mut finder = ChordFinder::new(driver, ChordConfig::default())?;

    let mut track = FieldTrack::<6>::from_particle([0.0; 3], [0.2, 0.6, 0.8], &proton, 0.0)?;
    while track.position()[2] < PLANE_Z {
        finder.advance_chord_limited(&mut track, 200.0, 1e-6)?;
    }

    let radius = proton.momentum / (C_LIGHT * TESLA);
    println!("Proton, p = {:.1} MeV/c, bending radius {:.1} mm", proton.momentum, radius);
    println!(
        "  Stopped at s = {:.3} mm, position ({:.3}, {:.3}, {:.3})",
        track.curve_length,
        track.position()[0],
        track.position()[1],
        track.position()[2]
    );

    let Some(tracker) = finder.driver_mut().tracker_mut() else {
        return Ok(());
    };
    println!("  Recorded steps: {}", tracker.len());

    let crossing = tracker.rows().find_map(|row| {
        let (start, end) = (row.start(), row.end());
        if start.position()[2] < PLANE_Z && end.position()[2] >= PLANE_Z {
            let interp = Interpolant::from_rows(&row, &row).ok()?;
            let xi = bisect_crossing(&interp, PLANE_Z);
            let s = start.arclength() + xi * (end.arclength() - start.arclength());
            Some((s, interp.interpolate_position(xi)))
        } else {
            None
        }
    });

    let Some((passed, point)) = crossing else {
        println!("  No crossing of z = {PLANE_Z} found");
        return Ok(());
    };
    println!(
        "  Crossing of z = {PLANE_Z} at s = {:.6} mm, x = {:.6}, y = {:.6}",
        passed, point[0], point[1]
    );

    tracker.record_if_post_intersection_point(passed);
    println!(
        "  After walking back: {} steps kept, {} in overshoot, intersections at {:?}",
        tracker.len(),
        tracker.overshoot_len(),
        tracker.intersection_indices()
    );

    let dir = std::env::temp_dir().join("fieldprop_helix");
    std::fs::create_dir_all(&dir)?;
    tracker.write_output(&TrackerOutput::in_directory(&dir, "helix"))?;
    println!("  Output written to {}", dir.display());

    let stats = finder.driver().stats();
    println!();
    println!("  Sub-steps:        {}", stats.total_steps);
    println!("  Rejected trials:  {}", stats.rejected_trials);
    println!("  Chord trials/call {:.2}", finder.trials_per_call());
    Ok(())
}
