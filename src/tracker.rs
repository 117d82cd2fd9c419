//! Step tracker: a record of every accepted sub-step.
//!
//! Each row holds the start and end of one step as two blocks:
//!
//! | offset | content                          |
//! |--------|----------------------------------|
//! | 0      | time τ = c·t (mm)                |
//! | 1      | arc length (mm)                  |
//! | 2..5   | position (mm)                    |
//! | 5..8   | velocity β = p / M               |
//! | 8..    | right-hand side, as d/dτ         |
//!
//! The compact layout keeps the acceleration only (3 RHS entries, 22
//! columns per row); the extended layout also keeps the kinetic energy and
//! time rates (6 RHS entries, 28 columns).
//!
//! Rows are only written inside the tracker window and only by an armed
//! call. When an intersection is found behind the last recorded point,
//! [`StepTracker::record_if_post_intersection_point`] walks back the
//! overshooting rows into a separate buffer.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::by_time::MIN_SPEED;
use crate::equation::Parametrization;
use crate::error::{IntegrationError, Result};
use crate::state::{norm_sq, FieldTrack};

/// Offset of the time within a block
pub const BLOCK_TIME: usize = 0;
/// Offset of the arc length within a block
pub const BLOCK_ARCLENGTH: usize = 1;
/// Offset of the position within a block
pub const BLOCK_POSITION: usize = 2;
/// Offset of the velocity within a block
pub const BLOCK_VELOCITY: usize = 5;
/// Offset of the right-hand side within a block
pub const BLOCK_RHS: usize = 8;

const MAX_BLOCK_LEN: usize = BLOCK_RHS + 6;

/// Number of right-hand side components kept per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RowLayout {
    /// Acceleration only: 22 columns
    #[default]
    Compact,
    /// Acceleration, energy and time rates: 28 columns
    Extended,
}

impl RowLayout {
    /// Right-hand side entries per block
    pub const fn rhs_len(self) -> usize {
        match self {
            Self::Compact => 3,
            Self::Extended => 6,
        }
    }

    /// Columns per block; also the offset of the end block
    pub const fn block_len(self) -> usize {
        BLOCK_RHS + self.rhs_len()
    }

    /// Columns per row
    pub const fn row_len(self) -> usize {
        2 * self.block_len()
    }
}

/// Permission for exactly one recorded call.
///
/// Obtained from [`StepTracker::arm`] and consumed by
/// [`StepTracker::record_result`]. Re-arming or disarming the tracker makes
/// older tokens stale.
#[must_use = "an arm token does nothing unless handed to record_result"]
#[derive(Debug, PartialEq, Eq)]
pub struct ArmToken {
    generation: u64,
}

impl ArmToken {
    /// Generation of the tracker when this token was issued
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Read-only view of one half of a row.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    data: &'a [f64],
}

impl<'a> BlockView<'a> {
    /// Time τ = c·t (mm)
    pub fn time(&self) -> f64 {
        self.data[BLOCK_TIME]
    }

    /// Arc length (mm)
    pub fn arclength(&self) -> f64 {
        self.data[BLOCK_ARCLENGTH]
    }

    /// Position (mm)
    pub fn position(&self) -> [f64; 3] {
        let p = &self.data[BLOCK_POSITION..BLOCK_POSITION + 3];
        [p[0], p[1], p[2]]
    }

    /// Velocity in units of c
    pub fn velocity(&self) -> [f64; 3] {
        let v = &self.data[BLOCK_VELOCITY..BLOCK_VELOCITY + 3];
        [v[0], v[1], v[2]]
    }

    /// Speed in units of c
    pub fn speed(&self) -> f64 {
        norm_sq(&self.data[BLOCK_VELOCITY..BLOCK_VELOCITY + 3]).sqrt()
    }

    /// Acceleration dv/dτ
    pub fn acceleration(&self) -> [f64; 3] {
        let a = &self.data[BLOCK_RHS..BLOCK_RHS + 3];
        [a[0], a[1], a[2]]
    }

    /// All stored right-hand side entries
    pub fn rhs(&self) -> &'a [f64] {
        &self.data[BLOCK_RHS..]
    }
}

/// Read-only view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    data: &'a [f64],
    layout: RowLayout,
}

impl<'a> RowView<'a> {
    /// Start of the step
    pub fn start(&self) -> BlockView<'a> {
        BlockView {
            data: &self.data[..self.layout.block_len()],
        }
    }

    /// End of the step
    pub fn end(&self) -> BlockView<'a> {
        BlockView {
            data: &self.data[self.layout.block_len()..],
        }
    }

    /// Raw columns
    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }
}

/// Where [`StepTracker::write_output`] puts each artifact. `None` skips it.
#[derive(Debug, Clone, Default)]
pub struct TrackerOutput {
    /// Binary rows of the main buffer
    pub buffer: Option<PathBuf>,
    /// Text file with the main and overshoot row counts
    pub meta: Option<PathBuf>,
    /// Text file, one evaluation count per main row
    pub evaluation_counts: Option<PathBuf>,
    /// Text file, one evaluation count per overshoot row
    pub overshoot_evaluation_counts: Option<PathBuf>,
    /// Text file, one row index per splice
    pub intersection_indices: Option<PathBuf>,
    /// Binary rows of the overshoot buffer
    pub overshoot: Option<PathBuf>,
}

impl TrackerOutput {
    /// All artifacts in `dir`, named after `stem`.
    pub fn in_directory(dir: impl AsRef<Path>, stem: &str) -> Self {
        let dir = dir.as_ref();
        let path = |suffix: &str| Some(dir.join(format!("{stem}_{suffix}")));
        Self {
            buffer: path("buffer.bin"),
            meta: path("meta.txt"),
            evaluation_counts: path("evaluations.txt"),
            overshoot_evaluation_counts: path("overshoot_evaluations.txt"),
            intersection_indices: path("intersections.txt"),
            overshoot: path("overshoot.bin"),
        }
    }
}

/// Recorder of accepted integration steps.
#[derive(Debug, Clone)]
pub struct StepTracker {
    layout: RowLayout,
    buffer: Vec<f64>,
    counts: Vec<u64>,
    overshoot: Vec<f64>,
    overshoot_counts: Vec<u64>,
    intersection_indices: Vec<usize>,

    relativistic_mass: f64,
    parametrization: Parametrization,
    first_velocity: f64,
    last_time: f64,
    last_curve_length: f64,
    last_time_accepted: bool,
    initialized: bool,

    in_window: bool,
    armed: bool,
    generation: u64,
    excluded: u64,
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new(RowLayout::default())
    }
}

impl StepTracker {
    /// Empty tracker with the given row layout
    pub fn new(layout: RowLayout) -> Self {
        Self {
            layout,
            buffer: Vec::new(),
            counts: Vec::new(),
            overshoot: Vec::new(),
            overshoot_counts: Vec::new(),
            intersection_indices: Vec::new(),
            relativistic_mass: 1.0,
            parametrization: Parametrization::ArcLength,
            first_velocity: 0.0,
            last_time: 0.0,
            last_curve_length: 0.0,
            last_time_accepted: true,
            initialized: false,
            in_window: false,
            armed: false,
            generation: 0,
            excluded: 0,
        }
    }

    /// Set the particle's mass and the meaning of the recorded derivatives.
    ///
    /// While nothing has been recorded yet this also places the time and
    /// arc-length origin at `track`.
    pub fn initialize<const N: usize>(
        &mut self,
        track: &FieldTrack<N>,
        relativistic_mass: f64,
        parametrization: Parametrization,
    ) -> Result<()> {
        if !(relativistic_mass.is_finite() && relativistic_mass > 0.0) {
            return Err(IntegrationError::invalid_input(format!(
                "relativistic mass must be positive, got {}",
                relativistic_mass
            )));
        }

        if self.buffer.is_empty() {
            let speed = track.momentum_mag() / relativistic_mass;
            if speed.is_nan() || speed < MIN_SPEED {
                return Err(IntegrationError::DegenerateVelocity { speed });
            }
            self.first_velocity = speed;
            self.last_curve_length = track.curve_length;
            self.last_time = track.curve_length / speed;
            self.last_time_accepted = true;
        }

        self.relativistic_mass = relativistic_mass;
        self.parametrization = parametrization;
        self.initialized = true;
        Ok(())
    }

    /// Open the recording window
    pub fn begin_window(&mut self) {
        self.in_window = true;
    }

    /// Close the recording window
    pub fn end_window(&mut self) {
        self.in_window = false;
    }

    /// Whether recording is currently allowed
    pub fn within_window(&self) -> bool {
        self.in_window
    }

    /// Allow the next call to be recorded.
    pub fn arm(&mut self) -> ArmToken {
        self.generation += 1;
        self.armed = true;
        ArmToken {
            generation: self.generation,
        }
    }

    /// Withdraw an outstanding arm; its token becomes stale.
    pub fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            self.generation += 1;
        }
    }

    /// Whether a token is outstanding
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    fn consume(&mut self, token: ArmToken) -> Result<()> {
        if !self.armed || token.generation != self.generation {
            return Err(IntegrationError::StaleArmToken {
                token: token.generation,
                current: self.generation,
            });
        }
        self.armed = false;
        Ok(())
    }

    /// Record one stepper call from `y0` to `y1` over arc length `step`.
    ///
    /// `evaluations` is the caller's cumulative field-evaluation count. If
    /// the previous row has not been accepted through
    /// [`update_time_arclength`](Self::update_time_arclength) it is
    /// overwritten. Returns `Ok(false)` outside the window.
    #[allow(clippy::too_many_arguments)]
    pub fn record_result<const N: usize>(
        &mut self,
        token: ArmToken,
        y0: &[f64; N],
        dydx0: &[f64; N],
        y1: &[f64; N],
        dydx1: &[f64; N],
        step: f64,
        evaluations: u64,
    ) -> Result<bool> {
        self.consume(token)?;
        if !self.in_window {
            return Ok(false);
        }
        if !self.initialized {
            return Err(IntegrationError::TrackerNotInitialized);
        }

        let row_len = self.layout.row_len();
        let block_len = self.layout.block_len();
        let count = evaluations.saturating_sub(self.excluded);

        if self.last_time_accepted || self.counts.is_empty() {
            self.buffer.resize(self.buffer.len() + row_len, 0.0);
            self.counts.push(count);
            self.last_time_accepted = false;
        } else if let Some(last) = self.counts.last_mut() {
            *last = count;
        }

        let (t0, s0) = (self.last_time, self.last_curve_length);
        let start = self.block(t0, s0, y0, dydx0);
        let offset = self.buffer.len() - row_len;
        self.buffer[offset..offset + block_len].copy_from_slice(&start[..block_len]);

        let t1 = t0 + step / self.last_velocity();
        let end = self.block(t1, s0 + step, y1, dydx1);
        self.buffer[offset + block_len..].copy_from_slice(&end[..block_len]);
        Ok(true)
    }

    /// Convert one state into block columns.
    fn block<const N: usize>(
        &self,
        time: f64,
        arclength: f64,
        y: &[f64; N],
        dydx: &[f64; N],
    ) -> [f64; MAX_BLOCK_LEN] {
        let mut out = [0.0; MAX_BLOCK_LEN];
        out[BLOCK_TIME] = time;
        out[BLOCK_ARCLENGTH] = arclength;
        out[BLOCK_POSITION..BLOCK_POSITION + 3].copy_from_slice(&y[..3]);

        let inv_mass = 1.0 / self.relativistic_mass;
        for i in 0..3 {
            out[BLOCK_VELOCITY + i] = y[3 + i] * inv_mass;
        }
        let speed = norm_sq(&out[BLOCK_VELOCITY..BLOCK_VELOCITY + 3]).sqrt();

        // d/dτ = β d/ds for arc-length derivatives
        let (accel_scale, rate_scale) = match self.parametrization {
            Parametrization::ArcLength => (speed * inv_mass, speed),
            Parametrization::Time => (inv_mass, 1.0),
        };
        for i in 0..self.layout.rhs_len() {
            let src = 3 + i;
            if src < N {
                let scale = if i < 3 { accel_scale } else { rate_scale };
                out[BLOCK_RHS + i] = dydx[src] * scale;
            }
        }
        out
    }

    /// Accept the provisional row and advance the time and arc-length origin.
    pub fn update_time_arclength(&mut self, dt: f64, ds: f64) {
        if !self.in_window {
            return;
        }
        self.last_time += dt;
        self.last_curve_length += ds;
        self.last_time_accepted = true;
    }

    /// Speed at the start of the last row, or the initial speed.
    pub fn last_velocity(&self) -> f64 {
        self.tail()
            .map_or(self.first_velocity, |row| row.start().speed())
    }

    /// Subtract `count` more evaluations from every count recorded from now on.
    pub fn exclude_evaluations(&mut self, count: u64) {
        self.excluded += count;
    }

    /// Total evaluations excluded so far
    pub fn excluded_evaluations(&self) -> u64 {
        self.excluded
    }

    /// Walk back rows that ended past an intersection at arc length `passed`.
    ///
    /// Rows ending at or after `passed` move to the overshoot buffer, oldest
    /// first, and the new buffer length is added to the intersection list.
    /// The time is rebuilt from the last surviving row.
    pub fn record_if_post_intersection_point(&mut self, passed: f64) {
        if passed < self.last_curve_length {
            let row_len = self.layout.row_len();
            let mut popped: Vec<(Vec<f64>, u64)> = Vec::new();

            while let Some(count) = self.counts.pop() {
                let row = self.buffer.split_off(self.buffer.len() - row_len);
                popped.push((row, count));

                match self.tail_end_arclength() {
                    Some(end) if end >= passed => continue,
                    _ => break,
                }
            }

            let earliest = popped.last().map(|(row, _)| {
                let start = RowView {
                    data: row,
                    layout: self.layout,
                }
                .start();
                (start.time(), start.arclength(), start.speed())
            });

            let new_time = match (self.tail(), earliest) {
                (Some(tail), _) => {
                    let end = tail.end();
                    end.time() + (passed - end.arclength()) / self.last_velocity()
                }
                (None, Some((t0, s0, v0))) => t0 + (passed - s0) / v0,
                (None, None) => {
                    self.last_time + (passed - self.last_curve_length) / self.first_velocity
                }
            };

            debug!(
                passed,
                popped = popped.len(),
                remaining = self.len(),
                "intersection behind last recorded step"
            );

            for (row, count) in popped.into_iter().rev() {
                self.overshoot.extend_from_slice(&row);
                self.overshoot_counts.push(count);
            }

            self.last_time = new_time;
            self.last_curve_length = passed;

            let len = self.len();
            self.intersection_indices.retain(|&i| i <= len);
            if self.intersection_indices.last() != Some(&len) {
                self.intersection_indices.push(len);
            }
        }
        self.last_time_accepted = true;
    }

    fn tail(&self) -> Option<RowView<'_>> {
        self.len().checked_sub(1).and_then(|i| self.row(i))
    }

    fn tail_end_arclength(&self) -> Option<f64> {
        self.tail().map(|row| row.end().arclength())
    }

    /// Number of rows in the main buffer
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the main buffer is empty
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Row `index` of the main buffer
    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        view(&self.buffer, self.layout, index)
    }

    /// All rows of the main buffer, oldest first
    pub fn rows(&self) -> impl Iterator<Item = RowView<'_>> + '_ {
        let layout = self.layout;
        self.buffer
            .chunks_exact(layout.row_len())
            .map(move |data| RowView { data, layout })
    }

    /// Number of rows in the overshoot buffer
    pub fn overshoot_len(&self) -> usize {
        self.overshoot_counts.len()
    }

    /// Row `index` of the overshoot buffer
    pub fn overshoot_row(&self, index: usize) -> Option<RowView<'_>> {
        view(&self.overshoot, self.layout, index)
    }

    /// Evaluation count of each main row
    pub fn evaluation_counts(&self) -> &[u64] {
        &self.counts
    }

    /// Evaluation count of each overshoot row
    pub fn overshoot_evaluation_counts(&self) -> &[u64] {
        &self.overshoot_counts
    }

    /// Main-buffer lengths at which intersections were spliced in
    pub fn intersection_indices(&self) -> &[usize] {
        &self.intersection_indices
    }

    /// Row layout
    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    /// Whether [`initialize`](Self::initialize) has been called
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Time τ at the last accepted point
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    /// Arc length at the last accepted point
    pub fn last_curve_length(&self) -> f64 {
        self.last_curve_length
    }

    /// Whether the tail row has been accepted
    pub fn last_time_accepted(&self) -> bool {
        self.last_time_accepted
    }

    /// Write the requested artifacts.
    pub fn write_output(&self, output: &TrackerOutput) -> Result<()> {
        if let Some(path) = &output.buffer {
            write_rows(create(path)?, &self.buffer)?;
        }
        if let Some(path) = &output.meta {
            write_meta(create(path)?, self.len(), self.overshoot_len())?;
        }
        if let Some(path) = &output.evaluation_counts {
            write_counts(create(path)?, &self.counts)?;
        }
        if let Some(path) = &output.overshoot_evaluation_counts {
            write_counts(create(path)?, &self.overshoot_counts)?;
        }
        if let Some(path) = &output.intersection_indices {
            write_indices(create(path)?, &self.intersection_indices)?;
        }
        if let Some(path) = &output.overshoot {
            write_rows(create(path)?, &self.overshoot)?;
        }

        debug!(
            rows = self.len(),
            overshoot = self.overshoot_len(),
            intersections = self.intersection_indices.len(),
            "tracker output written"
        );
        Ok(())
    }
}

fn view(buffer: &[f64], layout: RowLayout, index: usize) -> Option<RowView<'_>> {
    let row_len = layout.row_len();
    let start = index.checked_mul(row_len)?;
    let data = buffer.get(start..start.checked_add(row_len)?)?;
    Some(RowView { data, layout })
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

/// Write rows as native-endian `f64` values.
pub fn write_rows(mut writer: impl Write, rows: &[f64]) -> Result<()> {
    writer.write_all(bytemuck::cast_slice(rows))?;
    writer.flush()?;
    Ok(())
}

/// Read back rows written by [`write_rows`].
pub fn read_rows(mut reader: impl Read) -> Result<Vec<f64>> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let width = std::mem::size_of::<f64>();
    if bytes.len() % width != 0 {
        return Err(IntegrationError::invalid_input(format!(
            "row data of {} bytes is not a whole number of values",
            bytes.len()
        )));
    }

    let mut rows = vec![0.0f64; bytes.len() / width];
    bytemuck::cast_slice_mut::<f64, u8>(&mut rows).copy_from_slice(&bytes);
    Ok(rows)
}

/// Write the main and overshoot row counts, one per line.
pub fn write_meta(mut writer: impl Write, len: usize, overshoot_len: usize) -> Result<()> {
    writeln!(writer, "{len}")?;
    writeln!(writer, "{overshoot_len}")?;
    writer.flush()?;
    Ok(())
}

/// Write evaluation counts, one per line.
pub fn write_counts(mut writer: impl Write, counts: &[u64]) -> Result<()> {
    for count in counts {
        writeln!(writer, "{count}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write intersection indices, one per line.
pub fn write_indices(mut writer: impl Write, indices: &[usize]) -> Result<()> {
    for index in indices {
        writeln!(writer, "{index}")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unit mass, unit speed along x: τ equals arc length
    fn state(x: f64) -> [f64; 6] {
        [x, 0.0, 0.0, 1.0, 0.0, 0.0]
    }

    fn tracker() -> StepTracker {
        let mut tracker = StepTracker::new(RowLayout::Compact);
        let track = FieldTrack::new(state(0.0), 0.0).unwrap();
        tracker
            .initialize(&track, 1.0, Parametrization::ArcLength)
            .unwrap();
        tracker.begin_window();
        tracker
    }

    fn record(tracker: &mut StepTracker, from: f64, to: f64, evaluations: u64) -> bool {
        let token = tracker.arm();
        tracker
            .record_result(
                token,
                &state(from),
                &[0.0; 6],
                &state(to),
                &[0.0; 6],
                to - from,
                evaluations,
            )
            .unwrap()
    }

    fn accept(tracker: &mut StepTracker, ds: f64) {
        let dt = ds / tracker.last_velocity();
        tracker.update_time_arclength(dt, ds);
    }

    /// Rows [0,10], [10,20], [20,30]
    fn three_rows() -> StepTracker {
        let mut tracker = tracker();
        for (i, from) in [0.0, 10.0, 20.0].into_iter().enumerate() {
            assert!(record(&mut tracker, from, from + 10.0, 7 * (i as u64 + 1)));
            accept(&mut tracker, 10.0);
        }
        tracker
    }

    // ==================== Layout ====================

    #[test]
    fn test_row_lengths() {
        assert_eq!(RowLayout::Compact.row_len(), 22);
        assert_eq!(RowLayout::Compact.block_len(), 11);
        assert_eq!(RowLayout::Extended.row_len(), 28);
        assert_eq!(RowLayout::Extended.block_len(), 14);
    }

    // ==================== Recording ====================

    #[test]
    fn test_rows_chain() {
        let tracker = three_rows();
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.evaluation_counts(), &[7, 14, 21]);

        let rows: Vec<_> = tracker.rows().collect();
        for pair in rows.windows(2) {
            assert_eq!(pair[0].end().time(), pair[1].start().time());
            assert_eq!(pair[0].end().arclength(), pair[1].start().arclength());
        }
        for row in &rows {
            assert!(row.end().arclength() >= row.start().arclength());
            assert!((row.end().time() - row.end().arclength()).abs() < 1e-12);
        }
        assert_eq!(tracker.last_curve_length(), 30.0);
        assert_eq!(rows[2].end().position(), [30.0, 0.0, 0.0]);
        assert_eq!(rows[2].end().velocity(), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unaccepted_row_is_overwritten() {
        let mut tracker = tracker();
        record(&mut tracker, 0.0, 10.0, 4);
        record(&mut tracker, 0.0, 5.0, 9);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.evaluation_counts(), &[9]);
        let row = tracker.row(0).unwrap();
        assert_eq!(row.end().arclength(), 5.0);
        assert!(!tracker.last_time_accepted());

        accept(&mut tracker, 5.0);
        record(&mut tracker, 5.0, 8.0, 12);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.row(1).unwrap().start().arclength(), 5.0);
    }

    #[test]
    fn test_outside_window_not_recorded() {
        let mut tracker = tracker();
        tracker.end_window();
        assert!(!record(&mut tracker, 0.0, 10.0, 1));
        assert!(tracker.is_empty());

        tracker.update_time_arclength(10.0, 10.0);
        assert_eq!(tracker.last_curve_length(), 0.0);
    }

    #[test]
    fn test_uninitialized_tracker_rejects_records() {
        let mut tracker = StepTracker::default();
        tracker.begin_window();
        let token = tracker.arm();
        let result = tracker.record_result(token, &state(0.0), &[0.0; 6], &state(1.0), &[0.0; 6], 1.0, 0);
        assert!(matches!(result, Err(IntegrationError::TrackerNotInitialized)));
    }

    #[test]
    fn test_initialize_rejects_particle_at_rest() {
        let mut tracker = StepTracker::default();
        let at_rest = FieldTrack::new([0.0; 6], 0.0).unwrap();
        let result = tracker.initialize(&at_rest, 938.0, Parametrization::ArcLength);
        assert!(matches!(result, Err(IntegrationError::DegenerateVelocity { .. })));
        assert!(!tracker.is_initialized());

        let moving = FieldTrack::new(state(0.0), 0.0).unwrap();
        let result = tracker.initialize(&moving, 0.0, Parametrization::ArcLength);
        assert!(matches!(result, Err(IntegrationError::InvalidInput { .. })));
    }

    #[test]
    fn test_stale_arm_tokens() {
        let mut tracker = tracker();
        let old = tracker.arm();
        let _current = tracker.arm();
        let result = tracker.record_result(old, &state(0.0), &[0.0; 6], &state(1.0), &[0.0; 6], 1.0, 0);
        assert!(matches!(
            result,
            Err(IntegrationError::StaleArmToken { token: 1, current: 2 })
        ));

        let token = tracker.arm();
        tracker.disarm();
        assert!(!tracker.is_armed());
        let result = tracker.record_result(token, &state(0.0), &[0.0; 6], &state(1.0), &[0.0; 6], 1.0, 0);
        assert!(matches!(result, Err(IntegrationError::StaleArmToken { .. })));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_excluded_evaluations() {
        let mut tracker = tracker();
        tracker.exclude_evaluations(3);
        record(&mut tracker, 0.0, 1.0, 10);
        accept(&mut tracker, 1.0);
        tracker.exclude_evaluations(2);
        record(&mut tracker, 1.0, 2.0, 20);
        assert_eq!(tracker.evaluation_counts(), &[7, 15]);
        assert_eq!(tracker.excluded_evaluations(), 5);
    }

    #[test]
    fn test_rhs_converted_to_tau_derivatives() {
        let mut tracker = StepTracker::new(RowLayout::Extended);
        // Mass 2, momentum 1: β = 0.5
        let y = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let track = FieldTrack::new(y, 0.0).unwrap();
        tracker
            .initialize(&track, 2.0, Parametrization::ArcLength)
            .unwrap();
        tracker.begin_window();

        let dydx = [1.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 3.0, 1.0];
        let token = tracker.arm();
        tracker
            .record_result(token, &y, &dydx, &y, &dydx, 1.0, 0)
            .unwrap();

        let row = tracker.row(0).unwrap();
        assert_eq!(row.as_slice().len(), 28);
        let start = row.start();
        assert_eq!(start.velocity(), [0.5, 0.0, 0.0]);
        // dv/dτ = dp/ds · β / M
        assert!((start.acceleration()[1] - 1.0).abs() < 1e-15);
        // dt/dτ = β dt/ds
        assert!((start.rhs()[4] - 1.5).abs() < 1e-15);
        assert!((start.rhs()[5] - 0.5).abs() < 1e-15);
        // τ advances by s / β
        assert!((row.end().time() - 2.0).abs() < 1e-15);
    }

    // ==================== Intersections ====================

    #[test]
    fn test_splice_inside_second_row() {
        let mut tracker = three_rows();
        tracker.record_if_post_intersection_point(15.0);

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.overshoot_len(), 2);
        assert_eq!(tracker.intersection_indices(), &[1]);
        assert_eq!(tracker.overshoot_evaluation_counts(), &[14, 21]);
        assert_eq!(tracker.overshoot_row(0).unwrap().start().arclength(), 10.0);
        assert_eq!(tracker.overshoot_row(1).unwrap().start().arclength(), 20.0);

        assert_eq!(tracker.last_curve_length(), 15.0);
        assert!((tracker.last_time() - 15.0).abs() < 1e-12);
        assert!(tracker.last_time_accepted());
    }

    #[test]
    fn test_splice_on_row_boundary_discards_row() {
        let mut tracker = three_rows();
        tracker.record_if_post_intersection_point(10.0);

        // The row ending exactly at the intersection goes too
        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.overshoot_len(), 3);
        assert_eq!(tracker.intersection_indices(), &[0]);
        assert_eq!(tracker.overshoot_evaluation_counts(), &[7, 14, 21]);
        // Rebuilt from the start of the earliest removed row
        assert!((tracker.last_time() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_splice_ahead_of_last_point_does_nothing() {
        let mut tracker = three_rows();
        tracker.record_if_post_intersection_point(30.0);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.overshoot_len(), 0);
        assert!(tracker.intersection_indices().is_empty());
    }

    #[test]
    fn test_recording_continues_after_splice() {
        let mut tracker = three_rows();
        tracker.record_if_post_intersection_point(25.0);
        assert_eq!(tracker.len(), 2);

        record(&mut tracker, 25.0, 28.0, 30);
        let row = tracker.row(2).unwrap();
        assert_eq!(row.start().arclength(), 25.0);
        assert!((row.start().time() - 25.0).abs() < 1e-12);

        accept(&mut tracker, 3.0);
        tracker.record_if_post_intersection_point(27.0);
        assert_eq!(tracker.intersection_indices(), &[2]);
    }

    // ==================== Output ====================

    #[test]
    fn test_writers() {
        let tracker = three_rows();
        let mut bytes = Vec::new();
        write_rows(&mut bytes, &tracker.buffer).unwrap();
        assert_eq!(bytes.len(), 3 * 22 * 8);
        assert_eq!(read_rows(bytes.as_slice()).unwrap(), tracker.buffer);

        let mut text = Vec::new();
        write_counts(&mut text, tracker.evaluation_counts()).unwrap();
        assert_eq!(String::from_utf8(text).unwrap(), "7\n14\n21\n");

        let mut meta = Vec::new();
        write_meta(&mut meta, 3, 0).unwrap();
        assert_eq!(String::from_utf8(meta).unwrap(), "3\n0\n");

        assert!(read_rows(&[0u8; 5][..]).is_err());
    }
}
