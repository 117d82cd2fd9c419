//! Field samplers consumed by the equations of motion.

use std::cell::Cell;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A (magnetic) field that can be sampled at a point in space and time.
///
/// Values are in internal units, so a field of 1 T reads `units::TESLA`.
pub trait FieldSampler {
    /// Field vector at `position` (mm) and lab `time` (ns)
    fn field(&self, position: &[f64; 3], time: f64) -> [f64; 3];
}

impl<F: FieldSampler + ?Sized> FieldSampler for &F {
    fn field(&self, position: &[f64; 3], time: f64) -> [f64; 3] {
        (**self).field(position, time)
    }
}

impl<F: FieldSampler + ?Sized> FieldSampler for Box<F> {
    fn field(&self, position: &[f64; 3], time: f64) -> [f64; 3] {
        (**self).field(position, time)
    }
}

/// Field with the same value everywhere.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniformField {
    /// Field vector
    pub value: [f64; 3],
}

impl UniformField {
    /// Create a uniform field
    pub const fn new(value: [f64; 3]) -> Self {
        Self { value }
    }
}

impl FieldSampler for UniformField {
    fn field(&self, _position: &[f64; 3], _time: f64) -> [f64; 3] {
        self.value
    }
}

/// Ideal quadrupole with its axis along z: B = g (y, x, 0).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuadrupoleField {
    /// Gradient (field per mm)
    pub gradient: f64,
}

impl QuadrupoleField {
    /// Create a quadrupole field with the given gradient
    pub const fn new(gradient: f64) -> Self {
        Self { gradient }
    }
}

impl FieldSampler for QuadrupoleField {
    fn field(&self, position: &[f64; 3], _time: f64) -> [f64; 3] {
        [
            self.gradient * position[1],
            self.gradient * position[0],
            0.0,
        ]
    }
}

/// Wrapper that reuses the last field value while the query point stays
/// within `cache_distance` of the last evaluated point.
///
/// Counts every query (`call_count`) and every evaluation of the inner
/// field (`evaluation_count`). The counters use `Cell`, so a cached field
/// belongs to a single trajectory at a time.
#[derive(Debug)]
pub struct CachedField<F> {
    inner: F,
    cache_distance: f64,
    last: Cell<Option<([f64; 3], [f64; 3])>>,
    calls: Cell<u64>,
    evaluations: Cell<u64>,
}

impl<F: FieldSampler> CachedField<F> {
    /// Wrap `inner`. A `cache_distance` of zero disables caching but keeps counting.
    pub fn new(inner: F, cache_distance: f64) -> Self {
        Self {
            inner,
            cache_distance: cache_distance.max(0.0),
            last: Cell::new(None),
            calls: Cell::new(0),
            evaluations: Cell::new(0),
        }
    }

    /// Number of field queries since the last `clear_counts`
    pub fn call_count(&self) -> u64 {
        self.calls.get()
    }

    /// Number of inner field evaluations since the last `clear_counts`
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.get()
    }

    /// Reset both counters. The cached value is kept.
    pub fn clear_counts(&self) {
        self.calls.set(0);
        self.evaluations.set(0);
    }

    /// Cache radius (mm)
    pub fn cache_distance(&self) -> f64 {
        self.cache_distance
    }

    /// The wrapped field
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: FieldSampler> FieldSampler for CachedField<F> {
    fn field(&self, position: &[f64; 3], time: f64) -> [f64; 3] {
        self.calls.set(self.calls.get() + 1);

        if let Some((at, value)) = self.last.get() {
            let d2 = (position[0] - at[0]).powi(2)
                + (position[1] - at[1]).powi(2)
                + (position[2] - at[2]).powi(2);
            if d2 < self.cache_distance * self.cache_distance {
                return value;
            }
        }

        let value = self.inner.field(position, time);
        self.evaluations.set(self.evaluations.get() + 1);
        self.last.set(Some((*position, value)));
        value
    }
}
