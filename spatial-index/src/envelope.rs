//! Axis-aligned bounding envelopes in any number of dimensions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::rtree::{SpatialError, SpatialResult};

/// An axis-aligned bounding box in `n` dimensions.
///
/// `Envelope` stores one `(min, max)` pair per axis. A *null* envelope
/// represents "no data yet": it has a dimension but no extent, never
/// intersects anything and is the identity of [`Envelope::union`].
///
/// # Examples
///
/// ```rust
/// use spatial_index::Envelope;
///
/// let a = Envelope::from_corners(0.0, 0.0, 10.0, 10.0);
/// let b = Envelope::from_corners(15.0, 15.0, 5.0, 5.0); // corners are normalized
///
/// assert!(a.intersects(&b));
/// assert_eq!(a.union(&b), Envelope::from_corners(0.0, 0.0, 15.0, 15.0));
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Envelope {
    /// Creates an envelope from per-axis minimum and maximum coordinates.
    ///
    /// # Arguments
    ///
    /// * `min` - Minimum coordinate for each axis
    /// * `max` - Maximum coordinate for each axis
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidEnvelope`] when the vectors are empty,
    /// differ in length, contain non-finite values, or `min > max` on any axis.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> SpatialResult<Envelope> {
        if min.is_empty() {
            return Err(SpatialError::InvalidEnvelope(
                "envelope needs at least one dimension".into(),
            ));
        }
        if min.len() != max.len() {
            return Err(SpatialError::InvalidEnvelope(format!(
                "min has {} coordinates but max has {}",
                min.len(),
                max.len()
            )));
        }
        for (axis, (lo, hi)) in min.iter().zip(max.iter()).enumerate() {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(SpatialError::InvalidEnvelope(format!(
                    "non-finite coordinate on axis {}",
                    axis
                )));
            }
            if lo > hi {
                return Err(SpatialError::InvalidEnvelope(format!(
                    "min {} exceeds max {} on axis {}",
                    lo, hi, axis
                )));
            }
        }
        Ok(Envelope { min, max })
    }

    /// Creates a 2-D envelope from two opposite corners in any order.
    ///
    /// A NaN corner coordinate is kept as-is so the envelope fails
    /// validation when it is indexed.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Envelope {
        let (min_x, max_x) = ordered(x1, x2);
        let (min_y, max_y) = ordered(y1, y2);
        Envelope {
            min: vec![min_x, min_y],
            max: vec![max_x, max_y],
        }
    }

    /// Creates a degenerate envelope covering a single point.
    pub fn point(coords: &[f64]) -> Envelope {
        Envelope {
            min: coords.to_vec(),
            max: coords.to_vec(),
        }
    }

    /// Creates a null envelope of the given dimension.
    pub fn null(dimension: usize) -> Envelope {
        Envelope {
            min: vec![f64::INFINITY; dimension],
            max: vec![f64::NEG_INFINITY; dimension],
        }
    }

    pub(crate) fn from_raw(min: Vec<f64>, max: Vec<f64>) -> Envelope {
        Envelope { min, max }
    }

    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    pub fn is_null(&self) -> bool {
        self.min.is_empty() || self.min.iter().zip(&self.max).any(|(lo, hi)| lo > hi)
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    pub fn min_at(&self, axis: usize) -> f64 {
        self.min[axis]
    }

    pub fn max_at(&self, axis: usize) -> f64 {
        self.max[axis]
    }

    /// Extent along one axis, zero for null envelopes.
    pub fn extent(&self, axis: usize) -> f64 {
        if self.is_null() {
            0.0
        } else {
            self.max[axis] - self.min[axis]
        }
    }

    /// The n-dimensional volume (area in 2-D).
    pub fn area(&self) -> f64 {
        if self.is_null() {
            return 0.0;
        }
        (0..self.dimension()).map(|axis| self.extent(axis)).product()
    }

    /// Sum of extents, the R*-tree "margin".
    pub fn margin(&self) -> f64 {
        if self.is_null() {
            return 0.0;
        }
        (0..self.dimension()).map(|axis| self.extent(axis)).sum()
    }

    pub fn center(&self) -> Vec<f64> {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    pub fn intersects(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() || self.dimension() != other.dimension() {
            return false;
        }
        (0..self.dimension())
            .all(|axis| self.min[axis] <= other.max[axis] && self.max[axis] >= other.min[axis])
    }

    /// Checks whether `other` lies completely inside this envelope.
    pub fn contains(&self, other: &Envelope) -> bool {
        if self.is_null() || other.is_null() || self.dimension() != other.dimension() {
            return false;
        }
        (0..self.dimension())
            .all(|axis| self.min[axis] <= other.min[axis] && self.max[axis] >= other.max[axis])
    }

    /// Returns the smallest envelope covering both inputs.
    pub fn union(&self, other: &Envelope) -> Envelope {
        let mut merged = self.clone();
        merged.expand_to_include(other);
        merged
    }

    pub fn expand_to_include(&mut self, other: &Envelope) {
        if other.is_null() {
            return;
        }
        if self.is_null() {
            *self = other.clone();
            return;
        }
        for axis in 0..self.dimension() {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    /// Area growth needed for this envelope to also cover `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Area of the union that neither input covers, used to pick split seeds.
    pub fn dead_space(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area() - other.area()
    }

    /// Volume of the intersection, zero when disjoint.
    pub fn overlap(&self, other: &Envelope) -> f64 {
        if !self.intersects(other) {
            return 0.0;
        }
        (0..self.dimension())
            .map(|axis| self.max[axis].min(other.max[axis]) - self.min[axis].max(other.min[axis]))
            .product()
    }

    /// Squared distance between the centres of two envelopes.
    pub fn center_distance_sq(&self, other: &Envelope) -> f64 {
        self.center()
            .iter()
            .zip(other.center())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

impl Eq for Envelope {}

impl Hash for Envelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in self.min.iter().chain(self.max.iter()) {
            value.to_bits().hash(state);
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "Envelope(null, {}d)", self.dimension());
        }
        write!(f, "Envelope({:?} .. {:?})", self.min, self.max)
    }
}

// f64::min/max would silently drop a NaN operand
fn ordered(a: f64, b: f64) -> (f64, f64) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}
