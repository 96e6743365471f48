//! Hilbert curve utilities for spatial locality during bulk loads.
//!
//! The Hilbert curve is a continuous fractal space-filling curve that maps
//! `d`-dimensional grid cells to a 1-D index while preserving locality:
//! consecutive indices are always neighbouring cells. Bulk loading sorts
//! entries by the index of their centre so that runs of entries packed into
//! one leaf are spatially close.
//!
//! The transform is Skilling's "transpose" formulation, which works for any
//! number of dimensions.

use crate::envelope::Envelope;
use crate::rtree::{SpatialError, SpatialResult};

/// Maximum number of index bits (`dimension * order`) a curve may use.
pub const MAX_CURVE_BITS: u32 = 30;

/// Iterator over every cell of a `dimension`-dimensional grid with `2^order`
/// cells per axis, in Hilbert order.
///
/// The iterator is finite and single-pass: it yields exactly
/// `2^(dimension * order)` cells and then stays exhausted.
///
/// ```rust
/// use spatial_index::HilbertCurve;
///
/// let cells: Vec<Vec<u32>> = HilbertCurve::new(2, 1).unwrap().collect();
/// assert_eq!(cells, vec![vec![0, 0], vec![0, 1], vec![1, 1], vec![1, 0]]);
/// ```
#[derive(Debug, Clone)]
pub struct HilbertCurve {
    dimension: usize,
    order: u32,
    next: u64,
    total: u64,
}

impl HilbertCurve {
    /// Creates the curve, rejecting empty grids and grids whose index would
    /// not fit in [`MAX_CURVE_BITS`] bits.
    pub fn new(dimension: usize, order: u32) -> SpatialResult<HilbertCurve> {
        check_curve(dimension, order)?;
        Ok(HilbertCurve {
            dimension,
            order,
            next: 0,
            total: 1u64 << (dimension as u32 * order),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Number of cells on the whole curve.
    pub fn cell_count(&self) -> u64 {
        self.total
    }
}

impl Iterator for HilbertCurve {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Vec<u32>> {
        if self.next >= self.total {
            return None;
        }
        let cell = coords_unchecked(self.next, self.dimension, self.order);
        self.next += 1;
        Some(cell)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.total - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for HilbertCurve {}

impl std::iter::FusedIterator for HilbertCurve {}

fn check_curve(dimension: usize, order: u32) -> SpatialResult<()> {
    if dimension == 0 {
        return Err(SpatialError::Indexing(
            "hilbert curve needs at least one dimension".into(),
        ));
    }
    if order == 0 {
        return Err(SpatialError::Indexing(
            "hilbert curve order must be at least 1".into(),
        ));
    }
    if dimension as u64 * order as u64 > MAX_CURVE_BITS as u64 {
        return Err(SpatialError::Indexing(format!(
            "dimension {} * order {} exceeds {} bits",
            dimension, order, MAX_CURVE_BITS
        )));
    }
    Ok(())
}

/// Position of a grid cell along the curve.
///
/// # Errors
/// [`SpatialError::Indexing`] for invalid curve parameters or coordinates
/// outside the `2^order` grid.
pub fn hilbert_index(coords: &[u32], order: u32) -> SpatialResult<u64> {
    check_curve(coords.len(), order)?;
    let side = 1u64 << order;
    if let Some(bad) = coords.iter().find(|c| **c as u64 >= side) {
        return Err(SpatialError::Indexing(format!(
            "coordinate {} outside grid of side {}",
            bad, side
        )));
    }
    Ok(index_unchecked(coords, order))
}

/// Grid cell at a position along the curve; inverse of [`hilbert_index`].
pub fn hilbert_coords(index: u64, dimension: usize, order: u32) -> SpatialResult<Vec<u32>> {
    check_curve(dimension, order)?;
    let total = 1u64 << (dimension as u32 * order);
    if index >= total {
        return Err(SpatialError::Indexing(format!(
            "index {} outside curve of {} cells",
            index, total
        )));
    }
    Ok(coords_unchecked(index, dimension, order))
}

/// Maps a point inside `bounds` to its grid cell at the given order.
///
/// Axes with zero extent map to the middle cell.
pub fn grid_cell(point: &[f64], bounds: &Envelope, order: u32) -> Vec<u32> {
    let side = 1u64 << order;
    point
        .iter()
        .enumerate()
        .map(|(axis, value)| {
            let range = bounds.extent(axis);
            let normalized = if range > 0.0 {
                ((value - bounds.min_at(axis)) / range).clamp(0.0, 1.0)
            } else {
                0.5
            };
            let cell = (normalized * (side as f64 - 0.5)) as u64;
            cell.min(side - 1) as u32
        })
        .collect()
}

fn index_unchecked(coords: &[u32], order: u32) -> u64 {
    let mut x = coords.to_vec();
    axes_to_transpose(&mut x, order);

    let mut index = 0u64;
    for bit in (0..order).rev() {
        for value in &x {
            index = (index << 1) | ((*value >> bit) & 1) as u64;
        }
    }
    index
}

fn coords_unchecked(index: u64, dimension: usize, order: u32) -> Vec<u32> {
    let mut x = vec![0u32; dimension];
    let mut remaining = dimension as u32 * order;
    for bit in (0..order).rev() {
        for value in x.iter_mut() {
            remaining -= 1;
            *value |= (((index >> remaining) & 1) as u32) << bit;
        }
    }
    transpose_to_axes(&mut x, order);
    x
}

fn axes_to_transpose(x: &mut [u32], order: u32) {
    let n = x.len();
    let m = 1u32 << (order - 1);

    // inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for value in x.iter_mut() {
        *value ^= t;
    }
}

fn transpose_to_axes(x: &mut [u32], order: u32) {
    let n = x.len();
    let top = 2u32 << (order - 1);

    // gray decode
    let t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;

    // undo excess work
    let mut q = 2u32;
    while q != top {
        let p = q - 1;
        for i in (0..n).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}
