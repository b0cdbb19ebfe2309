//! The per-shape allocation algorithm: two-stage spherical intersection
//! between an input shape, the surrogate granules, and the grid cells.

use geo::Rect;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use crate::grid::GridDef;
use crate::location::Location;
use crate::surrogate::{Granule, SrgData};

/// One grid cell's share of an allocation: a private copy, never the shared
/// grid cell itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCell {
    pub row: usize,
    pub col: usize,
    pub weight: f64,
}

/// The allocation of a single input shape onto a grid. Created fresh per
/// (shape × surrogate) request and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct GriddedSrg {
    location: Arc<Location>,
    cells: Vec<WeightedCell>,
    covered: bool,
    nx: usize,
    ny: usize,
    total_weight: f64,
}

impl GriddedSrg {
    pub(crate) fn from_parts(
        location: Arc<Location>,
        cells: Vec<WeightedCell>,
        covered: bool,
        nx: usize,
        ny: usize,
        total_weight: f64,
    ) -> Self {
        GriddedSrg { location, cells, covered, nx, ny, total_weight }
    }

    #[inline]
    pub fn location(&self) -> &Arc<Location> { &self.location }

    /// Sparse per-cell weights; order is not meaningful, entries carry
    /// explicit (row, col) keys.
    #[inline]
    pub fn cells(&self) -> &[WeightedCell] { &self.cells }

    /// Whether the input shape is completely covered by the grid.
    #[inline]
    pub fn covered(&self) -> bool { self.covered }

    #[inline]
    pub fn nx(&self) -> usize { self.nx }

    #[inline]
    pub fn ny(&self) -> usize { self.ny }

    /// Raw total surrogate weight found inside the input shape (the
    /// normalization denominator of the per-cell weights).
    #[inline]
    pub fn total_weight(&self) -> f64 { self.total_weight }
}

#[inline]
fn rects_overlap(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && b.min().x <= a.max().x
        && a.min().y <= b.max().y && b.min().y <= a.max().y
}

/// Allocate one unit of the quantity attached to `loc` across the grid,
/// weighted by the surrogate dataset.
///
/// Stage 1 finds candidate grid cells (bounding-box pre-filter) and clips
/// every candidate granule to the shape footprint, accumulating the
/// normalization denominator. Stage 2 intersects each clipped granule with
/// each candidate cell's footprint. Both stages fork-join over their index
/// ranges, and all reductions run in index order, so repeated runs produce
/// bit-identical results regardless of scheduling.
///
/// A zero total surrogate weight inside the shape is not an error: the
/// result simply has no cells, and callers must treat it as "nothing to
/// allocate".
pub fn allocate(grid: &GridDef, data: &SrgData, loc: Arc<Location>) -> GriddedSrg {
    let covered = grid.extent().contains(loc.footprint());
    let empty = |total| {
        GriddedSrg::from_parts(loc.clone(), Vec::new(), covered, grid.nx(), grid.ny(), total)
    };

    let Some(bounds) = loc.bounds() else {
        return empty(0.0);
    };

    // Stage 1a: candidate grid cells by cheap bounding-box overlap.
    let candidate_cells: Vec<usize> = grid
        .cells()
        .par_iter()
        .enumerate()
        .filter(|(_, cell)| cell.bounds().map_or(false, |b| rects_overlap(&b, &bounds)))
        .map(|(i, _)| i)
        .collect();

    // Stage 1b: clip the granules near the shape to the shape footprint,
    // keeping only nonempty intersections.
    let clipped: Vec<Granule> = data
        .granules_overlapping(&bounds)
        .par_iter()
        .filter_map(|&i| {
            let g = &data.granules()[i];
            let isect = g.footprint().intersection(loc.footprint());
            (!isect.is_empty()).then(|| Granule::new(g.weight(), isect))
        })
        .collect();

    let total_weight: f64 = clipped.iter().map(|g| g.weight() * g.footprint().area()).sum();
    debug!(
        location = %loc,
        cells = candidate_cells.len(),
        granules = clipped.len(),
        total_weight,
        "stage 1 complete"
    );
    if total_weight == 0.0 {
        return empty(total_weight);
    }

    // Stage 2: weight each candidate cell by its share of the clipped
    // granules. Cells that end up with no weight are dropped.
    let cells: Vec<WeightedCell> = candidate_cells
        .par_iter()
        .filter_map(|&i| {
            let cell = &grid.cells()[i];
            let mut weight = 0.0;
            for g in &clipped {
                let isect = g.footprint().intersection(cell.footprint());
                if isect.is_empty() {
                    continue;
                }
                weight += g.weight() * isect.area() / total_weight;
            }
            (weight > 0.0).then(|| WeightedCell { row: cell.row, col: cell.col, weight })
        })
        .collect();

    GriddedSrg::from_parts(loc, cells, covered, grid.nx(), grid.ny(), total_weight)
}
