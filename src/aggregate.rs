//! Turning sparse allocation results into dense grid arrays, merging
//! results, and exporting per-cell records.

use anyhow::{bail, Result};
use ndarray::Array2;
use serde::Serialize;
use std::sync::Arc;

use crate::alloc::{GriddedSrg, WeightedCell};

/// One surviving grid cell of an allocation, in a form suitable for
/// persisted geometry output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SrgRecord {
    pub row: usize,
    pub col: usize,
    /// Stable hash of the originating input shape's identifier.
    pub input_id: String,
    pub weight: f64,
    pub covered: bool,
}

impl GriddedSrg {
    /// Convert the sparse cell weights into a dense ny×nx array, summing
    /// duplicate (row, col) entries. Returns `None` when the summed weight
    /// is zero — "nothing to allocate", which is distinct from an error.
    /// Only a fully covered shape is rescaled so the array sums to 1; a
    /// partially covered shape keeps its raw weights, which represent the
    /// portion of the shape actually inside the grid.
    pub fn to_dense(&self) -> Option<Array2<f64>> {
        let mut out = Array2::<f64>::zeros((self.ny(), self.nx()));
        for cell in self.cells() {
            out[[cell.row, cell.col]] += cell.weight;
        }
        let sum = out.sum();
        if sum == 0.0 {
            return None;
        }
        if self.covered() {
            out.mapv_inplace(|v| v / sum);
        }
        Some(out)
    }

    /// Per-cell export records for the surviving cells.
    pub fn export_records(&self) -> Vec<SrgRecord> {
        let input_id = self.location().hash();
        self.cells()
            .iter()
            .map(|c| SrgRecord {
                row: c.row,
                col: c.col,
                input_id: input_id.clone(),
                weight: c.weight,
                covered: self.covered(),
            })
            .collect()
    }
}

/// Merge several allocations of the same shape, scaling each by the
/// corresponding factor. Cell entries are concatenated, not deduplicated:
/// duplicate (row, col) pairs across components are expected and summed
/// later by [`GriddedSrg::to_dense`]. The covered flag and originating
/// shape are taken from the first component.
pub fn merge(srgs: &[Arc<GriddedSrg>], factors: &[f64]) -> Result<GriddedSrg> {
    let Some(first) = srgs.first() else {
        bail!("merging zero surrogate components");
    };
    if srgs.len() != factors.len() {
        bail!("merging {} components with {} factors", srgs.len(), factors.len());
    }
    let (nx, ny) = (first.nx(), first.ny());
    let mut cells = Vec::new();
    for (srg, &factor) in srgs.iter().zip(factors) {
        if (srg.nx(), srg.ny()) != (nx, ny) {
            bail!(
                "merging grids of different dimensions: {}x{} vs {}x{}",
                ny,
                nx,
                srg.ny(),
                srg.nx()
            );
        }
        cells.extend(srg.cells().iter().map(|c| WeightedCell {
            row: c.row,
            col: c.col,
            weight: c.weight * factor,
        }));
    }
    Ok(GriddedSrg::from_parts(
        first.location().clone(),
        cells,
        first.covered(),
        nx,
        ny,
        first.total_weight(),
    ))
}
