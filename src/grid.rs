//! Output grid definitions.

use anyhow::{Context, Result};
use geo::{polygon, MultiPolygon, Rect};
use rstar::{RTree, RTreeObject, AABB};

use crate::proj::{GeoTransform, SpatialRef};
use crate::sph::{CellUnion, Coverer};

/// An individual cell in a grid: a planar geometry in the grid's working
/// reference system plus the equivalent spherical footprint used for all
/// area and intersection math.
#[derive(Debug, Clone)]
pub struct GridCell {
    pub row: usize,
    pub col: usize,
    /// Accumulated allocation weight; zero until populated by a consumer.
    pub weight: f64,
    /// Optional label (e.g. a timezone) carried along but unused here.
    pub timezone: Option<String>,
    geom: MultiPolygon<f64>,
    footprint: CellUnion,
}

impl GridCell {
    #[inline]
    pub fn geom(&self) -> &MultiPolygon<f64> { &self.geom }

    #[inline]
    pub fn footprint(&self) -> &CellUnion { &self.footprint }

    /// Lon/lat bounding rectangle of the spherical footprint.
    #[inline]
    pub fn bounds(&self) -> Option<Rect<f64>> { self.footprint.rect_bound() }
}

/// Bounding box entry in the cell index, associated with a cell by index.
#[derive(Debug, Clone)]
struct CellBound {
    idx: usize,
    bbox: Rect<f64>,
}

impl RTreeObject for CellBound {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.bbox.min().into(), self.bbox.max().into())
    }
}

/// A match from [`GridDef::locate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridMatch {
    pub row: usize,
    pub col: usize,
    /// Fraction of the query's total spherical area inside this cell.
    pub fraction: f64,
}

/// Result of locating a query footprint on the grid.
#[derive(Debug, Clone, Default)]
pub struct GridLocate {
    /// Every cell the query overlaps, with independent per-cell fractions.
    /// A query straddling k cells yields k fractions summing to the query's
    /// overall grid-coverage fraction; cells sharing an edge with the query
    /// are all reported (no tie-break).
    pub matches: Vec<GridMatch>,
    /// True iff the query intersects at least one cell.
    pub in_grid: bool,
    /// True iff overlap area / query area exceeds 0.9999.
    pub covered: bool,
}

/// The grid that quantities are allocated to. The cell list, spatial index,
/// and coverage extent are built once at construction and never mutated.
#[derive(Debug)]
pub struct GridDef {
    name: String,
    nx: usize,
    ny: usize,
    dx: f64,
    dy: f64,
    x0: f64,
    y0: f64,
    sr: SpatialRef,
    irregular: bool,
    coverer: Coverer,
    cells: Vec<GridCell>,
    extent: CellUnion,
    rtree: RTree<CellBound>,
}

impl GridDef {
    /// Create a regular grid of `nx`×`ny` rectangular cells of size
    /// `dx`×`dy` starting at `(x0, y0)` in the working reference `sr`.
    /// Any projection failure aborts; there is no partial grid.
    #[allow(clippy::too_many_arguments)]
    pub fn new_regular(
        name: impl Into<String>,
        nx: usize,
        ny: usize,
        dx: f64,
        dy: f64,
        x0: f64,
        y0: f64,
        sr: &SpatialRef,
        coverer: Coverer,
    ) -> Result<Self> {
        let name = name.into();
        let tf = GeoTransform::to_lonlat(sr)
            .with_context(|| format!("grid `{name}`: working reference"))?;

        let mut cells = Vec::with_capacity(nx * ny);
        for iy in 0..ny {
            for ix in 0..nx {
                let x = x0 + ix as f64 * dx;
                let y = y0 + iy as f64 * dy;
                let ring = polygon![
                    (x: x, y: y),
                    (x: x + dx, y: y),
                    (x: x + dx, y: y + dy),
                    (x: x, y: y + dy),
                    (x: x, y: y),
                ];
                let ll = tf
                    .polygon(&ring)
                    .with_context(|| format!("grid `{name}`: projecting cell ({iy}, {ix})"))?;
                cells.push(GridCell {
                    row: iy,
                    col: ix,
                    weight: 0.0,
                    timezone: None,
                    footprint: coverer.cover_polygon(&ll),
                    geom: MultiPolygon::new(vec![ring]),
                });
            }
        }

        let outline = polygon![
            (x: x0, y: y0),
            (x: x0 + dx * nx as f64, y: y0),
            (x: x0 + dx * nx as f64, y: y0 + dy * ny as f64),
            (x: x0, y: y0 + dy * ny as f64),
            (x: x0, y: y0),
        ];
        let extent = coverer.cover_polygon(
            &tf.polygon(&outline)
                .with_context(|| format!("grid `{name}`: projecting extent"))?,
        );

        Ok(GridDef {
            rtree: Self::index(&cells),
            name,
            nx,
            ny,
            dx,
            dy,
            x0,
            y0,
            sr: sr.clone(),
            irregular: false,
            coverer,
            cells,
            extent,
        })
    }

    /// Create an irregular grid from a list of polygons, one cell per
    /// polygon, with a single column (`nx = 1`, `ny = len`). Geometries in
    /// `input_sr` are reprojected into the working reference `output_sr`;
    /// footprints are computed exactly as for regular grids.
    pub fn new_irregular(
        name: impl Into<String>,
        geoms: &[MultiPolygon<f64>],
        input_sr: &SpatialRef,
        output_sr: &SpatialRef,
        coverer: Coverer,
    ) -> Result<Self> {
        let name = name.into();
        let tf = GeoTransform::new(input_sr, output_sr)
            .with_context(|| format!("grid `{name}`: reference pair"))?;
        let ll = GeoTransform::to_lonlat(output_sr)
            .with_context(|| format!("grid `{name}`: working reference"))?;

        let mut cells = Vec::with_capacity(geoms.len());
        for (i, g) in geoms.iter().enumerate() {
            let working = tf
                .multi_polygon(g)
                .with_context(|| format!("grid `{name}`: reprojecting shape {i}"))?;
            let lonlat = ll
                .multi_polygon(&working)
                .with_context(|| format!("grid `{name}`: projecting shape {i}"))?;
            cells.push(GridCell {
                row: i,
                col: 0,
                weight: 0.0,
                timezone: None,
                footprint: coverer.cover(&lonlat),
                geom: working,
            });
        }
        let extent = CellUnion::union_all(cells.iter().map(|c| &c.footprint));

        Ok(GridDef {
            rtree: Self::index(&cells),
            name,
            nx: 1,
            ny: cells.len(),
            dx: 0.0,
            dy: 0.0,
            x0: 0.0,
            y0: 0.0,
            sr: output_sr.clone(),
            irregular: true,
            coverer,
            cells,
            extent,
        })
    }

    fn index(cells: &[GridCell]) -> RTree<CellBound> {
        RTree::bulk_load(
            cells
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.bounds().map(|bbox| CellBound { idx: i, bbox }))
                .collect(),
        )
    }

    #[inline] pub fn name(&self) -> &str { &self.name }

    #[inline] pub fn nx(&self) -> usize { self.nx }

    #[inline] pub fn ny(&self) -> usize { self.ny }

    #[inline] pub fn is_irregular(&self) -> bool { self.irregular }

    #[inline] pub fn sr(&self) -> &SpatialRef { &self.sr }

    #[inline] pub fn coverer(&self) -> Coverer { self.coverer }

    #[inline] pub fn cells(&self) -> &[GridCell] { &self.cells }

    /// Combined spherical coverage of the whole grid.
    #[inline] pub fn extent(&self) -> &CellUnion { &self.extent }

    #[inline]
    pub fn cell(&self, row: usize, col: usize) -> &GridCell {
        &self.cells[row * self.nx + col]
    }

    /// Cells whose lon/lat bounds overlap `bounds`, in index order.
    pub(crate) fn cells_overlapping(&self, bounds: &Rect<f64>) -> Vec<usize> {
        let envelope = AABB::from_corners(bounds.min().into(), bounds.max().into());
        let mut idxs: Vec<usize> = self
            .rtree
            .locate_in_envelope_intersecting(&envelope)
            .map(|b| b.idx)
            .collect();
        idxs.sort_unstable();
        idxs
    }

    /// Locate a query footprint on the grid: which cells it overlaps and
    /// what fraction of its total area falls in each.
    pub fn locate(&self, query: &CellUnion) -> GridLocate {
        let mut out = GridLocate::default();
        let Some(bounds) = query.rect_bound() else {
            return out;
        };
        let area = query.area();
        if area <= 0.0 {
            return out;
        }
        let mut overlap = 0.0;
        for idx in self.cells_overlapping(&bounds) {
            let cell = &self.cells[idx];
            let isect = cell.footprint.intersection(query);
            let cell_area = isect.area();
            if cell_area <= 0.0 {
                continue;
            }
            overlap += cell_area;
            out.matches.push(GridMatch {
                row: cell.row,
                col: cell.col,
                fraction: cell_area / area,
            });
        }
        out.in_grid = !out.matches.is_empty();
        out.covered = overlap / area > 0.9999;
        out
    }

    /// Locate a single lon/lat point. The point's footprint is every cell
    /// of the hierarchy touching it, so a point on a shared grid-cell edge
    /// reports both cells with fractions summing to 1.
    pub fn locate_point(&self, lon: f64, lat: f64) -> GridLocate {
        self.locate(&CellUnion::from_point(lon, lat, self.coverer.max_level()))
    }

    /// Per-cell records for persisted geometry output.
    pub fn cell_records(&self) -> impl Iterator<Item = (usize, usize, &MultiPolygon<f64>)> {
        self.cells.iter().map(|c| (c.row, c.col, &c.geom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lonlat_grid() -> GridDef {
        GridDef::new_regular(
            "test_2x2",
            2,
            2,
            45.0,
            45.0,
            0.0,
            0.0,
            &SpatialRef::lonlat(),
            Coverer::new(8),
        )
        .unwrap()
    }

    #[test]
    fn regular_grid_has_unique_row_col_pairs() {
        let grid = lonlat_grid();
        assert_eq!(grid.cells().len(), 4);
        let mut seen: Vec<(usize, usize)> =
            grid.cells().iter().map(|c| (c.row, c.col)).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 4);
        assert_eq!(grid.cell(1, 0).row, 1);
        assert_eq!(grid.cell(1, 0).col, 0);
    }

    #[test]
    fn extent_contains_every_cell_footprint() {
        let grid = lonlat_grid();
        for cell in grid.cells() {
            assert!(grid.extent().contains(cell.footprint()));
        }
    }

    #[test]
    fn locate_interior_query_lands_in_one_cell() {
        let grid = lonlat_grid();
        // A footprint strictly inside cell (0, 0).
        let q = Coverer::new(8).cover_polygon(&geo::polygon![
            (x: 10.0, y: 10.0),
            (x: 20.0, y: 10.0),
            (x: 20.0, y: 20.0),
            (x: 10.0, y: 20.0),
            (x: 10.0, y: 10.0),
        ]);
        let loc = grid.locate(&q);
        assert!(loc.in_grid);
        assert!(loc.covered);
        assert_eq!(loc.matches.len(), 1);
        assert_eq!((loc.matches[0].row, loc.matches[0].col), (0, 0));
        assert!((loc.matches[0].fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn locate_outside_query_misses_the_grid() {
        let grid = lonlat_grid();
        let loc = grid.locate_point(-50.0, -50.0);
        assert!(!loc.in_grid);
        assert!(!loc.covered);
        assert!(loc.matches.is_empty());
    }

    #[test]
    fn point_on_shared_edge_reports_both_cells() {
        let grid = lonlat_grid();
        let loc = grid.locate_point(45.0, 20.1);
        assert_eq!(loc.matches.len(), 2);
        let total: f64 = loc.matches.iter().map(|m| m.fraction).sum();
        assert!((total - 1.0).abs() < 1e-12);
        for m in &loc.matches {
            assert!(m.fraction > 0.0);
        }
    }

    #[test]
    fn irregular_grid_is_single_column() {
        let tri = MultiPolygon::new(vec![geo::polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ]]);
        let sq = MultiPolygon::new(vec![geo::polygon![
            (x: 20.0, y: 20.0),
            (x: 30.0, y: 20.0),
            (x: 30.0, y: 30.0),
            (x: 20.0, y: 30.0),
            (x: 20.0, y: 20.0),
        ]]);
        let grid = GridDef::new_irregular(
            "shapes",
            &[tri, sq],
            &SpatialRef::lonlat(),
            &SpatialRef::lonlat(),
            Coverer::new(9),
        )
        .unwrap();
        assert!(grid.is_irregular());
        assert_eq!((grid.nx(), grid.ny()), (1, 2));
        let loc = grid.locate_point(25.0, 25.0);
        assert_eq!(loc.matches.len(), 1);
        assert_eq!((loc.matches[0].row, loc.matches[0].col), (1, 0));
    }
}
