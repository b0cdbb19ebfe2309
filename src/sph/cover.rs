//! Covering lon/lat polygons with spherical cells.

use geo::{BoundingRect, Contains, MultiPolygon, Point, Polygon, Rect, Relate};

use super::{CellId, CellUnion, MAX_LEVEL};

/// Smallest level whose cells are no wider than `tol` degrees.
pub fn level_for_tolerance(tol: f64) -> u8 {
    if tol <= 0.0 {
        return MAX_LEVEL;
    }
    let mut level = 0u8;
    let mut size = 180.0f64;
    while size > tol && level < MAX_LEVEL {
        size /= 2.0;
        level += 1;
    }
    level
}

/// Builds cell-union footprints for lon/lat geometries.
///
/// Cells fully inside the shape are emitted at their natural level;
/// straddling cells are subdivided down to `max_level`, where a cell is
/// kept iff its center lies inside the shape. The traversal order is fixed,
/// so coverings are deterministic.
#[derive(Debug, Clone, Copy)]
pub struct Coverer {
    max_level: u8,
}

impl Default for Coverer {
    fn default() -> Self {
        // ~0.04° leaves; fine enough for km-scale grids.
        Coverer { max_level: 12 }
    }
}

impl Coverer {
    pub fn new(max_level: u8) -> Self {
        Coverer { max_level: max_level.min(MAX_LEVEL) }
    }

    #[inline]
    pub fn max_level(&self) -> u8 { self.max_level }

    /// Footprint of a lon/lat multipolygon.
    pub fn cover(&self, shape: &MultiPolygon<f64>) -> CellUnion {
        let Some(bbox) = shape.bounding_rect() else {
            return CellUnion::default();
        };
        let mut ids = Vec::new();
        for face in 0..2 {
            self.descend(CellId::root(face), shape, &bbox, &mut ids);
        }
        CellUnion::new(ids)
    }

    /// Footprint of a single lon/lat polygon.
    pub fn cover_polygon(&self, shape: &Polygon<f64>) -> CellUnion {
        self.cover(&MultiPolygon::new(vec![shape.clone()]))
    }

    fn descend(&self, cell: CellId, shape: &MultiPolygon<f64>, bbox: &Rect<f64>, out: &mut Vec<CellId>) {
        let (lon0, lon1, lat0, lat1) = cell.bounds_deg();
        if lon1 < bbox.min().x || lon0 > bbox.max().x || lat1 < bbox.min().y || lat0 > bbox.max().y {
            return;
        }
        let rect = Rect::new((lon0, lat0), (lon1, lat1)).to_polygon();
        let im = shape.relate(&rect);
        if !im.is_intersects() {
            return;
        }
        if im.is_contains() {
            out.push(cell);
            return;
        }
        if cell.level() >= self.max_level {
            let center = Point::new((lon0 + lon1) / 2.0, (lat0 + lat1) / 2.0);
            if shape.contains(&center) {
                out.push(cell);
            }
            return;
        }
        for child in cell.children() {
            self.descend(child, shape, bbox, out);
        }
    }
}
