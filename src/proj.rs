//! Spatial references and fallible coordinate transforms.
//!
//! Grids are built in a "working" reference system (often a projected CRS)
//! while all footprint math happens on the sphere in lon/lat. Transform
//! failures abort construction; no partial grid or shape is ever produced.

use anyhow::{anyhow, Context, Result};
use geo::{Coord, MapCoords, MultiPolygon, Polygon};
use proj4rs::{proj::Proj as Proj4, transform::transform};

/// PROJ.4 definition of the internal geographic reference.
pub const LONLAT_PROJ4: &str = "+proj=longlat +datum=WGS84 +no_defs +type=crs";

/// A validated PROJ.4 spatial reference definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialRef {
    def: String,
}

impl SpatialRef {
    /// Parse and validate a PROJ.4 definition string.
    pub fn new(def: &str) -> Result<Self> {
        Proj4::from_proj_string(def)
            .with_context(|| format!("invalid PROJ.4 definition `{def}`"))?;
        Ok(SpatialRef { def: def.to_owned() })
    }

    /// The internal WGS84 lon/lat reference.
    pub fn lonlat() -> Self {
        SpatialRef { def: LONLAT_PROJ4.to_owned() }
    }

    #[inline]
    pub fn definition(&self) -> &str { &self.def }

    /// Whether coordinates in this reference are geographic degrees.
    fn is_geographic(&self) -> bool {
        ["+proj=longlat", "+proj=latlong", "+proj=lonlat", "+proj=latlon"]
            .iter()
            .any(|p| self.def.contains(p))
    }

    fn proj(&self) -> Result<Proj4> {
        Proj4::from_proj_string(&self.def)
            .with_context(|| format!("invalid PROJ.4 definition `{}`", self.def))
    }
}

/// A one-way transform between two spatial references.
///
/// proj4rs works in radians on geographic ends; the degree conversion is
/// handled here so callers only ever see degrees for lon/lat references.
pub struct GeoTransform {
    from: Proj4,
    to: Proj4,
    from_ll: bool,
    to_ll: bool,
}

impl GeoTransform {
    pub fn new(from: &SpatialRef, to: &SpatialRef) -> Result<Self> {
        let (from_ll, to_ll) = (from.is_geographic(), to.is_geographic());
        Ok(GeoTransform { from: from.proj()?, to: to.proj()?, from_ll, to_ll })
    }

    /// Transform from a working reference to lon/lat.
    pub fn to_lonlat(from: &SpatialRef) -> Result<Self> {
        Self::new(from, &SpatialRef::lonlat())
    }

    pub fn coord(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        let mut pt = if self.from_ll {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        transform(&self.from, &self.to, &mut pt)
            .map_err(|e| anyhow!("coordinate transform failed at ({}, {}): {e}", c.x, c.y))?;
        Ok(if self.to_ll {
            Coord { x: pt.0.to_degrees(), y: pt.1.to_degrees() }
        } else {
            Coord { x: pt.0, y: pt.1 }
        })
    }

    pub fn polygon(&self, shape: &Polygon<f64>) -> Result<Polygon<f64>> {
        shape.try_map_coords(|c| self.coord(c))
    }

    pub fn multi_polygon(&self, shape: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        shape.try_map_coords(|c| self.coord(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn lonlat_roundtrip_is_identity() {
        let tf = GeoTransform::to_lonlat(&SpatialRef::lonlat()).unwrap();
        let c = tf.coord(Coord { x: -93.1, y: 44.9 }).unwrap();
        assert!((c.x - -93.1).abs() < 1e-9);
        assert!((c.y - 44.9).abs() < 1e-9);
    }

    #[test]
    fn projected_reference_produces_degrees() {
        let utm = SpatialRef::new("+proj=utm +zone=15 +datum=WGS84 +units=m +no_defs +type=crs")
            .unwrap();
        let tf = GeoTransform::to_lonlat(&utm).unwrap();
        // UTM zone 15 central meridian is 93°W; its 500 km false easting maps back there.
        let c = tf.coord(Coord { x: 500_000.0, y: 4_980_000.0 }).unwrap();
        assert!((c.x - -93.0).abs() < 1e-6);
        assert!(c.y > 44.0 && c.y < 46.0);
    }

    #[test]
    fn invalid_definition_is_rejected() {
        assert!(SpatialRef::new("+proj=not_a_projection").is_err());
    }

    #[test]
    fn polygon_transform_preserves_ring_structure() {
        let tf = GeoTransform::to_lonlat(&SpatialRef::lonlat()).unwrap();
        let poly = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ];
        let out = tf.polygon(&poly).unwrap();
        assert_eq!(out.exterior().0.len(), poly.exterior().0.len());
    }
}
