//! Input shapes: the source geometries whose quantities get allocated.

use anyhow::Result;
use geo::{MultiPolygon, Rect};
use sha2::{Digest, Sha256};

use crate::proj::{GeoTransform, SpatialRef};
use crate::sph::{CellUnion, Coverer};

/// One emission source's geometry, identified by a location key used for
/// caching and error messages.
#[derive(Debug, Clone)]
pub struct Location {
    id: String,
    footprint: CellUnion,
    bounds: Option<Rect<f64>>,
}

impl Location {
    /// Build a location from a lon/lat multipolygon.
    pub fn new(id: impl Into<String>, shape: &MultiPolygon<f64>, coverer: Coverer) -> Self {
        let footprint = coverer.cover(shape);
        let bounds = footprint.rect_bound();
        Location { id: id.into(), footprint, bounds }
    }

    /// Build a location from a multipolygon in an arbitrary reference
    /// system, reprojecting to lon/lat first. A transform failure aborts;
    /// no partial location is produced.
    pub fn from_projected(
        id: impl Into<String>,
        shape: &MultiPolygon<f64>,
        sr: &SpatialRef,
        coverer: Coverer,
    ) -> Result<Self> {
        let ll = GeoTransform::to_lonlat(sr)?.multi_polygon(shape)?;
        Ok(Self::new(id, &ll, coverer))
    }

    #[inline]
    pub fn id(&self) -> &str { &self.id }

    #[inline]
    pub fn footprint(&self) -> &CellUnion { &self.footprint }

    /// Lon/lat bounding rectangle of the footprint; `None` for an empty shape.
    #[inline]
    pub fn bounds(&self) -> Option<Rect<f64>> { self.bounds }

    /// Short stable hash of the location id, for export records.
    pub fn hash(&self) -> String {
        let digest = Sha256::digest(self.id.as_bytes());
        hex::encode(&digest[..8])
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}
