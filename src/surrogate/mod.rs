//! Surrogate datasets: pre-indexed collections of weighted spatial granules
//! used to distribute a source shape's quantity non-uniformly across grid
//! cells (by population, road density, land cover, ...).

mod codec;

use ahash::AHashMap;
use anyhow::{bail, Result};
use geo::{MultiPolygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::sph::{CellUnion, Coverer};

/// Sentinel filter spec meaning "include all rows".
pub const NO_FILTER: &str = "NONE";

/// One atomic weighted footprint of a surrogate dataset.
#[derive(Debug, Clone)]
pub struct Granule {
    weight: f64,
    footprint: CellUnion,
}

impl Granule {
    pub fn new(weight: f64, footprint: CellUnion) -> Self {
        Granule { weight, footprint }
    }

    #[inline]
    pub fn weight(&self) -> f64 { self.weight }

    #[inline]
    pub fn footprint(&self) -> &CellUnion { &self.footprint }
}

#[derive(Debug, Clone)]
struct GranuleBound {
    idx: usize,
    bbox: Rect<f64>,
}

impl RTreeObject for GranuleBound {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.bbox.min().into(), self.bbox.max().into())
    }
}

/// A raw surrogate input row: a lon/lat shape, its weight, and attribute
/// values a [`SurrogateFilter`] can match against.
#[derive(Debug, Clone)]
pub struct SurrogateRow {
    pub weight: f64,
    pub shape: MultiPolygon<f64>,
    pub attrs: AHashMap<String, String>,
}

/// Restricts which raw rows become granules when a dataset is built.
/// Filtering never happens during allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurrogateFilter {
    pub column: String,
    /// True for `column=...` (inclusion), false for `column!=...` (exclusion).
    pub include: bool,
    pub values: Vec<String>,
}

impl SurrogateFilter {
    /// Parse a compact filter spec: `column=a,b,c` keeps rows whose column
    /// matches one of the values, `column!=a,b,c` drops them. The empty
    /// string and the sentinel `NONE` mean "no filter".
    pub fn parse(spec: &str) -> Result<Option<SurrogateFilter>> {
        let spec = spec.trim();
        if spec.is_empty() || spec == NO_FILTER {
            return Ok(None);
        }
        let (column, include, rest) = if let Some((c, r)) = spec.split_once("!=") {
            (c, false, r)
        } else if let Some((c, r)) = spec.split_once('=') {
            (c, true, r)
        } else {
            bail!("invalid surrogate filter `{spec}`: expected `column=values` or `column!=values`");
        };
        Ok(Some(SurrogateFilter {
            column: column.trim().to_owned(),
            include,
            values: rest.split(',').map(|v| v.trim().to_owned()).collect(),
        }))
    }

    /// Whether a row with the given attributes passes the filter.
    pub fn matches(&self, attrs: &AHashMap<String, String>) -> bool {
        let value = attrs.get(&self.column).map(String::as_str).unwrap_or("");
        let found = self.values.iter().any(|v| v == value.trim());
        found == self.include
    }
}

/// A flat, immutable, pre-indexed granule set. Built once per surrogate
/// specification and reused (read-only, so safe to share across threads)
/// for many input-shape requests.
#[derive(Debug)]
pub struct SrgData {
    granules: Vec<Granule>,
    rtree: RTree<GranuleBound>,
}

impl SrgData {
    pub fn new(granules: Vec<Granule>) -> Self {
        let rtree = RTree::bulk_load(
            granules
                .iter()
                .enumerate()
                .filter_map(|(i, g)| {
                    g.footprint.rect_bound().map(|bbox| GranuleBound { idx: i, bbox })
                })
                .collect(),
        );
        SrgData { granules, rtree }
    }

    /// Build a dataset from raw rows, applying the filter and covering each
    /// shape at the given resolution. Rows with zero weight or an empty
    /// footprint carry no information and are dropped.
    pub fn from_rows(
        rows: &[SurrogateRow],
        filter: Option<&SurrogateFilter>,
        coverer: Coverer,
    ) -> Self {
        let granules = rows
            .iter()
            .filter(|row| filter.map_or(true, |f| f.matches(&row.attrs)))
            .filter_map(|row| {
                let footprint = coverer.cover(&row.shape);
                (row.weight != 0.0 && !footprint.is_empty())
                    .then(|| Granule::new(row.weight, footprint))
            })
            .collect();
        Self::new(granules)
    }

    #[inline]
    pub fn granules(&self) -> &[Granule] { &self.granules }

    #[inline]
    pub fn len(&self) -> usize { self.granules.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.granules.is_empty() }

    /// Indices of granules whose bounds overlap `bounds`, in index order so
    /// downstream accumulation is deterministic.
    pub(crate) fn granules_overlapping(&self, bounds: &Rect<f64>) -> Vec<usize> {
        let envelope = AABB::from_corners(bounds.min().into(), bounds.max().into());
        let mut idxs: Vec<usize> = self
            .rtree
            .locate_in_envelope_intersecting(&envelope)
            .map(|b| b.idx)
            .collect();
        idxs.sort_unstable();
        idxs
    }
}
