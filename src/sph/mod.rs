//! Hierarchical spherical cells and cell unions.
//!
//! A region's spherical footprint is stored as a union of lat/lon-aligned
//! cells from a fixed quadtree hierarchy: two root faces (western and
//! eastern hemisphere, each a 180°×180° square) subdivided in quads down to
//! [`MAX_LEVEL`]. Because every cell is axis-aligned on the sphere, areas
//! are exact (spherical band formula) and intersection / containment reduce
//! to integer interval tests on cell ids. This keeps all footprint math
//! projection-independent and bit-deterministic.

mod cover;

pub use cover::{level_for_tolerance, Coverer};

use geo::Rect;

/// Deepest subdivision level. Leaf cells are 180°/2^24 ≈ 1e-5° across.
pub const MAX_LEVEL: u8 = 24;

/// Bits used for the position part of a cell id (Morton bits + marker).
const POS_BITS: u32 = 2 * MAX_LEVEL as u32 + 1;

/// One cell of the spherical hierarchy.
///
/// Encoding (S2-style): the face bit, followed by the Morton-interleaved
/// (i, j) position at leaf resolution, followed by a single marker bit at
/// position `2*(MAX_LEVEL - level)`. The marker makes the id of a cell the
/// center of the leaf range it spans, so `range_min()..=range_max()` is the
/// exact interval of leaf positions it contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub u64);

impl CellId {
    /// Root cell of a face (0 = west of the antimeridian, 1 = east).
    pub fn root(face: u8) -> Self {
        debug_assert!(face < 2);
        CellId(((face as u64) << POS_BITS) | (1 << (POS_BITS - 1)))
    }

    #[inline]
    fn lsb(self) -> u64 { self.0 & self.0.wrapping_neg() }

    /// Subdivision level, 0 (face) ..= MAX_LEVEL (leaf).
    #[inline]
    pub fn level(self) -> u8 {
        MAX_LEVEL - (self.lsb().trailing_zeros() / 2) as u8
    }

    #[inline]
    pub fn face(self) -> u8 { (self.0 >> POS_BITS) as u8 }

    /// Smallest id in this cell's leaf range.
    #[inline]
    pub fn range_min(self) -> u64 { self.0 - (self.lsb() - 1) }

    /// Largest id in this cell's leaf range.
    #[inline]
    pub fn range_max(self) -> u64 { self.0 + (self.lsb() - 1) }

    /// True iff `other` is this cell or one of its descendants.
    #[inline]
    pub fn contains(self, other: CellId) -> bool {
        self.range_min() <= other.0 && other.0 <= self.range_max()
    }

    /// Parent cell; must not be called on a root cell.
    pub fn parent(self) -> CellId {
        debug_assert!(self.level() > 0);
        let nlsb = self.lsb() << 2;
        CellId((self.0 & nlsb.wrapping_neg()) | nlsb)
    }

    /// The four children in Morton order; must not be called on a leaf.
    pub fn children(self) -> [CellId; 4] {
        debug_assert!(self.level() < MAX_LEVEL);
        let clsb = self.lsb() >> 2;
        [
            CellId(self.0 - 3 * clsb),
            CellId(self.0 - clsb),
            CellId(self.0 + clsb),
            CellId(self.0 + 3 * clsb),
        ]
    }

    /// Grid position (i east, j north) within the face at this cell's level.
    fn ij(self) -> (u64, u64) {
        let level = self.level();
        let shift = 2 * (MAX_LEVEL - level) as u32 + 1;
        let morton = (self.0 & ((1u64 << POS_BITS) - 1)) >> shift;
        let (mut i, mut j) = (0u64, 0u64);
        for b in 0..level as u32 {
            j |= ((morton >> (2 * b)) & 1) << b;
            i |= ((morton >> (2 * b + 1)) & 1) << b;
        }
        (i, j)
    }

    /// Lon/lat extent in degrees: (lon0, lon1, lat0, lat1).
    pub fn bounds_deg(self) -> (f64, f64, f64, f64) {
        let (i, j) = self.ij();
        let size = 180.0 / (1u64 << self.level()) as f64;
        let lon0 = -180.0 + self.face() as f64 * 180.0 + i as f64 * size;
        let lat0 = -90.0 + j as f64 * size;
        (lon0, lon0 + size, lat0, lat0 + size)
    }

    /// Exact spherical area in steradians (band formula: Δλ·(sin φ₁ − sin φ₀)).
    pub fn area(self) -> f64 {
        let (lon0, lon1, lat0, lat1) = self.bounds_deg();
        // Clip to the valid latitude band; j spans the full square but the
        // sphere only reaches ±90°.
        let (lat0, lat1) = (lat0.clamp(-90.0, 90.0), lat1.clamp(-90.0, 90.0));
        (lon1 - lon0).to_radians() * (lat1.to_radians().sin() - lat0.to_radians().sin())
    }
}

/// A normalized set of cells: sorted, pairwise disjoint, with complete
/// sibling quartets merged into their parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellUnion(Vec<CellId>);

impl CellUnion {
    /// Build a union from arbitrary cells, normalizing them.
    pub fn new(mut ids: Vec<CellId>) -> Self {
        Self::normalize(&mut ids);
        CellUnion(ids)
    }

    /// Internal constructor for id lists already sorted and disjoint.
    pub(crate) fn from_normalized(ids: Vec<CellId>) -> Self {
        debug_assert!(ids.windows(2).all(|w| w[0].range_max() < w[1].range_min()));
        CellUnion(ids)
    }

    fn normalize(ids: &mut Vec<CellId>) {
        ids.sort_unstable();
        ids.dedup();
        let mut out: Vec<CellId> = Vec::with_capacity(ids.len());
        for &id in ids.iter() {
            if out.last().is_some_and(|&last| last.contains(id)) {
                continue;
            }
            while out.last().is_some_and(|&last| id.contains(last)) {
                out.pop();
            }
            out.push(id);
            // Merge complete sibling quartets bottom-up.
            while out.len() >= 4 {
                let n = out.len();
                let last = out[n - 1];
                if last.level() == 0 {
                    break;
                }
                let parent = last.parent();
                let siblings = out[n - 4..]
                    .iter()
                    .all(|&c| c.level() == last.level() && c.parent() == parent);
                if !siblings {
                    break;
                }
                out.truncate(n - 4);
                out.push(parent);
            }
        }
        *ids = out;
    }

    #[inline] pub fn is_empty(&self) -> bool { self.0.is_empty() }

    #[inline] pub fn len(&self) -> usize { self.0.len() }

    #[inline] pub fn cells(&self) -> &[CellId] { &self.0 }

    /// Total spherical area in steradians.
    pub fn area(&self) -> f64 {
        self.0.iter().map(|c| c.area()).sum()
    }

    /// Cells of `self` restricted to `other`. Because cells at different
    /// levels either nest or are disjoint, the result is the deeper cell of
    /// every overlapping pair.
    pub fn intersection(&self, other: &CellUnion) -> CellUnion {
        let (a, b) = (&self.0, &other.0);
        let (mut i, mut j) = (0usize, 0usize);
        let mut out = Vec::new();
        while i < a.len() && j < b.len() {
            let (x, y) = (a[i], b[j]);
            if x.range_max() < y.range_min() {
                i += 1;
            } else if y.range_max() < x.range_min() {
                j += 1;
            } else if x.range_min() >= y.range_min() {
                // x nested in y (or equal)
                out.push(x);
                i += 1;
            } else {
                out.push(y);
                j += 1;
            }
        }
        CellUnion::from_normalized(out)
    }

    /// True iff the unions share any area.
    pub fn intersects(&self, other: &CellUnion) -> bool {
        let (a, b) = (&self.0, &other.0);
        let (mut i, mut j) = (0usize, 0usize);
        while i < a.len() && j < b.len() {
            if a[i].range_max() < b[j].range_min() {
                i += 1;
            } else if b[j].range_max() < a[i].range_min() {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// True iff every cell of `other` lies inside some cell of `self`.
    /// For normalized unions coverage by several cells implies the cells
    /// would have merged, so a single-cell containment test suffices.
    pub fn contains(&self, other: &CellUnion) -> bool {
        let a = &self.0;
        let mut i = 0usize;
        for &y in &other.0 {
            while i < a.len() && a[i].range_max() < y.range_min() {
                i += 1;
            }
            if i >= a.len() || a[i].range_min() > y.range_min() || y.range_max() > a[i].range_max() {
                return false;
            }
        }
        true
    }

    /// Union of the two sets.
    pub fn union(&self, other: &CellUnion) -> CellUnion {
        let mut ids = self.0.clone();
        ids.extend_from_slice(&other.0);
        CellUnion::new(ids)
    }

    /// Union of many sets.
    pub fn union_all<'a>(unions: impl IntoIterator<Item = &'a CellUnion>) -> CellUnion {
        let mut ids = Vec::new();
        for u in unions {
            ids.extend_from_slice(&u.0);
        }
        CellUnion::new(ids)
    }

    /// The footprint of a point: every cell at `level` whose closed extent
    /// contains the point. A point interior to a cell yields one cell; a
    /// point exactly on a shared cell edge yields the cells on both sides
    /// (two on an edge, four at a corner), so downstream queries report all
    /// neighbors instead of tie-breaking.
    pub fn from_point(lon: f64, lat: f64, level: u8) -> CellUnion {
        let level = level.min(MAX_LEVEL);
        let n = 1u64 << level;
        let size = 180.0 / n as f64;
        let mut ids = Vec::new();
        for face in 0u8..2 {
            let x = (lon - (-180.0 + face as f64 * 180.0)) / size;
            let y = (lat + 90.0) / size;
            for i in axis_cells(x, n) {
                for j in axis_cells(y, n) {
                    ids.push(cell_from_face_ij(face, i, j, level));
                }
            }
        }
        CellUnion::new(ids)
    }

    /// Axis-aligned lon/lat bound of the union, in degrees.
    pub fn rect_bound(&self) -> Option<Rect<f64>> {
        let mut b: Option<(f64, f64, f64, f64)> = None;
        for c in &self.0 {
            let (lon0, lon1, lat0, lat1) = c.bounds_deg();
            b = Some(match b {
                None => (lon0, lon1, lat0, lat1),
                Some((a0, a1, b0, b1)) => {
                    (a0.min(lon0), a1.max(lon1), b0.min(lat0), b1.max(lat1))
                }
            });
        }
        b.map(|(lon0, lon1, lat0, lat1)| {
            Rect::new((lon0, lat0.clamp(-90.0, 90.0)), (lon1, lat1.clamp(-90.0, 90.0)))
        })
    }
}

/// Cell indices along one axis whose closed extent contains coordinate `x`
/// (in cell units). A coordinate exactly on a boundary yields both sides.
fn axis_cells(x: f64, n: u64) -> smallvec::SmallVec<[u64; 2]> {
    let mut out = smallvec::SmallVec::new();
    if x < 0.0 || x > n as f64 {
        return out;
    }
    let f = x.floor();
    if x == f && f >= 1.0 {
        out.push(f as u64 - 1);
    }
    if (f as u64) < n {
        out.push(f as u64);
    }
    out
}

fn cell_from_face_ij(face: u8, i: u64, j: u64, level: u8) -> CellId {
    let mut morton = 0u64;
    for b in 0..level as u32 {
        morton |= ((j >> b) & 1) << (2 * b);
        morton |= ((i >> b) & 1) << (2 * b + 1);
    }
    let shift = 2 * (MAX_LEVEL - level) as u32;
    CellId(((face as u64) << POS_BITS) | (morton << (shift + 1)) | (1 << shift))
}
