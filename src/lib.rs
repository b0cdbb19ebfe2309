#![doc = "Spatial surrogate allocation: distribute quantities attached to arbitrary source shapes onto model grids, weighted by auxiliary spatial datasets."]
mod aggregate;
mod alloc;
mod grid;
mod location;
mod orchestrate;
mod proj;
mod sph;
mod surrogate;

#[doc(inline)]
pub use grid::{GridCell, GridDef, GridLocate, GridMatch};

#[doc(inline)]
pub use location::Location;

#[doc(inline)]
pub use surrogate::{Granule, SrgData, SurrogateFilter, SurrogateRow, NO_FILTER};

#[doc(inline)]
pub use alloc::{allocate, GriddedSrg, WeightedCell};

#[doc(inline)]
pub use orchestrate::{MergeComponent, Processor, SrgKind, SrgProvider, SrgSpec, SrgSpecs};

#[doc(inline)]
pub use aggregate::{merge, SrgRecord};

#[doc(inline)]
pub use proj::{GeoTransform, SpatialRef, LONLAT_PROJ4};

#[doc(inline)]
pub use sph::{level_for_tolerance, CellId, CellUnion, Coverer, MAX_LEVEL};
