//! Surrogate specifications and the processor that drives allocation.

use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info};

use crate::aggregate::merge;
use crate::alloc::{allocate, GriddedSrg};
use crate::grid::GridDef;
use crate::location::Location;
use crate::surrogate::SrgData;

/// Supplies the indexed granule dataset for a surrogate specification.
/// Implementations build (or load) the dataset once per specification; the
/// processor treats the returned value as immutable.
pub trait SrgProvider: Send + Sync {
    fn srg_data(&self, grid: &GridDef, loc: &Location, tolerance: f64) -> Result<Arc<SrgData>>;
}

/// One component of a merged surrogate specification.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeComponent {
    pub name: String,
    pub multiplier: f64,
}

/// How a specification produces its allocation: directly from a granule
/// dataset, or as a weighted sum of other named specifications.
#[derive(Clone)]
pub enum SrgKind {
    Direct(Arc<dyn SrgProvider>),
    Merged(Vec<MergeComponent>),
}

impl std::fmt::Debug for SrgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SrgKind::Direct(_) => f.debug_tuple("Direct").finish_non_exhaustive(),
            SrgKind::Merged(parts) => f.debug_tuple("Merged").field(parts).finish(),
        }
    }
}

/// A surrogate specification, identified by region and code (and a
/// human-readable name used by merge components).
#[derive(Clone, Debug)]
pub struct SrgSpec {
    pub region: String,
    pub code: String,
    pub name: String,
    pub kind: SrgKind,
}

impl SrgSpec {
    #[inline]
    pub fn is_merged(&self) -> bool {
        matches!(self.kind, SrgKind::Merged(_))
    }

    /// Cache key for one (surrogate, grid, location) computation.
    fn key(&self, grid: &GridDef, loc: &Location) -> String {
        format!("surrogate_{}{}_{}_{}", self.region, self.code, grid.name(), loc.id())
    }
}

/// Registry of surrogate specifications, addressable by (region, code) and
/// by (region, name).
#[derive(Clone, Default)]
pub struct SrgSpecs {
    by_code: AHashMap<(String, String), Arc<SrgSpec>>,
    by_name: AHashMap<(String, String), Arc<SrgSpec>>,
}

impl SrgSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: SrgSpec) {
        let spec = Arc::new(spec);
        self.by_code
            .insert((spec.region.clone(), spec.code.clone()), spec.clone());
        self.by_name
            .insert((spec.region.clone(), spec.name.clone()), spec);
    }

    pub fn get_by_code(&self, region: &str, code: &str) -> Result<Arc<SrgSpec>> {
        self.by_code
            .get(&(region.to_owned(), code.to_owned()))
            .cloned()
            .ok_or_else(|| anyhow!("no surrogate specification for region `{region}` code `{code}`"))
    }

    pub fn get_by_name(&self, region: &str, name: &str) -> Result<Arc<SrgSpec>> {
        self.by_name
            .get(&(region.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| anyhow!("no surrogate specification for region `{region}` name `{name}`"))
    }
}

enum CacheSlot {
    /// A computation for this key is in flight; wait for it.
    InFlight,
    Ready(Arc<GriddedSrg>),
}

/// Memoizes finished allocations with a single-flight contract: at most one
/// computation runs per key, and concurrent requesters for the same key
/// block until they can share its result. Errors are never cached.
#[derive(Default)]
struct SrgCache {
    state: Mutex<AHashMap<String, CacheSlot>>,
    ready: Condvar,
}

impl SrgCache {
    fn get_or_compute(
        &self,
        key: &str,
        compute: impl FnOnce() -> Result<Arc<GriddedSrg>>,
    ) -> Result<Arc<GriddedSrg>> {
        let mut state = self.state.lock().expect("surrogate cache poisoned");
        loop {
            match state.get(key) {
                Some(CacheSlot::Ready(v)) => {
                    debug!(key, "surrogate cache hit");
                    return Ok(v.clone());
                }
                Some(CacheSlot::InFlight) => {
                    state = self.ready.wait(state).expect("surrogate cache poisoned");
                }
                None => {
                    state.insert(key.to_owned(), CacheSlot::InFlight);
                    break;
                }
            }
        }
        drop(state);

        let result = compute();

        let mut state = self.state.lock().expect("surrogate cache poisoned");
        match &result {
            Ok(v) => {
                state.insert(key.to_owned(), CacheSlot::Ready(v.clone()));
            }
            Err(_) => {
                state.remove(key);
            }
        }
        self.ready.notify_all();
        drop(state);
        result
    }
}

/// Drives surrogate allocation: resolves specifications, runs the
/// intersection engine, merges composite surrogates, and caches results.
/// One-shot per request; holds no other state between calls.
pub struct Processor {
    specs: SrgSpecs,
    cache: SrgCache,
    /// Simplification tolerance (degrees) handed to dataset providers.
    simplify_tolerance: f64,
}

impl Processor {
    pub fn new(specs: SrgSpecs) -> Self {
        Processor { specs, cache: SrgCache::default(), simplify_tolerance: 0.0 }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.simplify_tolerance = tolerance;
        self
    }

    #[inline]
    pub fn specs(&self) -> &SrgSpecs { &self.specs }

    /// Allocate `loc` onto `grid` using `spec`. `loc` is optional because
    /// upstream records may lack a geometry; that is an explicit error, not
    /// a panic. Simple surrogates go through the single-flight cache;
    /// merged surrogates always recompute (see `compute`).
    pub fn surrogate(
        &self,
        spec: &SrgSpec,
        grid: &GridDef,
        loc: Option<&Arc<Location>>,
    ) -> Result<Arc<GriddedSrg>> {
        let loc = loc.ok_or_else(|| {
            anyhow!(
                "missing location for surrogate `{}/{}` on grid `{}`",
                spec.region,
                spec.code,
                grid.name()
            )
        })?;
        if spec.is_merged() {
            return self.compute(spec, grid, loc);
        }
        self.cache
            .get_or_compute(&spec.key(grid, loc), || self.compute(spec, grid, loc))
    }

    /// Convenience lookup-and-allocate by (region, code).
    pub fn surrogate_by_code(
        &self,
        region: &str,
        code: &str,
        grid: &GridDef,
        loc: Option<&Arc<Location>>,
    ) -> Result<Arc<GriddedSrg>> {
        let spec = self.specs.get_by_code(region, code)?;
        self.surrogate(&spec, grid, loc)
    }

    /// The uncached computation path. Merge components recurse through here
    /// rather than through the cache: a cache miss triggered while already
    /// filling the same key would block forever, so merged lookups trade
    /// duplicate work for deadlock freedom.
    fn compute(&self, spec: &SrgSpec, grid: &GridDef, loc: &Arc<Location>) -> Result<Arc<GriddedSrg>> {
        match &spec.kind {
            SrgKind::Merged(components) => {
                let mut parts = Vec::with_capacity(components.len());
                let mut factors = Vec::with_capacity(components.len());
                for comp in components {
                    let sub = self
                        .specs
                        .get_by_name(&spec.region, &comp.name)
                        .with_context(|| {
                            format!(
                                "surrogate `{}/{}`: resolving merge component `{}`",
                                spec.region, spec.code, comp.name
                            )
                        })?;
                    parts.push(self.compute(&sub, grid, loc)?);
                    factors.push(comp.multiplier);
                }
                merge(&parts, &factors).map(Arc::new)
            }
            SrgKind::Direct(provider) => {
                info!(
                    surrogate = %spec.name,
                    region = %spec.region,
                    code = %spec.code,
                    location = %loc,
                    "creating surrogate"
                );
                let data = provider
                    .srg_data(grid, loc, self.simplify_tolerance)
                    .with_context(|| {
                        format!(
                            "surrogate `{}/{}` for location `{}`: loading granule data",
                            spec.region, spec.code, loc
                        )
                    })?;
                Ok(Arc::new(allocate(grid, &data, loc.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proj::SpatialRef;
    use crate::sph::Coverer;
    use crate::surrogate::SurrogateRow;
    use ahash::AHashMap;
    use geo::{polygon, MultiPolygon};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        data: Arc<SrgData>,
        calls: AtomicUsize,
    }

    impl CountingProvider {
        fn new(data: SrgData) -> Arc<Self> {
            Arc::new(CountingProvider { data: Arc::new(data), calls: AtomicUsize::new(0) })
        }
    }

    impl SrgProvider for CountingProvider {
        fn srg_data(&self, _: &GridDef, _: &Location, _: f64) -> Result<Arc<SrgData>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.data.clone())
        }
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    fn uniform_data() -> SrgData {
        let rows: Vec<SurrogateRow> = (0..16)
            .flat_map(|i| {
                (0..8).map(move |j| SurrogateRow {
                    weight: 1.0,
                    shape: square(
                        i as f64 * 11.25,
                        j as f64 * 11.25,
                        (i + 1) as f64 * 11.25,
                        (j + 1) as f64 * 11.25,
                    ),
                    attrs: AHashMap::new(),
                })
            })
            .collect();
        SrgData::from_rows(&rows, None, Coverer::new(8))
    }

    fn grid() -> GridDef {
        GridDef::new_regular(
            "g",
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

    fn direct_spec(code: &str, name: &str, provider: Arc<CountingProvider>) -> SrgSpec {
        SrgSpec {
            region: "USA".into(),
            code: code.into(),
            name: name.into(),
            kind: SrgKind::Direct(provider),
        }
    }

    #[test]
    fn cache_serves_repeated_requests_from_one_computation() {
        let provider = CountingProvider::new(uniform_data());
        let mut specs = SrgSpecs::new();
        specs.add(direct_spec("100", "Population", provider.clone()));
        let proc = Processor::new(specs);
        let grid = grid();
        let loc = Arc::new(Location::new("shape", &square(5.0, 5.0, 40.0, 40.0), Coverer::new(8)));

        let spec = proc.specs().get_by_code("USA", "100").unwrap();
        let a = proc.surrogate(&spec, &grid, Some(&loc)).unwrap();
        let b = proc.surrogate(&spec, &grid, Some(&loc)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_requests_share_a_single_flight() {
        let provider = CountingProvider::new(uniform_data());
        let mut specs = SrgSpecs::new();
        specs.add(direct_spec("100", "Population", provider.clone()));
        let proc = Arc::new(Processor::new(specs));
        let grid = Arc::new(grid());
        let loc = Arc::new(Location::new("shape", &square(5.0, 5.0, 40.0, 40.0), Coverer::new(8)));

        let spec = proc.specs().get_by_code("USA", "100").unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let (proc, grid, loc, spec) = (proc.clone(), grid.clone(), loc.clone(), spec.clone());
                s.spawn(move || {
                    proc.surrogate(&spec, &grid, Some(&loc)).unwrap();
                });
            }
        });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merged_surrogate_is_a_weighted_sum_and_bypasses_the_cache() {
        let pa = CountingProvider::new(uniform_data());
        let pb = CountingProvider::new(uniform_data());
        let mut specs = SrgSpecs::new();
        specs.add(direct_spec("100", "Population", pa.clone()));
        specs.add(direct_spec("140", "Housing", pb.clone()));
        specs.add(SrgSpec {
            region: "USA".into(),
            code: "150".into(),
            name: "PopHousing".into(),
            kind: SrgKind::Merged(vec![
                MergeComponent { name: "Population".into(), multiplier: 0.75 },
                MergeComponent { name: "Housing".into(), multiplier: 0.25 },
            ]),
        });
        let proc = Processor::new(specs);
        let grid = grid();
        let loc = Arc::new(Location::new("shape", &square(5.0, 5.0, 40.0, 40.0), Coverer::new(8)));

        let merged_spec = proc.specs().get_by_code("USA", "150").unwrap();
        let merged = proc.surrogate(&merged_spec, &grid, Some(&loc)).unwrap();
        let merged2 = proc.surrogate(&merged_spec, &grid, Some(&loc)).unwrap();
        // Merged lookups recompute every time (documented cache bypass).
        assert_eq!(pa.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pb.calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&merged, &merged2));

        // Components are identical here, so the merged weights match a
        // single component scaled by the multiplier sum (= 1).
        let single_spec = proc.specs().get_by_code("USA", "100").unwrap();
        let single = proc.surrogate(&single_spec, &grid, Some(&loc)).unwrap();
        let total_merged: f64 = merged.cells().iter().map(|c| c.weight).sum();
        let total_single: f64 = single.cells().iter().map(|c| c.weight).sum();
        assert!((total_merged - total_single).abs() < 1e-12);
    }

    #[test]
    fn missing_location_is_an_explicit_error() {
        let provider = CountingProvider::new(uniform_data());
        let mut specs = SrgSpecs::new();
        specs.add(direct_spec("100", "Population", provider));
        let proc = Processor::new(specs);
        let grid = grid();
        let err = proc.surrogate_by_code("USA", "100", &grid, None).unwrap_err();
        assert!(err.to_string().contains("missing location"));
    }

    #[test]
    fn missing_spec_names_the_key() {
        let specs = SrgSpecs::new();
        let err = specs.get_by_code("USA", "999").unwrap_err();
        assert!(err.to_string().contains("USA"));
        assert!(err.to_string().contains("999"));
    }

    #[test]
    fn failing_provider_is_not_cached() {
        struct FailingOnce {
            failed: AtomicUsize,
            data: Arc<SrgData>,
        }
        impl SrgProvider for FailingOnce {
            fn srg_data(&self, _: &GridDef, _: &Location, _: f64) -> Result<Arc<SrgData>> {
                if self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("granule shapefile unreadable");
                }
                Ok(self.data.clone())
            }
        }
        let provider = Arc::new(FailingOnce {
            failed: AtomicUsize::new(0),
            data: Arc::new(uniform_data()),
        });
        let mut specs = SrgSpecs::new();
        specs.add(SrgSpec {
            region: "USA".into(),
            code: "100".into(),
            name: "Population".into(),
            kind: SrgKind::Direct(provider),
        });
        let proc = Processor::new(specs);
        let grid = grid();
        let loc = Arc::new(Location::new("shape", &square(5.0, 5.0, 40.0, 40.0), Coverer::new(8)));
        let spec = proc.specs().get_by_code("USA", "100").unwrap();

        let err = proc.surrogate(&spec, &grid, Some(&loc)).unwrap_err();
        assert!(format!("{err:#}").contains("granule shapefile unreadable"));
        // The failure was not cached; the retry succeeds.
        assert!(proc.surrogate(&spec, &grid, Some(&loc)).is_ok());
    }
}
