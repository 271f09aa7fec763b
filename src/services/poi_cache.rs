//! TTL-cached POI sets and spatial indices, one entry per category.
//!
//! Reads are lock-free snapshot clones; only the refresh path takes a
//! per-category lock, with a double-check after acquisition so concurrent
//! readers piggyback on whichever loader won. Snapshots are never mutated in
//! place: a refresh swaps in a new `Arc`, and holders of the old snapshot
//! keep a consistent view.

use crate::db::poi_repo;
use crate::error::Result;
use crate::geo::{haversine_km, Coordinate, EARTH_RADIUS_KM};
use crate::models::PoiCategory;
use async_trait::async_trait;
use dashmap::DashMap;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

/// Kilometres per degree of latitude.
const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// Safety margin on the bounding-box prefilter; the exact haversine check
/// runs afterwards, so the margin only needs to cover projection skew.
const ENVELOPE_MARGIN: f64 = 1.05;

#[derive(Debug, Clone)]
struct IndexedPoi {
    projected: [f64; 2],
    lat: f64,
    lon: f64,
}

impl RTreeObject for IndexedPoi {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.projected)
    }
}

impl PointDistance for IndexedPoi {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.projected[0] - point[0];
        let dy = self.projected[1] - point[1];
        dx * dx + dy * dy
    }
}

/// R*-tree over one category's POI points.
///
/// Points are stored under a local equirectangular projection (longitude
/// scaled by the cosine of the dataset's mean latitude) so Euclidean tree
/// distances track great-circle distances at city scale; query results are
/// refined with exact haversine distances.
pub struct SpatialIndex {
    tree: RTree<IndexedPoi>,
    ref_cos: f64,
}

impl SpatialIndex {
    pub fn build(points: &[Coordinate]) -> Self {
        let ref_lat = if points.is_empty() {
            0.0
        } else {
            points.iter().map(|p| p.lat).sum::<f64>() / points.len() as f64
        };
        let ref_cos = ref_lat.to_radians().cos().max(0.01);

        let entries: Vec<IndexedPoi> = points
            .iter()
            .map(|p| IndexedPoi {
                projected: [p.lon * ref_cos, p.lat],
                lat: p.lat,
                lon: p.lon,
            })
            .collect();

        Self {
            tree: RTree::bulk_load(entries),
            ref_cos,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    fn project(&self, point: Coordinate) -> [f64; 2] {
        [point.lon * self.ref_cos, point.lat]
    }

    /// POIs within `radius_km` of `center`: their count and the smallest
    /// haversine distance among them.
    pub fn count_within(&self, center: Coordinate, radius_km: f64) -> (u32, Option<f64>) {
        let query = self.project(center);
        let half = radius_km / KM_PER_DEGREE * ENVELOPE_MARGIN;
        let envelope = AABB::from_corners(
            [query[0] - half, query[1] - half],
            [query[0] + half, query[1] + half],
        );

        let mut count = 0;
        let mut min_km: Option<f64> = None;
        for poi in self.tree.locate_in_envelope(&envelope) {
            let d = haversine_km(center.lat, center.lon, poi.lat, poi.lon);
            if d <= radius_km {
                count += 1;
                min_km = Some(min_km.map_or(d, |m: f64| m.min(d)));
            }
        }
        (count, min_km)
    }

    /// Haversine distance to the nearest POI anywhere in the index.
    pub fn nearest_km(&self, center: Coordinate) -> Option<f64> {
        let query = self.project(center);
        self.tree
            .nearest_neighbor(&query)
            .map(|poi| haversine_km(center.lat, center.lon, poi.lat, poi.lon))
    }
}

/// Source of raw POI points, one table per category in the relational store.
#[async_trait]
pub trait PoiSource: Send + Sync {
    async fn fetch_points(&self, category: PoiCategory) -> Result<Vec<Coordinate>>;
}

pub struct PgPoiSource {
    pool: PgPool,
}

impl PgPoiSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoiSource for PgPoiSource {
    async fn fetch_points(&self, category: PoiCategory) -> Result<Vec<Coordinate>> {
        Ok(poi_repo::fetch_points(&self.pool, category).await?)
    }
}

#[derive(Clone)]
struct PoiEntry {
    points: Arc<Vec<Coordinate>>,
    index: Arc<SpatialIndex>,
    loaded_at: Instant,
}

/// Per-category POI cache with TTL refresh.
pub struct PoiSpatialCache<S: PoiSource> {
    source: S,
    ttl: Duration,
    entries: DashMap<PoiCategory, PoiEntry>,
    refresh_locks: DashMap<PoiCategory, Arc<Mutex<()>>>,
}

impl<S: PoiSource> PoiSpatialCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    /// Cached POI coordinates for a category, refreshing when stale. A
    /// category with no stored POIs yields an empty (but valid) set.
    pub async fn get_points(&self, category: PoiCategory) -> Result<Arc<Vec<Coordinate>>> {
        Ok(self.entry(category).await?.points)
    }

    /// Cached spatial index for a category, refreshing when stale.
    pub async fn get_index(&self, category: PoiCategory) -> Result<Arc<SpatialIndex>> {
        Ok(self.entry(category).await?.index)
    }

    /// Eagerly load all categories, typically at process start, so the first
    /// batch run or ranking request does not stampede the store.
    pub async fn warm(&self) -> Result<()> {
        for category in PoiCategory::ALL {
            let entry = self.entry(category).await?;
            info!(
                category = category.as_str(),
                poi_count = entry.points.len(),
                "POI cache warmed"
            );
        }
        Ok(())
    }

    async fn entry(&self, category: PoiCategory) -> Result<PoiEntry> {
        if let Some(entry) = self.fresh_entry(category) {
            return Ok(entry);
        }

        let lock = self
            .refresh_locks
            .entry(category)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        // Double-check: a concurrent loader may have refreshed while this
        // task waited on the lock.
        if let Some(entry) = self.fresh_entry(category) {
            return Ok(entry);
        }

        let points = self.source.fetch_points(category).await?;
        let entry = PoiEntry {
            index: Arc::new(SpatialIndex::build(&points)),
            points: Arc::new(points),
            loaded_at: Instant::now(),
        };
        self.entries.insert(category, entry.clone());
        info!(
            category = category.as_str(),
            poi_count = entry.points.len(),
            "POI cache entry refreshed"
        );
        Ok(entry)
    }

    fn fresh_entry(&self, category: PoiCategory) -> Option<PoiEntry> {
        self.entries
            .get(&category)
            .filter(|e| e.loaded_at.elapsed() < self.ttl)
            .map(|e| e.value().clone())
    }
}
