//! Per-listing POI proximity scoring.
//!
//! For each category the scorer counts POIs inside a fixed radius and blends
//! that count with a proximity score for the nearest POI. Pure given a POI
//! cache snapshot: identical cache state yields identical vectors.

pub mod batch;

use crate::error::Result;
use crate::geo::Coordinate;
use crate::models::{CategoryScore, PoiCategory, PropertyVector, CATEGORY_COUNT};
use crate::services::poi_cache::{PoiSource, PoiSpatialCache};
use std::sync::Arc;

/// Count/proximity blend weights for one category.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryWeights {
    /// Weight on the POI count within the radius.
    pub alpha: f64,
    /// Weight on the nearest-POI distance score.
    pub beta: f64,
}

/// Tunable scoring policy: radius plus per-category blend weights.
///
/// The defaults are the production tuning values; they are policy, not law,
/// and are kept configurable rather than inferred.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub radius_km: f64,
    weights: [CategoryWeights; CATEGORY_COUNT],
}

impl ScoringPolicy {
    pub fn new(radius_km: f64, weights: [CategoryWeights; CATEGORY_COUNT]) -> Self {
        Self { radius_km, weights }
    }

    pub fn weights(&self, category: PoiCategory) -> CategoryWeights {
        self.weights[category.index()]
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            radius_km: 1.0,
            // transport, restaurant, health, convenience, cafe, chicken, leisure
            weights: [
                CategoryWeights { alpha: 0.5, beta: 0.5 },
                CategoryWeights { alpha: 0.5, beta: 0.5 },
                CategoryWeights { alpha: 0.6, beta: 0.4 },
                CategoryWeights { alpha: 0.5, beta: 0.5 },
                CategoryWeights { alpha: 0.4, beta: 0.6 },
                CategoryWeights { alpha: 0.4, beta: 0.6 },
                CategoryWeights { alpha: 0.5, beta: 0.5 },
            ],
        }
    }
}

/// Distance to score: 1 at zero distance, decaying smoothly, never zero.
pub fn distance_score(distance_km: f64) -> f64 {
    1.0 / (1.0 + distance_km)
}

/// Computes a listing's per-category score vector from the POI cache.
pub struct PropertyScorer<S: PoiSource> {
    cache: Arc<PoiSpatialCache<S>>,
    policy: ScoringPolicy,
}

impl<S: PoiSource> PropertyScorer<S> {
    pub fn new(cache: Arc<PoiSpatialCache<S>>, policy: ScoringPolicy) -> Self {
        Self { cache, policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Score one coordinate across all categories.
    ///
    /// `count` is the number of category POIs within the radius. The distance
    /// term uses the nearest POI overall; with nothing inside the radius the
    /// distance defaults to the radius itself, so "nothing nearby" scores low
    /// instead of dividing by zero.
    pub async fn compute(&self, lat: f64, lon: f64) -> Result<PropertyVector> {
        let center = Coordinate::new(lat, lon);
        let mut vector = PropertyVector::default();

        for category in PoiCategory::ALL {
            let index = self.cache.get_index(category).await?;
            let (count, _) = index.count_within(center, self.policy.radius_km);

            let min_distance = if count == 0 {
                self.policy.radius_km
            } else {
                index.nearest_km(center).unwrap_or(self.policy.radius_km)
            };

            let weights = self.policy.weights(category);
            let dscore = distance_score(min_distance);
            let score = weights.alpha * f64::from(count) + weights.beta * dscore;

            vector.set(category, CategoryScore { count, score });
        }

        Ok(vector)
    }
}
