//! Content-based similarity ranking.
//!
//! One parametrized pipeline: load candidate vectors, optionally filter by
//! listing attributes, normalize with globally fitted statistics, apply
//! demographic and preference weighting, rank by cosine similarity against
//! the user vector and diversify the top pool with MMR.

pub mod demographics;
pub mod normalization;
pub mod office;

use crate::db::{listing_repo, preference_repo, score_repo};
use crate::error::Result;
use crate::models::{
    ListingFilters, PoiCategory, RankedListing, UserPreference, CATEGORY_COUNT,
};
use crate::services::candidates::{CandidateSource, CandidateVectorCache};
use crate::services::diversity::MmrReranker;
use crate::utils::{cosine_similarity, top_k_indices};
use async_trait::async_trait;
use dashmap::DashMap;
use demographics::{category_priority, weight_adjustments, AgeBucket, Gender, DEFAULT_PRIORITY};
use ndarray::{Array1, ArrayView1, Axis};
use normalization::{Normalization, StatsCache, StatsSource};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Store reads used by the ranking pipeline beyond the candidate cache.
#[async_trait]
pub trait RankingStore: StatsSource {
    async fn fetch_preference(&self, user_id: i64) -> Result<Option<UserPreference>>;
    async fn ids_matching_filters(&self, filters: &ListingFilters) -> Result<Vec<i64>>;
    /// Score vectors joined with listing coordinates, for the
    /// office-distance ranker.
    async fn load_vectors_with_coords(
        &self,
    ) -> Result<Vec<(i64, [f64; CATEGORY_COUNT], f64, f64)>>;
}

pub struct PgRankingStore {
    pool: PgPool,
}

impl PgRankingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsSource for PgRankingStore {
    async fn fetch_bounds(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
        Ok(score_repo::fetch_score_bounds(&self.pool).await?)
    }

    async fn fetch_moments(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
        Ok(score_repo::fetch_score_moments(&self.pool).await?)
    }
}

#[async_trait]
impl RankingStore for PgRankingStore {
    async fn fetch_preference(&self, user_id: i64) -> Result<Option<UserPreference>> {
        Ok(preference_repo::fetch_preference(&self.pool, user_id).await?)
    }

    async fn ids_matching_filters(&self, filters: &ListingFilters) -> Result<Vec<i64>> {
        Ok(listing_repo::ids_matching_filters(&self.pool, filters).await?)
    }

    async fn load_vectors_with_coords(
        &self,
    ) -> Result<Vec<(i64, [f64; CATEGORY_COUNT], f64, f64)>> {
        let rows = sqlx::query_as::<_, (i64, f64, f64, f64, f64, f64, f64, f64, f64, f64)>(
            r#"
            SELECT ps.property_id, ps.transport_score, ps.restaurant_score, ps.health_score,
                   ps.convenience_score, ps.cafe_score, ps.chicken_score, ps.leisure_score,
                   p.latitude, p.longitude
            FROM property_score ps
            JOIN property p ON p.property_id = ps.property_id
            ORDER BY ps.property_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::AppError::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, t, r, h, cv, cf, ch, l, lat, lon)| (id, [t, r, h, cv, cf, ch, l], lat, lon))
            .collect())
    }
}

/// One ranking request: explicit category scores plus optional identity,
/// demographics, filters and pipeline knobs.
#[derive(Debug, Clone)]
pub struct RecommendRequest {
    /// User category scores in canonical order.
    pub scores: [f64; CATEGORY_COUNT],
    pub user_id: Option<i64>,
    /// 0/1 gender code as sent by the application.
    pub gender: Option<i32>,
    pub age: Option<i32>,
    pub top_n: usize,
    pub normalization: String,
    pub filters: ListingFilters,
    pub apply_mmr: bool,
    pub mmr_lambda: Option<f64>,
}

impl RecommendRequest {
    pub fn new(scores: [f64; CATEGORY_COUNT]) -> Self {
        Self {
            scores,
            user_id: None,
            gender: None,
            age: None,
            top_n: 10,
            normalization: "minmax".to_string(),
            filters: ListingFilters::default(),
            apply_mmr: true,
            mmr_lambda: None,
        }
    }
}

struct PreferenceEntry {
    weights: [f64; CATEGORY_COUNT],
    loaded_at: Instant,
}

/// Ranking pipeline configuration.
#[derive(Debug, Clone)]
pub struct RankerOptions {
    /// Similarity candidates handed to MMR; bounds the quadratic cost.
    pub candidate_pool: usize,
    pub preference_ttl: Duration,
    pub stats_ttl: Duration,
    pub default_mmr_lambda: f64,
}

impl Default for RankerOptions {
    fn default() -> Self {
        Self {
            candidate_pool: 1000,
            preference_ttl: Duration::from_secs(600),
            stats_ttl: Duration::from_secs(3600),
            default_mmr_lambda: 0.5,
        }
    }
}

pub struct SimilarityRanker<C: CandidateSource, S: RankingStore> {
    candidates: Arc<CandidateVectorCache<C>>,
    store: Arc<S>,
    stats: StatsCache,
    preference_cache: DashMap<i64, PreferenceEntry>,
    options: RankerOptions,
}

impl<C: CandidateSource, S: RankingStore> SimilarityRanker<C, S> {
    pub fn new(
        candidates: Arc<CandidateVectorCache<C>>,
        store: Arc<S>,
        options: RankerOptions,
    ) -> Self {
        Self {
            candidates,
            store,
            stats: StatsCache::new(options.stats_ttl),
            preference_cache: DashMap::new(),
            options,
        }
    }

    /// Rank candidates against the request's user vector. An empty result is
    /// the normal outcome for an empty or fully filtered candidate set; only
    /// a malformed request (unknown normalization method) is an error.
    pub async fn recommend(&self, request: &RecommendRequest) -> Result<Vec<RankedListing>> {
        let method = Normalization::parse(&request.normalization)?;

        let Some(set) = self.candidates.load().await? else {
            warn!("No scored listings available; returning empty recommendation");
            return Ok(Vec::new());
        };

        // Attribute filters restrict candidates before any math runs.
        let (ids, matrix) = if request.filters.is_empty() {
            (set.ids.clone(), set.matrix.clone())
        } else {
            let allowed: HashSet<i64> = self
                .store
                .ids_matching_filters(&request.filters)
                .await?
                .into_iter()
                .collect();
            let keep: Vec<usize> = set
                .ids
                .iter()
                .enumerate()
                .filter(|(_, id)| allowed.contains(*id))
                .map(|(i, _)| i)
                .collect();
            if keep.is_empty() {
                info!("All candidates filtered out");
                return Ok(Vec::new());
            }
            let ids: Vec<i64> = keep.iter().map(|&i| set.ids[i]).collect();
            (ids, set.matrix.select(Axis(0), &keep))
        };

        let Some(fitted) = self.stats.fitted(self.store.as_ref(), method).await? else {
            return Ok(Vec::new());
        };

        let demographic = match (request.gender, request.age) {
            (Some(code), Some(age)) => {
                Some((Gender::from_code(code), AgeBucket::from_age(age)))
            }
            _ => None,
        };

        let mut weights = [1.0_f64; CATEGORY_COUNT];
        if let Some((gender, bucket)) = demographic {
            let adjustments = weight_adjustments(gender, bucket);
            for (w, adj) in weights.iter_mut().zip(adjustments.iter()) {
                *w += adj;
            }
        }
        if let Some(user_id) = request.user_id {
            let bonus = self.preference_weights(user_id).await;
            for (w, b) in weights.iter_mut().zip(bonus.iter()) {
                *w += b;
            }
        }
        let weight_vector = Array1::from(weights.to_vec());

        let weighted = &fitted.apply_matrix(&matrix) * &weight_vector;
        let user_vector = fitted.apply_row(&request.scores) * &weight_vector;

        let similarities: Vec<f64> = weighted
            .rows()
            .into_iter()
            .map(|row| cosine_similarity(row, user_vector.view()))
            .collect();

        // Bound the MMR input set to the strongest candidates.
        let pool = top_k_indices(&similarities, self.options.candidate_pool);
        let pool_similarities: Vec<f64> = pool.iter().map(|&i| similarities[i]).collect();

        let selected_in_pool: Vec<usize> = if request.apply_mmr {
            let pool_matrix = weighted.select(Axis(0), &pool);
            let lambda = request
                .mmr_lambda
                .unwrap_or(self.options.default_mmr_lambda);
            MmrReranker::new(lambda).select(&pool_similarities, &pool_matrix, request.top_n)
        } else {
            (0..pool.len().min(request.top_n)).collect()
        };

        let priority = demographic.map(|(gender, bucket)| category_priority(gender, bucket));
        let results: Vec<RankedListing> = selected_in_pool
            .into_iter()
            .map(|local| {
                let global = pool[local];
                RankedListing {
                    listing_id: ids[global],
                    similarity: similarities[global],
                    dominant_category: priority
                        .as_ref()
                        .map(|p| dominant_category(weighted.row(global), p)),
                }
            })
            .collect();

        info!(
            result_count = results.len(),
            candidate_count = ids.len(),
            method = request.normalization.as_str(),
            "Similarity ranking complete"
        );
        Ok(results)
    }

    /// Per-category preference bonus for a user, cached for a short window.
    /// Users without a stored preference row get the neutral bonus of 1.0
    /// everywhere, matching the weight given to anonymous requests.
    async fn preference_weights(&self, user_id: i64) -> [f64; CATEGORY_COUNT] {
        if let Some(entry) = self.preference_cache.get(&user_id) {
            if entry.loaded_at.elapsed() < self.options.preference_ttl {
                return entry.weights;
            }
        }

        let weights = match self.store.fetch_preference(user_id).await {
            Ok(Some(preference)) => {
                let mut w = [0.0; CATEGORY_COUNT];
                for (slot, flag) in w.iter_mut().zip(preference.flags.iter()) {
                    *slot = if *flag { 1.0 } else { 0.0 };
                }
                w
            }
            Ok(None) => [1.0; CATEGORY_COUNT],
            Err(e) => {
                warn!(user_id, error = %e, "Preference lookup failed, using neutral bonus");
                [1.0; CATEGORY_COUNT]
            }
        };

        self.preference_cache.insert(
            user_id,
            PreferenceEntry {
                weights,
                loaded_at: Instant::now(),
            },
        );
        weights
    }
}

/// Category contributing most to a normalized weighted vector. Jointly
/// maximal categories are tie-broken by the priority table (higher wins).
pub fn dominant_category(row: ArrayView1<'_, f64>, priority: &[u8; CATEGORY_COUNT]) -> PoiCategory {
    let max_value = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut best = 0;
    let mut best_priority = 0;
    for (i, value) in row.iter().enumerate() {
        if *value == max_value && priority[i] >= best_priority {
            best = i;
            best_priority = priority[i];
        }
    }
    PoiCategory::ALL[best]
}

/// Convenience wrapper using the neutral priority table.
pub fn dominant_category_default(row: ArrayView1<'_, f64>) -> PoiCategory {
    dominant_category(row, &DEFAULT_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeCandidateSource {
        rows: Vec<(i64, [f64; CATEGORY_COUNT])>,
    }

    #[async_trait]
    impl CandidateSource for FakeCandidateSource {
        async fn load_vectors(&self) -> Result<Vec<(i64, [f64; CATEGORY_COUNT])>> {
            Ok(self.rows.clone())
        }
    }

    struct FakeRankingStore {
        bounds: Option<[(f64, f64); CATEGORY_COUNT]>,
        preference: Option<UserPreference>,
        filter_ids: Vec<i64>,
        preference_fetches: AtomicUsize,
    }

    impl Default for FakeRankingStore {
        fn default() -> Self {
            Self {
                bounds: Some([(0.0, 1.0); CATEGORY_COUNT]),
                preference: None,
                filter_ids: Vec::new(),
                preference_fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StatsSource for FakeRankingStore {
        async fn fetch_bounds(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
            Ok(self.bounds)
        }

        async fn fetch_moments(&self) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>> {
            Ok(self.bounds)
        }
    }

    #[async_trait]
    impl RankingStore for FakeRankingStore {
        async fn fetch_preference(&self, _user_id: i64) -> Result<Option<UserPreference>> {
            self.preference_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.preference.clone())
        }

        async fn ids_matching_filters(&self, _filters: &ListingFilters) -> Result<Vec<i64>> {
            Ok(self.filter_ids.clone())
        }

        async fn load_vectors_with_coords(
            &self,
        ) -> Result<Vec<(i64, [f64; CATEGORY_COUNT], f64, f64)>> {
            Ok(Vec::new())
        }
    }

    fn ranker_with(
        rows: Vec<(i64, [f64; CATEGORY_COUNT])>,
        store: FakeRankingStore,
    ) -> SimilarityRanker<FakeCandidateSource, FakeRankingStore> {
        let candidates = Arc::new(CandidateVectorCache::new(
            FakeCandidateSource { rows },
            Duration::from_secs(300),
        ));
        SimilarityRanker::new(candidates, Arc::new(store), RankerOptions::default())
    }

    fn row(seed: f64) -> [f64; CATEGORY_COUNT] {
        let mut out = [0.0; CATEGORY_COUNT];
        for (i, v) in out.iter_mut().enumerate() {
            *v = (seed + i as f64 * 0.1) % 1.0;
        }
        out
    }

    #[tokio::test]
    async fn test_unknown_normalization_is_configuration_error() {
        let ranker = ranker_with(vec![(1, row(0.5))], FakeRankingStore::default());
        let mut request = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        request.normalization = "log".to_string();

        let err = ranker.recommend(&request).await.unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_candidate_set_returns_empty() {
        let ranker = ranker_with(Vec::new(), FakeRankingStore::default());
        let request = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        assert!(ranker.recommend(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_eliminating_all_candidates_return_empty() {
        let store = FakeRankingStore {
            filter_ids: vec![999],
            ..Default::default()
        };
        let ranker = ranker_with(vec![(1, row(0.2)), (2, row(0.7))], store);

        let mut request = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        request.filters.min_price = Some(1);
        assert!(ranker.recommend(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matching_candidate_ranks_first() {
        let target = [0.9, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1];
        let opposite = [0.1, 0.9, 0.9, 0.9, 0.9, 0.9, 0.9];
        let ranker = ranker_with(
            vec![(1, opposite), (2, target)],
            FakeRankingStore::default(),
        );

        let mut request = RecommendRequest::new(target);
        request.apply_mmr = false;
        request.top_n = 1;

        let results = ranker.recommend(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].listing_id, 2);
    }

    #[tokio::test]
    async fn test_filters_restrict_candidates() {
        let target = [0.9, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1];
        let store = FakeRankingStore {
            // The best match (id 2) is filtered away.
            filter_ids: vec![1],
            ..Default::default()
        };
        let ranker = ranker_with(vec![(1, row(0.3)), (2, target)], store);

        let mut request = RecommendRequest::new(target);
        request.apply_mmr = false;
        request.filters.min_price = Some(1);

        let results = ranker.recommend(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].listing_id, 1);
    }

    #[tokio::test]
    async fn test_dominant_category_only_with_demographics() {
        let ranker = ranker_with(
            vec![(1, row(0.2)), (2, row(0.5)), (3, row(0.8))],
            FakeRankingStore::default(),
        );

        let anonymous = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        let results = ranker.recommend(&anonymous).await.unwrap();
        assert!(results.iter().all(|r| r.dominant_category.is_none()));

        let mut demographic = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        demographic.gender = Some(1);
        demographic.age = Some(27);
        let results = ranker.recommend(&demographic).await.unwrap();
        assert!(results.iter().all(|r| r.dominant_category.is_some()));
    }

    #[tokio::test]
    async fn test_result_count_bounded_by_top_n() {
        let rows: Vec<(i64, [f64; CATEGORY_COUNT])> =
            (1..=20).map(|i| (i, row(i as f64 * 0.05))).collect();
        let ranker = ranker_with(rows, FakeRankingStore::default());

        let mut request = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        request.top_n = 5;
        let results = ranker.recommend(&request).await.unwrap();
        assert_eq!(results.len(), 5);

        let unique: HashSet<i64> = results.iter().map(|r| r.listing_id).collect();
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_preference_weights_are_cached() {
        let store = FakeRankingStore {
            preference: Some(UserPreference {
                user_id: 42,
                flags: [true, false, false, false, false, false, true],
                office_lat: None,
                office_lon: None,
                dong_id: None,
            }),
            ..Default::default()
        };
        let ranker = ranker_with(vec![(1, row(0.4))], store);

        let mut request = RecommendRequest::new([0.5; CATEGORY_COUNT]);
        request.user_id = Some(42);
        ranker.recommend(&request).await.unwrap();
        ranker.recommend(&request).await.unwrap();

        assert_eq!(ranker.store.preference_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dominant_category_tie_break_uses_priority() {
        // Transport and leisure are jointly maximal; leisure has the higher
        // default priority.
        let vector = array![1.0, 0.2, 0.2, 0.2, 0.2, 0.2, 1.0];
        assert_eq!(dominant_category_default(vector.view()), PoiCategory::Leisure);

        // A priority table favouring transport flips the tie.
        let priority = [7, 1, 2, 3, 4, 5, 6];
        assert_eq!(
            dominant_category(vector.view(), &priority),
            PoiCategory::Transport
        );
    }

    #[test]
    fn test_dominant_category_single_max() {
        let vector = array![0.1, 0.2, 0.9, 0.2, 0.1, 0.0, 0.3];
        assert_eq!(dominant_category_default(vector.view()), PoiCategory::Health);
    }
}
