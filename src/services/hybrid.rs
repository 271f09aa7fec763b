//! Hybrid recommendation orchestration.
//!
//! A stateless fallback chain per call: neighbourhood-scoped collaborative
//! ranking first, content-based ranking when the collaborative stage is thin
//! or unavailable, and plain collaborative filtering over the recent
//! activity universe as the last resort. Stages degrade by skipping, never
//! by erroring the whole request.

use crate::error::{AppError, Result};
use crate::models::HybridRecommendation;
use crate::services::activity::{aggregate_ratings, ActionWeights, ActivityStore, GeographyDetector};
use crate::services::predictor::CollaborativePredictor;
use crate::services::ranking::office::OfficeContentRanker;
use crate::services::ranking::RankingStore;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Content-based stage of the fallback chain.
#[async_trait]
pub trait ContentRecommender: Send + Sync {
    async fn recommend(&self, user_id: i64, top_n: usize) -> Result<HybridRecommendation>;
}

#[async_trait]
impl<S: RankingStore> ContentRecommender for OfficeContentRanker<S> {
    async fn recommend(&self, user_id: i64, top_n: usize) -> Result<HybridRecommendation> {
        self.recommend_for_user(user_id, top_n).await
    }
}

/// Neighbourhood-scoped listing lookup.
#[async_trait]
pub trait DongDirectory: Send + Sync {
    async fn ids_in_dong(&self, dong_id: i32) -> Result<Vec<i64>>;
}

pub struct PgDongDirectory {
    pool: PgPool,
}

impl PgDongDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DongDirectory for PgDongDirectory {
    async fn ids_in_dong(&self, dong_id: i32) -> Result<Vec<i64>> {
        Ok(crate::db::listing_repo::ids_in_dong(&self.pool, dong_id).await?)
    }
}

pub struct HybridRecommender<A, P, C, D>
where
    A: ActivityStore,
    P: CollaborativePredictor,
    C: ContentRecommender,
    D: DongDirectory,
{
    activity: Arc<A>,
    predictor: Arc<P>,
    content: Arc<C>,
    directory: Arc<D>,
    detector: GeographyDetector<A>,
    lookback_days: i64,
    action_weights: ActionWeights,
}

impl<A, P, C, D> HybridRecommender<A, P, C, D>
where
    A: ActivityStore,
    P: CollaborativePredictor,
    C: ContentRecommender,
    D: DongDirectory,
{
    pub fn new(
        activity: Arc<A>,
        predictor: Arc<P>,
        content: Arc<C>,
        directory: Arc<D>,
        lookback_days: i64,
        min_affinity_events: usize,
    ) -> Self {
        let detector = GeographyDetector::new(Arc::clone(&activity), lookback_days, min_affinity_events);
        Self {
            activity,
            predictor,
            content,
            directory,
            detector,
            lookback_days,
            action_weights: ActionWeights::default(),
        }
    }

    /// Retrain the predictor from the recent activity window. Returns the
    /// number of implicit ratings fed to it.
    pub async fn train_from_activity(&self) -> Result<usize> {
        let events = self.activity.recent_events_all(self.lookback_days).await?;
        let ratings = aggregate_ratings(&events, &self.action_weights);
        info!(
            event_count = events.len(),
            rating_count = ratings.len(),
            "Training collaborative predictor from activity window"
        );
        self.predictor.train(&ratings).await?;
        Ok(ratings.len())
    }

    /// Run the fallback chain for one user.
    pub async fn recommend(&self, user_id: i64, top_n: usize) -> Result<HybridRecommendation> {
        let dong = match self.detector.dominant_dong(user_id).await {
            Ok(dong) => dong,
            Err(e) => {
                warn!(user_id, error = %e, "Geography detection failed, continuing without it");
                None
            }
        };

        let seen = match self.activity.recent_events(user_id, self.lookback_days).await {
            Ok(events) => events
                .iter()
                .map(|e| e.listing_id)
                .filter(|id| *id > 0)
                .collect::<HashSet<i64>>(),
            Err(e) => {
                warn!(user_id, error = %e, "Could not load user history, treating all listings as unseen");
                HashSet::new()
            }
        };

        let mut dong_out = dong;
        let mut listing_ids: Vec<i64> = Vec::new();

        // Stage 1: collaborative ranking inside the dominant neighbourhood.
        if let Some(dong_id) = dong {
            if self.predictor.is_trained() {
                match self.directory.ids_in_dong(dong_id).await {
                    Ok(candidates) => {
                        match self
                            .rank_collaborative(user_id, candidates, &seen, top_n)
                            .await
                        {
                            Ok(ids) => listing_ids = ids,
                            Err(e) => {
                                warn!(user_id, dong_id, error = %e, "Collaborative stage skipped")
                            }
                        }
                    }
                    Err(e) => warn!(user_id, dong_id, error = %e, "Neighbourhood lookup failed"),
                }
            } else {
                debug!(user_id, dong_id, "Predictor untrained, skipping collaborative stage");
            }
        }

        // Stage 2: content-based fallback when the collaborative stage is
        // thin. Both signals are merged, collaborative results first.
        if listing_ids.len() < (top_n / 2).max(1) {
            match self.content.recommend(user_id, top_n).await {
                Ok(content) => {
                    dong_out = dong_out.or(content.dong_id);
                    listing_ids = merge_ranked(listing_ids, content.listing_ids, top_n);
                }
                Err(e) => warn!(user_id, error = %e, "Content-based stage failed"),
            }
        }

        // Stage 3: plain collaborative filtering over the recent activity
        // universe, with no neighbourhood restriction.
        if listing_ids.is_empty() && self.predictor.is_trained() {
            match self.activity.recent_events_all(self.lookback_days).await {
                Ok(events) => {
                    let mut universe: Vec<i64> = Vec::new();
                    let mut seen_in_universe = HashSet::new();
                    for event in &events {
                        if event.listing_id > 0 && seen_in_universe.insert(event.listing_id) {
                            universe.push(event.listing_id);
                        }
                    }
                    match self
                        .rank_collaborative(user_id, universe, &seen, top_n)
                        .await
                    {
                        Ok(ids) => listing_ids = ids,
                        Err(e) => warn!(user_id, error = %e, "Global collaborative stage skipped"),
                    }
                }
                Err(e) => warn!(user_id, error = %e, "Could not load activity universe"),
            }
        }

        info!(
            user_id,
            dong_id = ?dong_out,
            result_count = listing_ids.len(),
            "Hybrid recommendation complete"
        );
        Ok(HybridRecommendation {
            dong_id: dong_out,
            listing_ids,
        })
    }

    /// Rank candidates by predicted score, preferring listings the user has
    /// not interacted with. When every candidate has been seen the full set
    /// is used instead of returning nothing.
    async fn rank_collaborative(
        &self,
        user_id: i64,
        candidates: Vec<i64>,
        seen: &HashSet<i64>,
        top_n: usize,
    ) -> Result<Vec<i64>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let unseen: Vec<i64> = candidates
            .iter()
            .copied()
            .filter(|id| !seen.contains(id))
            .collect();
        let pool = if unseen.is_empty() { candidates } else { unseen };

        let mut scored = Vec::with_capacity(pool.len());
        for listing_id in pool {
            match self.predictor.predict(user_id, listing_id).await {
                Ok(score) => scored.push((listing_id, score)),
                Err(AppError::ModelNotTrained) => return Err(AppError::ModelNotTrained),
                Err(e) => {
                    warn!(user_id, listing_id, error = %e, "Prediction failed for listing");
                }
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(top_n).map(|(id, _)| id).collect())
    }
}

/// Concatenate two ranked id lists in priority order, dropping duplicate ids
/// (first occurrence wins) and truncating to `top_n`.
pub fn merge_ranked(primary: Vec<i64>, secondary: Vec<i64>, top_n: usize) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(top_n);
    for id in primary.into_iter().chain(secondary) {
        if seen.insert(id) {
            merged.push(id);
            if merged.len() == top_n {
                break;
            }
        }
    }
    merged
}
