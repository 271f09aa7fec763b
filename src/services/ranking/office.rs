//! Content-based ranking anchored on the user's commute.
//!
//! Extends the 7 category scores with an eighth feature measuring how close
//! a listing sits to the user's registered work/school coordinate, then
//! ranks by cosine similarity. The user-side distance feature is 1.0 when an
//! anchor exists, so listings near the anchor align with the user vector.

use crate::error::Result;
use crate::geo::haversine_km;
use crate::models::{HybridRecommendation, CATEGORY_COUNT};
use crate::services::ranking::RankingStore;
use crate::utils::{cosine_similarity, top_k_indices};
use ndarray::Array1;
use std::sync::Arc;
use tracing::info;

/// Commute distances at or beyond this score zero.
const MAX_COMMUTE_KM: f64 = 10.0;

/// Linear commute score: 1 at the anchor, 0 at `MAX_COMMUTE_KM` and beyond.
pub fn commute_score(distance_km: f64) -> f64 {
    (1.0 - distance_km / MAX_COMMUTE_KM).max(0.0)
}

pub struct OfficeContentRanker<S: RankingStore> {
    store: Arc<S>,
}

impl<S: RankingStore> OfficeContentRanker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Recommend for a user from their stored preference flags and commute
    /// anchor. A user without a preference row, or an unscored store, yields
    /// an empty id list rather than an error.
    pub async fn recommend_for_user(&self, user_id: i64, top_n: usize) -> Result<HybridRecommendation> {
        let Some(preference) = self.store.fetch_preference(user_id).await? else {
            return Ok(HybridRecommendation {
                dong_id: None,
                listing_ids: Vec::new(),
            });
        };

        let rows = self.store.load_vectors_with_coords().await?;
        if rows.is_empty() {
            return Ok(HybridRecommendation {
                dong_id: preference.dong_id,
                listing_ids: Vec::new(),
            });
        }

        let anchor = preference.office_lat.zip(preference.office_lon);

        let mut user_vector = Vec::with_capacity(CATEGORY_COUNT + 1);
        for flag in preference.flags {
            user_vector.push(if flag { 1.0 } else { 0.0 });
        }
        // The ideal listing sits at the anchor; without an anchor the
        // distance feature is inert on both sides.
        user_vector.push(if anchor.is_some() { 1.0 } else { 0.0 });
        let user_vector = Array1::from(user_vector);

        let mut ids = Vec::with_capacity(rows.len());
        let mut similarities = Vec::with_capacity(rows.len());
        for (id, scores, lat, lon) in rows {
            let distance_feature = anchor
                .map(|(office_lat, office_lon)| {
                    commute_score(haversine_km(office_lat, office_lon, lat, lon))
                })
                .unwrap_or(0.0);

            let mut vector = Vec::with_capacity(CATEGORY_COUNT + 1);
            vector.extend_from_slice(&scores);
            vector.push(distance_feature);
            let vector = Array1::from(vector);

            ids.push(id);
            similarities.push(cosine_similarity(vector.view(), user_vector.view()));
        }

        let listing_ids: Vec<i64> = top_k_indices(&similarities, top_n)
            .into_iter()
            .map(|i| ids[i])
            .collect();

        info!(
            user_id,
            result_count = listing_ids.len(),
            has_anchor = anchor.is_some(),
            "Office-distance content ranking complete"
        );
        Ok(HybridRecommendation {
            dong_id: preference.dong_id,
            listing_ids,
        })
    }
}
