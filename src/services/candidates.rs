//! In-memory snapshot of every scored listing's vector, for fast ranking.
//!
//! The snapshot is rebuilt at most once per TTL window and swapped in
//! atomically; readers holding the previous `Arc` keep iterating a
//! consistent matrix.

use crate::db::score_repo;
use crate::error::Result;
use crate::models::CATEGORY_COUNT;
use async_trait::async_trait;
use ndarray::Array2;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// All candidate vectors plus the parallel listing-id list.
#[derive(Debug)]
pub struct CandidateSet {
    pub ids: Vec<i64>,
    /// listings × categories, canonical category order.
    pub matrix: Array2<f64>,
    pub loaded_at: Instant,
}

impl CandidateSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Bulk source of `(listing_id, score row)` pairs.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn load_vectors(&self) -> Result<Vec<(i64, [f64; CATEGORY_COUNT])>>;
}

pub struct PgCandidateSource {
    pool: PgPool,
}

impl PgCandidateSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateSource for PgCandidateSource {
    async fn load_vectors(&self) -> Result<Vec<(i64, [f64; CATEGORY_COUNT])>> {
        Ok(score_repo::load_all_vectors(&self.pool).await?)
    }
}

/// TTL cache over the candidate vector snapshot.
pub struct CandidateVectorCache<S: CandidateSource> {
    source: S,
    ttl: Duration,
    current: RwLock<Option<Arc<CandidateSet>>>,
}

impl<S: CandidateSource> CandidateVectorCache<S> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            current: RwLock::new(None),
        }
    }

    /// Current snapshot, reloading when stale. `None` means the store holds
    /// no scored listings yet; callers treat that as "no candidates", not
    /// as an error.
    pub async fn load(&self) -> Result<Option<Arc<CandidateSet>>> {
        {
            let guard = self.current.read().await;
            if let Some(set) = guard.as_ref() {
                if set.loaded_at.elapsed() < self.ttl {
                    return Ok(Some(Arc::clone(set)));
                }
            }
        }

        let mut guard = self.current.write().await;
        // Double-check under the write lock.
        if let Some(set) = guard.as_ref() {
            if set.loaded_at.elapsed() < self.ttl {
                return Ok(Some(Arc::clone(set)));
            }
        }

        let rows = self.source.load_vectors().await?;
        if rows.is_empty() {
            warn!("No scored listings in store; candidate cache left empty");
            *guard = None;
            return Ok(None);
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut flat = Vec::with_capacity(rows.len() * CATEGORY_COUNT);
        for (id, row) in &rows {
            ids.push(*id);
            flat.extend_from_slice(row);
        }
        let matrix = Array2::from_shape_vec((ids.len(), CATEGORY_COUNT), flat)
            .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;

        let set = Arc::new(CandidateSet {
            ids,
            matrix,
            loaded_at: Instant::now(),
        });
        info!(candidate_count = set.len(), "Candidate vector cache refreshed");
        *guard = Some(Arc::clone(&set));
        Ok(Some(set))
    }
}
