//! Batch recalculation of listing score vectors.
//!
//! Pages through listings in primary-key order, computes each listing's
//! vector and upserts it idempotently. The multi-threaded mode splits every
//! page across a fixed worker pool, one store session per sub-batch.
//! Failures are isolated per listing: a listing that keeps failing is
//! counted and skipped, never aborting the surrounding batch.

use crate::config::BatchConfig;
use crate::error::{AppError, Result};
use crate::models::{Listing, PropertyVector};
use crate::services::poi_cache::PoiSource;
use crate::services::scoring::PropertyScorer;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Recalculation strategies exposed by the batch control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Load everything at once, process sequentially. Diagnostic only.
    NoBatch,
    /// Paginated fetch, sequential processing.
    Single,
    /// Paginated fetch, pages split across the worker pool.
    Batch,
    /// Only listings with no score row or a zero category count.
    Incomplete,
}

impl BatchMode {
    pub fn parse(s: &str) -> Option<BatchMode> {
        match s {
            "no_batch" => Some(BatchMode::NoBatch),
            "single" => Some(BatchMode::Single),
            "batch" => Some(BatchMode::Batch),
            "incomplete" => Some(BatchMode::Incomplete),
            _ => None,
        }
    }
}

/// Outcome of one recalculation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchStats {
    pub processed: u64,
    pub failed: u64,
    pub elapsed: Duration,
}

/// Error from a single upsert attempt, split by whether a retry can help.
#[derive(Debug)]
pub enum UpsertError {
    /// Lock contention or deadlock; retried with backoff.
    Transient(String),
    /// Anything else; the listing is marked failed immediately.
    Permanent(String),
}

/// Classify a store error message. Matches the wording Postgres uses for
/// deadlocks and lock waits.
pub fn classify_upsert_error(message: &str) -> UpsertError {
    let lower = message.to_lowercase();
    if lower.contains("deadlock") || lower.contains("lock timeout") || lower.contains("could not obtain lock")
    {
        UpsertError::Transient(message.to_string())
    } else {
        UpsertError::Permanent(message.to_string())
    }
}

/// Listing reads and score writes used by the recalculator. Implemented by
/// the Postgres store; in-memory fakes implement it for tests.
#[async_trait]
pub trait ScoreBackend: Send + Sync + 'static {
    async fn count_listings(&self) -> Result<i64>;
    async fn fetch_page(&self, limit: i64, offset: i64) -> Result<Vec<Listing>>;
    async fn fetch_all(&self) -> Result<Vec<Listing>>;
    async fn fetch_incomplete(&self) -> Result<Vec<Listing>>;
    async fn fetch_one(&self, listing_id: i64) -> Result<Option<Listing>>;
    /// One store session, held by a worker for the length of a sub-batch.
    async fn session(&self) -> Result<Box<dyn ScoreSession>>;
}

/// A store session performing idempotent per-listing upserts.
#[async_trait]
pub trait ScoreSession: Send {
    async fn upsert(
        &mut self,
        listing_id: i64,
        vector: &PropertyVector,
    ) -> std::result::Result<(), UpsertError>;
}

/// Postgres-backed [`ScoreBackend`].
pub struct PgScoreBackend {
    pool: sqlx::PgPool,
}

impl PgScoreBackend {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScoreBackend for PgScoreBackend {
    async fn count_listings(&self) -> Result<i64> {
        Ok(crate::db::listing_repo::count_listings(&self.pool).await?)
    }

    async fn fetch_page(&self, limit: i64, offset: i64) -> Result<Vec<Listing>> {
        Ok(crate::db::listing_repo::fetch_page(&self.pool, limit, offset).await?)
    }

    async fn fetch_all(&self) -> Result<Vec<Listing>> {
        Ok(crate::db::listing_repo::fetch_all(&self.pool).await?)
    }

    async fn fetch_incomplete(&self) -> Result<Vec<Listing>> {
        Ok(crate::db::listing_repo::fetch_incomplete(&self.pool).await?)
    }

    async fn fetch_one(&self, listing_id: i64) -> Result<Option<Listing>> {
        Ok(crate::db::listing_repo::fetch_one(&self.pool, listing_id).await?)
    }

    async fn session(&self) -> Result<Box<dyn ScoreSession>> {
        let conn = self.pool.acquire().await.map_err(AppError::from)?;
        Ok(Box::new(PgScoreSession { conn }))
    }
}

struct PgScoreSession {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

#[async_trait]
impl ScoreSession for PgScoreSession {
    async fn upsert(
        &mut self,
        listing_id: i64,
        vector: &PropertyVector,
    ) -> std::result::Result<(), UpsertError> {
        crate::db::score_repo::upsert_score(&mut self.conn, listing_id, vector)
            .await
            .map_err(|e| classify_upsert_error(&e.to_string()))
    }
}

/// Drives the score computer over listings and persists the results.
pub struct ScoreRecalculator<S: PoiSource + 'static, B: ScoreBackend> {
    scorer: Arc<PropertyScorer<S>>,
    backend: Arc<B>,
    config: BatchConfig,
}

impl<S: PoiSource + 'static, B: ScoreBackend> ScoreRecalculator<S, B> {
    pub fn new(scorer: Arc<PropertyScorer<S>>, backend: Arc<B>, config: BatchConfig) -> Self {
        Self {
            scorer,
            backend,
            config,
        }
    }

    /// Same pipeline with per-run batch sizing, for callers that override
    /// the configured defaults per request.
    pub fn with_batch_params(&self, batch_size: Option<u32>, worker_count: Option<u32>) -> Self {
        let mut config = self.config.clone();
        if let Some(batch_size) = batch_size {
            config.batch_size = batch_size;
        }
        if let Some(worker_count) = worker_count {
            config.worker_count = worker_count;
        }
        Self {
            scorer: Arc::clone(&self.scorer),
            backend: Arc::clone(&self.backend),
            config,
        }
    }

    /// Run one recalculation pass in the given mode. `limit` caps the number
    /// of listings considered (paginated modes only).
    pub async fn recalculate(&self, mode: BatchMode, limit: Option<i64>) -> Result<BatchStats> {
        info!(?mode, ?limit, "Starting score recalculation");
        let stats = match mode {
            BatchMode::NoBatch => self.run_no_batch().await?,
            BatchMode::Single => self.run_paginated(limit, false).await?,
            BatchMode::Batch => self.run_paginated(limit, true).await?,
            BatchMode::Incomplete => self.run_incomplete().await?,
        };
        info!(
            processed = stats.processed,
            failed = stats.failed,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Score recalculation finished"
        );
        Ok(stats)
    }

    /// Compute and persist one listing's vector, returning it.
    pub async fn score_one(&self, listing_id: i64) -> Result<PropertyVector> {
        let listing = self
            .backend
            .fetch_one(listing_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("listing {}", listing_id)))?;

        let vector = self.scorer.compute(listing.lat, listing.lon).await?;
        let mut session = self.backend.session().await?;
        if !self
            .upsert_with_retry(session.as_mut(), listing.id, &vector)
            .await
        {
            return Err(AppError::Database(format!(
                "upsert failed for listing {}",
                listing_id
            )));
        }
        Ok(vector)
    }

    async fn run_no_batch(&self) -> Result<BatchStats> {
        let start = Instant::now();
        let listings = self.backend.fetch_all().await?;
        let total = listings.len() as u64;

        let mut session = self.backend.session().await?;
        let mut stats = BatchStats::default();
        for listing in listings {
            if self.process_listing(session.as_mut(), &listing).await {
                stats.processed += 1;
            } else {
                stats.failed += 1;
            }
            let done = stats.processed + stats.failed;
            if done % 1000 == 0 {
                info!(
                    processed = done,
                    total,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "No-batch progress"
                );
            }
        }
        stats.elapsed = start.elapsed();
        Ok(stats)
    }

    async fn run_paginated(&self, limit: Option<i64>, parallel: bool) -> Result<BatchStats> {
        let start = Instant::now();
        let total_in_store = self.backend.count_listings().await?;
        let total = limit.map_or(total_in_store, |l| l.min(total_in_store)).max(0) as u64;
        info!(total, parallel, "Listings to process");

        let mut stats = BatchStats::default();
        let batch_size = i64::from(self.config.batch_size.max(1));
        let mut offset = 0_i64;

        while stats.processed + stats.failed < total {
            let remaining = total - stats.processed - stats.failed;
            let page_size = batch_size.min(remaining as i64);
            let page = self.backend.fetch_page(page_size, offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as i64;

            let (processed, failed) = if parallel {
                self.process_page_parallel(page).await
            } else {
                self.process_page_sequential(page).await
            };
            stats.processed += processed;
            stats.failed += failed;

            info!(
                processed = stats.processed + stats.failed,
                total,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Batch progress"
            );
        }

        stats.elapsed = start.elapsed();
        Ok(stats)
    }

    async fn run_incomplete(&self) -> Result<BatchStats> {
        let start = Instant::now();
        let listings = self.backend.fetch_incomplete().await?;
        let total = listings.len() as u64;
        info!(total, "Incomplete listings found");

        let mut stats = BatchStats::default();
        let batch_size = self.config.batch_size.max(1) as usize;
        for chunk in listings.chunks(batch_size) {
            let (processed, failed) = self.process_page_parallel(chunk.to_vec()).await;
            stats.processed += processed;
            stats.failed += failed;
            info!(
                processed = stats.processed + stats.failed,
                total,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Incomplete-mode progress"
            );
        }

        stats.elapsed = start.elapsed();
        Ok(stats)
    }

    async fn process_page_sequential(&self, page: Vec<Listing>) -> (u64, u64) {
        let mut session = match self.backend.session().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, count = page.len(), "Failed to open store session for page");
                return (0, page.len() as u64);
            }
        };

        let mut processed = 0;
        let mut failed = 0;
        for listing in &page {
            if self.process_listing(session.as_mut(), listing).await {
                processed += 1;
            } else {
                failed += 1;
            }
        }
        (processed, failed)
    }

    /// Split a page into sub-batches and run them on the worker pool. Each
    /// worker holds its own store session for its whole sub-batch.
    async fn process_page_parallel(&self, page: Vec<Listing>) -> (u64, u64) {
        if page.is_empty() {
            return (0, 0);
        }
        let workers = self.config.worker_count.max(1) as usize;
        let sub_batch_size = page.len().div_ceil(workers);

        let mut handles = Vec::new();
        for sub_batch in page.chunks(sub_batch_size) {
            let sub_batch = sub_batch.to_vec();
            let scorer = Arc::clone(&self.scorer);
            let backend = Arc::clone(&self.backend);
            let config = self.config.clone();

            handles.push(tokio::spawn(async move {
                let mut session = match backend.session().await {
                    Ok(s) => s,
                    Err(e) => {
                        error!(error = %e, count = sub_batch.len(), "Failed to open store session for sub-batch");
                        return (0_u64, sub_batch.len() as u64);
                    }
                };

                let mut processed = 0;
                let mut failed = 0;
                for listing in &sub_batch {
                    if process_one(&scorer, session.as_mut(), &config, listing).await {
                        processed += 1;
                    } else {
                        failed += 1;
                    }
                }
                (processed, failed)
            }));
        }

        let mut processed = 0;
        let mut failed = 0;
        for outcome in join_all(handles).await {
            match outcome {
                Ok((p, f)) => {
                    processed += p;
                    failed += f;
                }
                Err(e) => {
                    error!(error = %e, "Sub-batch worker panicked");
                }
            }
        }
        (processed, failed)
    }

    async fn process_listing(&self, session: &mut dyn ScoreSession, listing: &Listing) -> bool {
        process_one(&self.scorer, session, &self.config, listing).await
    }

    async fn upsert_with_retry(
        &self,
        session: &mut dyn ScoreSession,
        listing_id: i64,
        vector: &PropertyVector,
    ) -> bool {
        upsert_with_retry(session, &self.config, listing_id, vector).await
    }
}

async fn process_one<S: PoiSource>(
    scorer: &PropertyScorer<S>,
    session: &mut dyn ScoreSession,
    config: &BatchConfig,
    listing: &Listing,
) -> bool {
    let vector = match scorer.compute(listing.lat, listing.lon).await {
        Ok(v) => v,
        Err(e) => {
            error!(listing_id = listing.id, error = %e, "Score computation failed");
            return false;
        }
    };
    upsert_with_retry(session, config, listing.id, &vector).await
}

async fn upsert_with_retry(
    session: &mut dyn ScoreSession,
    config: &BatchConfig,
    listing_id: i64,
    vector: &PropertyVector,
) -> bool {
    let attempts = config.max_retries.max(1);
    for attempt in 1..=attempts {
        match session.upsert(listing_id, vector).await {
            Ok(()) => return true,
            Err(UpsertError::Transient(msg)) if attempt < attempts => {
                warn!(
                    listing_id,
                    attempt,
                    max_attempts = attempts,
                    error = %msg,
                    "Transient upsert conflict, retrying"
                );
                sleep(Duration::from_millis(config.retry_backoff_ms)).await;
            }
            Err(UpsertError::Transient(msg)) => {
                error!(listing_id, error = %msg, "Upsert retries exhausted");
                return false;
            }
            Err(UpsertError::Permanent(msg)) => {
                error!(listing_id, error = %msg, "Upsert failed");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinate;
    use crate::models::PoiCategory;
    use crate::services::poi_cache::PoiSpatialCache;
    use crate::services::scoring::ScoringPolicy;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct OnePoiSource;

    #[async_trait]
    impl PoiSource for OnePoiSource {
        async fn fetch_points(&self, category: PoiCategory) -> Result<Vec<Coordinate>> {
            if category == PoiCategory::Transport {
                Ok(vec![Coordinate::new(37.5, 127.0)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn test_scorer() -> Arc<PropertyScorer<OnePoiSource>> {
        let cache = Arc::new(PoiSpatialCache::new(
            OnePoiSource,
            Duration::from_secs(3600),
        ));
        Arc::new(PropertyScorer::new(cache, ScoringPolicy::default()))
    }

    fn test_config() -> BatchConfig {
        BatchConfig {
            batch_size: 2,
            worker_count: 2,
            max_retries: 3,
            retry_backoff_ms: 0,
        }
    }

    #[derive(Default)]
    struct FakeState {
        rows: HashMap<i64, PropertyVector>,
        insert_counts: HashMap<i64, u32>,
        upsert_calls: HashMap<i64, u32>,
        /// Remaining injected transient failures per listing.
        transient_failures: HashMap<i64, u32>,
    }

    struct FakeBackend {
        listings: Vec<Listing>,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeBackend {
        fn new(listings: Vec<Listing>) -> Self {
            Self {
                listings,
                state: Arc::new(Mutex::new(FakeState::default())),
            }
        }

        fn inject_transient_failures(&self, listing_id: i64, count: u32) {
            self.state
                .lock()
                .unwrap()
                .transient_failures
                .insert(listing_id, count);
        }
    }

    struct FakeSession {
        state: Arc<Mutex<FakeState>>,
    }

    #[async_trait]
    impl ScoreSession for FakeSession {
        async fn upsert(
            &mut self,
            listing_id: i64,
            vector: &PropertyVector,
        ) -> std::result::Result<(), UpsertError> {
            let mut state = self.state.lock().unwrap();
            *state.upsert_calls.entry(listing_id).or_insert(0) += 1;

            if let Some(remaining) = state.transient_failures.get_mut(&listing_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(UpsertError::Transient("deadlock detected".to_string()));
                }
            }

            if !state.rows.contains_key(&listing_id) {
                *state.insert_counts.entry(listing_id).or_insert(0) += 1;
            }
            state.rows.insert(listing_id, vector.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl ScoreBackend for FakeBackend {
        async fn count_listings(&self) -> Result<i64> {
            Ok(self.listings.len() as i64)
        }

        async fn fetch_page(&self, limit: i64, offset: i64) -> Result<Vec<Listing>> {
            Ok(self
                .listings
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn fetch_all(&self) -> Result<Vec<Listing>> {
            Ok(self.listings.clone())
        }

        async fn fetch_incomplete(&self) -> Result<Vec<Listing>> {
            let state = self.state.lock().unwrap();
            Ok(self
                .listings
                .iter()
                .filter(|l| match state.rows.get(&l.id) {
                    None => true,
                    Some(v) => v.count_row().iter().any(|c| *c == 0),
                })
                .cloned()
                .collect())
        }

        async fn fetch_one(&self, listing_id: i64) -> Result<Option<Listing>> {
            Ok(self.listings.iter().find(|l| l.id == listing_id).cloned())
        }

        async fn session(&self) -> Result<Box<dyn ScoreSession>> {
            Ok(Box::new(FakeSession {
                state: Arc::clone(&self.state),
            }))
        }
    }

    fn listing(id: i64) -> Listing {
        Listing {
            id,
            lat: 37.5,
            lon: 127.0,
            dong_id: 11,
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(BatchMode::parse("no_batch"), Some(BatchMode::NoBatch));
        assert_eq!(BatchMode::parse("single"), Some(BatchMode::Single));
        assert_eq!(BatchMode::parse("batch"), Some(BatchMode::Batch));
        assert_eq!(BatchMode::parse("incomplete"), Some(BatchMode::Incomplete));
        assert_eq!(BatchMode::parse("bogus"), None);
    }

    #[test]
    fn test_classify_upsert_error() {
        assert!(matches!(
            classify_upsert_error("ERROR: deadlock detected"),
            UpsertError::Transient(_)
        ));
        assert!(matches!(
            classify_upsert_error("canceling statement due to lock timeout"),
            UpsertError::Transient(_)
        ));
        assert!(matches!(
            classify_upsert_error("null value in column"),
            UpsertError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_succeeds() {
        let backend = Arc::new(FakeBackend::new(vec![listing(1), listing(2), listing(3)]));
        backend.inject_transient_failures(2, 2);

        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());
        let stats = recalc.recalculate(BatchMode::Batch, None).await.unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed, 0);

        let state = backend.state.lock().unwrap();
        assert_eq!(state.rows.len(), 3);
        // Retries must not duplicate rows.
        assert_eq!(state.insert_counts.get(&2), Some(&1));
        assert_eq!(state.upsert_calls.get(&2), Some(&3));
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_listing_failed_and_continue() {
        let backend = Arc::new(FakeBackend::new(vec![listing(1), listing(2), listing(3)]));
        backend.inject_transient_failures(2, 10);

        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());
        let stats = recalc.recalculate(BatchMode::Batch, None).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);

        let state = backend.state.lock().unwrap();
        assert!(state.rows.contains_key(&1));
        assert!(!state.rows.contains_key(&2));
        assert!(state.rows.contains_key(&3));
    }

    #[tokio::test]
    async fn test_single_mode_respects_limit() {
        let listings: Vec<Listing> = (1..=5).map(listing).collect();
        let backend = Arc::new(FakeBackend::new(listings));

        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());
        let stats = recalc.recalculate(BatchMode::Single, Some(3)).await.unwrap();

        assert_eq!(stats.processed, 3);
        assert_eq!(backend.state.lock().unwrap().rows.len(), 3);
    }

    #[tokio::test]
    async fn test_no_batch_processes_everything() {
        let listings: Vec<Listing> = (1..=4).map(listing).collect();
        let backend = Arc::new(FakeBackend::new(listings));

        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());
        let stats = recalc.recalculate(BatchMode::NoBatch, None).await.unwrap();

        assert_eq!(stats.processed, 4);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let backend = Arc::new(FakeBackend::new(vec![listing(1), listing(2)]));
        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());

        recalc.recalculate(BatchMode::Batch, None).await.unwrap();
        let first: HashMap<i64, PropertyVector> = backend.state.lock().unwrap().rows.clone();

        recalc.recalculate(BatchMode::Batch, None).await.unwrap();
        let state = backend.state.lock().unwrap();
        assert_eq!(state.rows, first);
        // Second pass updated in place; nothing was inserted twice.
        assert!(state.insert_counts.values().all(|c| *c == 1));
    }

    #[tokio::test]
    async fn test_incomplete_mode_skips_scored_listings() {
        let backend = Arc::new(FakeBackend::new(vec![listing(1), listing(2)]));
        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());

        // Score listing 1 up front; listing 2 has no row yet.
        recalc.score_one(1).await.unwrap();
        let calls_before = *backend.state.lock().unwrap().upsert_calls.get(&1).unwrap();

        let stats = recalc
            .recalculate(BatchMode::Incomplete, None)
            .await
            .unwrap();

        // Listing 1's stored vector has zero counts for six categories, so it
        // is still "incomplete" and gets recomputed along with listing 2.
        assert_eq!(stats.processed, 2);
        let state = backend.state.lock().unwrap();
        assert!(state.upsert_calls.get(&1).unwrap() > &calls_before);
        assert!(state.rows.contains_key(&2));
    }

    #[tokio::test]
    async fn test_with_batch_params_overrides_sizing() {
        let listings: Vec<Listing> = (1..=6).map(listing).collect();
        let backend = Arc::new(FakeBackend::new(listings));
        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());

        let stats = recalc
            .with_batch_params(Some(5), Some(4))
            .recalculate(BatchMode::Batch, None)
            .await
            .unwrap();

        assert_eq!(stats.processed, 6);
        assert_eq!(backend.state.lock().unwrap().rows.len(), 6);
    }

    #[tokio::test]
    async fn test_score_one_unknown_listing() {
        let backend = Arc::new(FakeBackend::new(vec![listing(1)]));
        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());

        let err = recalc.score_one(99).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_score_one_persists_vector() {
        let backend = Arc::new(FakeBackend::new(vec![listing(7)]));
        let recalc = ScoreRecalculator::new(test_scorer(), Arc::clone(&backend), test_config());

        let vector = recalc.score_one(7).await.unwrap();
        assert_eq!(vector.get(PoiCategory::Transport).count, 1);

        let state = backend.state.lock().unwrap();
        assert_eq!(state.rows.get(&7), Some(&vector));
    }
}
