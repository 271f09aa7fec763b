//! Batch job runner for the property scoring engine.
//!
//! Designed to run as a Kubernetes CronJob or standalone process:
//!
//!   RUN_MODE=recalculate BATCH_MODE=batch property-ranking-service
//!   RUN_MODE=warm property-ranking-service
//!   RUN_MODE=score_one LISTING_ID=123 property-ranking-service
//!
//! The ranking and hybrid recommendation surfaces are library APIs consumed
//! by the serving layer; this binary only drives the offline work.

use property_ranking_service::config::Config;
use property_ranking_service::db;
use property_ranking_service::services::poi_cache::{PgPoiSource, PoiSpatialCache};
use property_ranking_service::services::scoring::batch::{BatchMode, PgScoreBackend, ScoreRecalculator};
use property_ranking_service::services::scoring::{PropertyScorer, ScoringPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!(
        batch_size = config.batch.batch_size,
        workers = config.batch.worker_count,
        "Starting property-ranking-service job runner"
    );

    let pool = db::connect_pool(&config.database).await.map_err(|e| {
        error!(error = %e, "Failed to connect to database");
        e
    })?;

    let cache = Arc::new(PoiSpatialCache::new(
        PgPoiSource::new(pool.clone()),
        Duration::from_secs(config.cache.poi_ttl_secs),
    ));

    let mut policy = ScoringPolicy::default();
    policy.radius_km = config.ranking.radius_km;
    let scorer = Arc::new(PropertyScorer::new(Arc::clone(&cache), policy));

    let backend = Arc::new(PgScoreBackend::new(pool.clone()));
    let recalculator = ScoreRecalculator::new(scorer, backend, config.batch.clone());

    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "recalculate".to_string());
    match run_mode.as_str() {
        "warm" => {
            cache.warm().await?;
            info!("POI cache warm-up complete");
        }
        "score_one" => {
            let listing_id: i64 = std::env::var("LISTING_ID")
                .map_err(|_| "LISTING_ID is required for score_one mode")?
                .parse()
                .map_err(|_| "LISTING_ID must be a valid integer")?;
            cache.warm().await?;
            let vector = recalculator.score_one(listing_id).await?;
            for (category, score) in vector.iter() {
                info!(
                    listing_id,
                    category = category.as_str(),
                    count = score.count,
                    score = score.score,
                    "Listing scored"
                );
            }
        }
        "recalculate" => {
            let mode = std::env::var("BATCH_MODE")
                .ok()
                .and_then(|m| BatchMode::parse(&m))
                .unwrap_or(BatchMode::Batch);
            let limit = std::env::var("BATCH_LIMIT").ok().and_then(|l| l.parse().ok());

            cache.warm().await?;
            let stats = recalculator.recalculate(mode, limit).await?;
            info!(
                processed = stats.processed,
                failed = stats.failed,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                "Recalculation job finished"
            );
        }
        other => {
            error!(mode = other, "Unknown RUN_MODE");
            return Err(format!("unknown RUN_MODE: {}", other).into());
        }
    }

    Ok(())
}
