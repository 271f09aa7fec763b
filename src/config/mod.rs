use serde::Deserialize;
use std::env;

/// Service configuration, assembled from environment variables with
/// development defaults. `.env` files are honoured via dotenvy.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub events: EventStoreConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub ranking: RankingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStoreConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Trailing window (days) used when reading activity events.
    pub lookback_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// POI points and spatial indices.
    pub poi_ttl_secs: u64,
    /// Candidate score vectors.
    pub candidate_ttl_secs: u64,
    /// Per-user preference weights.
    pub preference_ttl_secs: u64,
    /// Global normalization statistics (min/max, mean/std).
    pub stats_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub batch_size: u32,
    pub worker_count: u32,
    /// Upsert attempts per listing before it is counted as failed.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RankingConfig {
    /// POI scoring radius in kilometres.
    pub radius_km: f64,
    /// Similarity candidates handed to the diversity reranker.
    pub candidate_pool: usize,
    /// Relevance/redundancy trade-off for MMR.
    pub mmr_lambda: f64,
    /// Minimum qualifying activity events before a dominant neighbourhood
    /// is trusted.
    pub min_affinity_events: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Config {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost:5432/zeepseek".to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 16),
            },
            events: EventStoreConfig {
                url: env::var("CLICKHOUSE_URL")
                    .unwrap_or_else(|_| "http://localhost:8123".to_string()),
                database: env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "analytics".to_string()),
                username: env::var("CLICKHOUSE_USERNAME").unwrap_or_else(|_| "default".to_string()),
                password: env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
                lookback_days: env_or("ACTIVITY_LOOKBACK_DAYS", 30),
            },
            cache: CacheConfig {
                poi_ttl_secs: env_or("POI_CACHE_TTL_SECS", 3600),
                candidate_ttl_secs: env_or("CANDIDATE_CACHE_TTL_SECS", 300),
                preference_ttl_secs: env_or("PREFERENCE_CACHE_TTL_SECS", 600),
                stats_ttl_secs: env_or("STATS_CACHE_TTL_SECS", 3600),
            },
            batch: BatchConfig {
                batch_size: env_or("BATCH_SIZE", 1000),
                worker_count: env_or("BATCH_WORKERS", 8),
                max_retries: env_or("BATCH_MAX_RETRIES", 3),
                retry_backoff_ms: env_or("BATCH_RETRY_BACKOFF_MS", 1000),
            },
            ranking: RankingConfig {
                radius_km: env_or("SCORING_RADIUS_KM", 1.0),
                candidate_pool: env_or("RANKING_CANDIDATE_POOL", 1000),
                mmr_lambda: env_or("RANKING_MMR_LAMBDA", 0.5),
                min_affinity_events: env_or("MIN_AFFINITY_EVENTS", 5),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults mirror from_env with no variables set; tests rely on this
        // being cheap and deterministic.
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost:5432/zeepseek".to_string(),
                max_connections: 16,
            },
            events: EventStoreConfig {
                url: "http://localhost:8123".to_string(),
                database: "analytics".to_string(),
                username: "default".to_string(),
                password: String::new(),
                lookback_days: 30,
            },
            cache: CacheConfig {
                poi_ttl_secs: 3600,
                candidate_ttl_secs: 300,
                preference_ttl_secs: 600,
                stats_ttl_secs: 3600,
            },
            batch: BatchConfig {
                batch_size: 1000,
                worker_count: 8,
                max_retries: 3,
                retry_backoff_ms: 1000,
            },
            ranking: RankingConfig {
                radius_km: 1.0,
                candidate_pool: 1000,
                mmr_lambda: 0.5,
                min_affinity_events: 5,
            },
        }
    }
}
