//! Relational store access layer.
//!
//! Typed repositories over the externally-owned PostgreSQL schema: listings,
//! per-category POI tables, per-listing category scores and user preferences.
//! Row types never escape this module; everything is converted to the domain
//! DTOs in `models` at the boundary.

use crate::config::DatabaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

pub mod listing_repo;
pub mod poi_repo;
pub mod preference_repo;
pub mod score_repo;

/// Build the shared connection pool. Acquires are bounded so a saturated
/// pool surfaces as a timeout instead of an unbounded wait.
pub async fn connect_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url)
        .await
}
