use crate::models::{Listing, ListingFilters};
use sqlx::PgPool;

#[derive(Debug, sqlx::FromRow)]
struct ListingRow {
    property_id: i64,
    latitude: f64,
    longitude: f64,
    dong_id: i32,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.property_id,
            lat: row.latitude,
            lon: row.longitude,
            dong_id: row.dong_id,
        }
    }
}

/// Total number of listings.
pub async fn count_listings(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM property")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Fetch one page of listings ordered by the monotonic primary key, so
/// concurrent pages never overlap or skip rows.
pub async fn fetch_page(pool: &PgPool, limit: i64, offset: i64) -> Result<Vec<Listing>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ListingRow>(
        r#"
        SELECT property_id, latitude, longitude, dong_id
        FROM property
        ORDER BY property_id
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Listing::from).collect())
}

/// Load every listing at once (diagnostic no-batch mode only).
pub async fn fetch_all(pool: &PgPool) -> Result<Vec<Listing>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ListingRow>(
        "SELECT property_id, latitude, longitude, dong_id FROM property ORDER BY property_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Listing::from).collect())
}

/// Fetch a single listing by id.
pub async fn fetch_one(pool: &PgPool, listing_id: i64) -> Result<Option<Listing>, sqlx::Error> {
    let row = sqlx::query_as::<_, ListingRow>(
        "SELECT property_id, latitude, longitude, dong_id FROM property WHERE property_id = $1",
    )
    .bind(listing_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Listing::from))
}

/// Listings with no score row yet, or with any category count still zero.
/// Drives the backfill/repair recalculation mode.
pub async fn fetch_incomplete(pool: &PgPool) -> Result<Vec<Listing>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ListingRow>(
        r#"
        SELECT p.property_id, p.latitude, p.longitude, p.dong_id
        FROM property p
        LEFT JOIN property_score ps ON p.property_id = ps.property_id
        WHERE ps.property_id IS NULL
           OR ps.transport_count = 0 OR ps.restaurant_count = 0
           OR ps.health_count = 0 OR ps.convenience_count = 0
           OR ps.cafe_count = 0 OR ps.chicken_count = 0
           OR ps.leisure_count = 0
        ORDER BY p.property_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Listing::from).collect())
}

/// All listing ids in a neighbourhood.
pub async fn ids_in_dong(pool: &PgPool, dong_id: i32) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64,)>(
        "SELECT property_id FROM property WHERE dong_id = $1 ORDER BY property_id",
    )
    .bind(dong_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Listing ids passing the optional price/room/contract filters. Null binds
/// disable the corresponding predicate.
pub async fn ids_matching_filters(
    pool: &PgPool,
    filters: &ListingFilters,
) -> Result<Vec<i64>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT property_id
        FROM property
        WHERE ($1::bigint IS NULL OR price >= $1)
          AND ($2::bigint IS NULL OR price <= $2)
          AND ($3::text IS NULL OR room_type = $3)
          AND ($4::text IS NULL OR contract_type = $4)
        ORDER BY property_id
        "#,
    )
    .bind(filters.min_price)
    .bind(filters.max_price)
    .bind(filters.room_type.as_deref())
    .bind(filters.contract_type.as_deref())
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
