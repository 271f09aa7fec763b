use crate::geo::Coordinate;
use crate::models::PoiCategory;
use sqlx::PgPool;

/// Load every POI coordinate of one category. Each category lives in its own
/// table named after the category; the enum bounds the set of table names.
pub async fn fetch_points(pool: &PgPool, category: PoiCategory) -> Result<Vec<Coordinate>, sqlx::Error> {
    let query = format!("SELECT latitude, longitude FROM {}", category.as_str());

    let rows = sqlx::query_as::<_, (f64, f64)>(&query).fetch_all(pool).await?;

    Ok(rows
        .into_iter()
        .map(|(lat, lon)| Coordinate::new(lat, lon))
        .collect())
}
