use crate::models::UserPreference;
use sqlx::PgPool;

#[derive(Debug, sqlx::FromRow)]
struct PreferenceRow {
    user_id: i64,
    transport: i16,
    restaurant: i16,
    health: i16,
    convenience: i16,
    cafe: i16,
    safe: i16,
    leisure: i16,
    latitude: Option<f64>,
    longitude: Option<f64>,
    dong_id: Option<i32>,
}

impl From<PreferenceRow> for UserPreference {
    fn from(row: PreferenceRow) -> Self {
        // The preference table's `safe` flag occupies the chicken slot of the
        // canonical category layout, matching the score table's aliasing.
        UserPreference {
            user_id: row.user_id,
            flags: [
                row.transport == 1,
                row.restaurant == 1,
                row.health == 1,
                row.convenience == 1,
                row.cafe == 1,
                row.safe == 1,
                row.leisure == 1,
            ],
            office_lat: row.latitude,
            office_lon: row.longitude,
            dong_id: row.dong_id,
        }
    }
}

/// Fetch one user's preference row, if they completed the survey.
pub async fn fetch_preference(
    pool: &PgPool,
    user_id: i64,
) -> Result<Option<UserPreference>, sqlx::Error> {
    let row = sqlx::query_as::<_, PreferenceRow>(
        r#"
        SELECT user_id, transport, restaurant, health, convenience, cafe, safe, leisure,
               latitude, longitude, dong_id
        FROM user_preference
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(UserPreference::from))
}
