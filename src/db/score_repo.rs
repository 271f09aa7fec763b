use crate::models::{PropertyVector, CATEGORY_COUNT};
use sqlx::{PgConnection, PgPool};

/// Update-then-insert of one listing's score row. Idempotent: re-running
/// with identical inputs leaves identical stored state. Runs on a caller-
/// provided connection so a batch worker keeps one session per sub-batch.
pub async fn upsert_score(
    conn: &mut PgConnection,
    listing_id: i64,
    vector: &PropertyVector,
) -> Result<(), sqlx::Error> {
    let scores = vector.score_row();
    let counts = vector.count_row();

    let updated = sqlx::query(
        r#"
        UPDATE property_score SET
            transport_count = $2, transport_score = $3,
            restaurant_count = $4, restaurant_score = $5,
            health_count = $6, health_score = $7,
            convenience_count = $8, convenience_score = $9,
            cafe_count = $10, cafe_score = $11,
            chicken_count = $12, chicken_score = $13,
            leisure_count = $14, leisure_score = $15
        WHERE property_id = $1
        "#,
    )
    .bind(listing_id)
    .bind(counts[0] as i32)
    .bind(scores[0])
    .bind(counts[1] as i32)
    .bind(scores[1])
    .bind(counts[2] as i32)
    .bind(scores[2])
    .bind(counts[3] as i32)
    .bind(scores[3])
    .bind(counts[4] as i32)
    .bind(scores[4])
    .bind(counts[5] as i32)
    .bind(scores[5])
    .bind(counts[6] as i32)
    .bind(scores[6])
    .execute(&mut *conn)
    .await?;

    if updated.rows_affected() == 0 {
        sqlx::query(
            r#"
            INSERT INTO property_score (
                property_id,
                transport_count, transport_score,
                restaurant_count, restaurant_score,
                health_count, health_score,
                convenience_count, convenience_score,
                cafe_count, cafe_score,
                chicken_count, chicken_score,
                leisure_count, leisure_score
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(listing_id)
        .bind(counts[0] as i32)
        .bind(scores[0])
        .bind(counts[1] as i32)
        .bind(scores[1])
        .bind(counts[2] as i32)
        .bind(scores[2])
        .bind(counts[3] as i32)
        .bind(scores[3])
        .bind(counts[4] as i32)
        .bind(scores[4])
        .bind(counts[5] as i32)
        .bind(scores[5])
        .bind(counts[6] as i32)
        .bind(scores[6])
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Bulk-load every listing's score vector and id in a single pass, in
/// canonical category order.
pub async fn load_all_vectors(pool: &PgPool) -> Result<Vec<(i64, [f64; CATEGORY_COUNT])>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, f64, f64, f64, f64, f64, f64, f64)>(
        r#"
        SELECT property_id, transport_score, restaurant_score, health_score,
               convenience_score, cafe_score, chicken_score, leisure_score
        FROM property_score
        ORDER BY property_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, t, r, h, cv, cf, ch, l)| (id, [t, r, h, cv, cf, ch, l]))
        .collect())
}

/// Per-category global minimum and maximum, in canonical order. `None`
/// when the score table is empty.
pub async fn fetch_score_bounds(
    pool: &PgPool,
) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>, sqlx::Error> {
    type BoundsRow = (
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>,
    );

    let row: BoundsRow = sqlx::query_as(
        r#"
        SELECT
            MIN(transport_score), MAX(transport_score),
            MIN(restaurant_score), MAX(restaurant_score),
            MIN(health_score), MAX(health_score),
            MIN(convenience_score), MAX(convenience_score),
            MIN(cafe_score), MAX(cafe_score),
            MIN(chicken_score), MAX(chicken_score),
            MIN(leisure_score), MAX(leisure_score)
        FROM property_score
        "#,
    )
    .fetch_one(pool)
    .await?;

    let values = [
        row.0, row.1, row.2, row.3, row.4, row.5, row.6,
        row.7, row.8, row.9, row.10, row.11, row.12, row.13,
    ];
    if values.iter().any(|v| v.is_none()) {
        return Ok(None);
    }

    let mut bounds = [(0.0, 0.0); CATEGORY_COUNT];
    for (i, pair) in bounds.iter_mut().enumerate() {
        *pair = (values[2 * i].unwrap_or(0.0), values[2 * i + 1].unwrap_or(0.0));
    }
    Ok(Some(bounds))
}

/// Per-category global mean and standard deviation, in canonical order.
/// `None` when the score table is empty. A missing stddev (single row) is
/// reported as 0 and guarded downstream.
pub async fn fetch_score_moments(
    pool: &PgPool,
) -> Result<Option<[(f64, f64); CATEGORY_COUNT]>, sqlx::Error> {
    type MomentsRow = (
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>, Option<f64>, Option<f64>,
        Option<f64>, Option<f64>,
    );

    let row: MomentsRow = sqlx::query_as(
        r#"
        SELECT
            AVG(transport_score), COALESCE(STDDEV_POP(transport_score), 0),
            AVG(restaurant_score), COALESCE(STDDEV_POP(restaurant_score), 0),
            AVG(health_score), COALESCE(STDDEV_POP(health_score), 0),
            AVG(convenience_score), COALESCE(STDDEV_POP(convenience_score), 0),
            AVG(cafe_score), COALESCE(STDDEV_POP(cafe_score), 0),
            AVG(chicken_score), COALESCE(STDDEV_POP(chicken_score), 0),
            AVG(leisure_score), COALESCE(STDDEV_POP(leisure_score), 0)
        FROM property_score
        "#,
    )
    .fetch_one(pool)
    .await?;

    let values = [
        row.0, row.1, row.2, row.3, row.4, row.5, row.6,
        row.7, row.8, row.9, row.10, row.11, row.12, row.13,
    ];
    // AVG is NULL on an empty table even though the COALESCEd stddevs are not.
    if values.iter().step_by(2).any(|v| v.is_none()) {
        return Ok(None);
    }

    let mut moments = [(0.0, 0.0); CATEGORY_COUNT];
    for (i, pair) in moments.iter_mut().enumerate() {
        *pair = (values[2 * i].unwrap_or(0.0), values[2 * i + 1].unwrap_or(0.0));
    }
    Ok(Some(moments))
}
