use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::EventRecord;
use crate::db::types::EventKind;

pub(crate) async fn insert(pool: &PgPool, data: &Value) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("INSERT INTO event_tracker (data) VALUES ($1) RETURNING id")
        .bind(Json(data))
        .fetch_one(pool)
        .await
}

pub(crate) async fn list_recent(pool: &PgPool, limit: i64) -> Result<Vec<EventRecord>, sqlx::Error> {
    sqlx::query_as::<_, EventRecord>(
        "SELECT id, recorded_at, data FROM event_tracker ORDER BY id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Inserts the submission counter row unless one already exists.
pub(crate) async fn seed_submission_counter(pool: &PgPool, data: &Value) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO event_tracker (data)
        SELECT $1
        WHERE NOT EXISTS (SELECT 1 FROM event_tracker WHERE data->>'event_type' = $2)
        "#,
    )
    .bind(Json(data))
    .bind(EventKind::SubmissionCounter.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn increment_submission_counter(
    pool: &PgPool,
    recorded_at: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE event_tracker
        SET data = data || jsonb_build_object(
            'number_submissions', COALESCE((data->>'number_submissions')::BIGINT, 0) + 1,
            'recorded_at', $2::TEXT
        )
        WHERE id = (
            SELECT id FROM event_tracker
            WHERE data->>'event_type' = $1
            ORDER BY id
            LIMIT 1
        )
        RETURNING (data->>'number_submissions')::BIGINT
        "#,
    )
    .bind(EventKind::SubmissionCounter.as_str())
    .bind(recorded_at)
    .fetch_optional(pool)
    .await
}
