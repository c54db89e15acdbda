use sqlx::PgPool;

use crate::db::models::QuestionRecord;

pub(crate) const COLUMNS: &str = "label, task, response, mode, solved, solved_at";

pub(crate) async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM question_tracking").fetch_one(pool).await
}

pub(crate) async fn insert(pool: &PgPool, record: &QuestionRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO question_tracking (label, task, response, mode, solved, solved_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (label) DO NOTHING",
    )
    .bind(&record.label)
    .bind(&record.task)
    .bind(&record.response)
    .bind(&record.mode)
    .bind(record.solved)
    .bind(record.solved_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_label(
    pool: &PgPool,
    label: &str,
) -> Result<Option<QuestionRecord>, sqlx::Error> {
    sqlx::query_as::<_, QuestionRecord>(&format!(
        "SELECT {COLUMNS} FROM question_tracking WHERE label = $1"
    ))
    .bind(label)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn update(pool: &PgPool, record: &QuestionRecord) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE question_tracking
         SET response = $2, solved = $3, solved_at = $4
         WHERE label = $1",
    )
    .bind(&record.label)
    .bind(&record.response)
    .bind(record.solved)
    .bind(record.solved_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<QuestionRecord>, sqlx::Error> {
    sqlx::query_as::<_, QuestionRecord>(&format!(
        "SELECT {COLUMNS} FROM question_tracking ORDER BY label"
    ))
    .fetch_all(pool)
    .await
}
