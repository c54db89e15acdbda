use sqlx::PgPool;

use crate::db::models::PhaseRecord;

pub(crate) const COLUMNS: &str = "label, tasks, solved, solved_at";

pub(crate) async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM phase_tracking").fetch_one(pool).await
}

pub(crate) async fn insert(pool: &PgPool, record: &PhaseRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO phase_tracking (label, tasks, solved, solved_at)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (label) DO NOTHING",
    )
    .bind(&record.label)
    .bind(&record.tasks)
    .bind(record.solved)
    .bind(record.solved_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_label(
    pool: &PgPool,
    label: &str,
) -> Result<Option<PhaseRecord>, sqlx::Error> {
    sqlx::query_as::<_, PhaseRecord>(&format!("SELECT {COLUMNS} FROM phase_tracking WHERE label = $1"))
        .bind(label)
        .fetch_optional(pool)
        .await
}

pub(crate) async fn update(pool: &PgPool, record: &PhaseRecord) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE phase_tracking
         SET solved = $2, solved_at = $3
         WHERE label = $1",
    )
    .bind(&record.label)
    .bind(record.solved)
    .bind(record.solved_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn list(pool: &PgPool) -> Result<Vec<PhaseRecord>, sqlx::Error> {
    sqlx::query_as::<_, PhaseRecord>(&format!("SELECT {COLUMNS} FROM phase_tracking ORDER BY label"))
        .fetch_all(pool)
        .await
}
