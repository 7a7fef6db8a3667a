use sqlx::PgPool;
use uuid::Uuid;

use super::repo_types::{Job, JobChanges, JobFilter, JobRow, NewJob};

const JOB_COLUMNS: &str =
    "id, user_id, company, position, status, notes, created_at, updated_at";

pub async fn list_by_user(
    db: &PgPool,
    user_id: Uuid,
    filter: &JobFilter,
) -> anyhow::Result<Vec<Job>> {
    let sql = format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM jobs
        WHERE user_id = $1
          AND ($2::text IS NULL OR status = $2)
          AND ($3::text IS NULL
               OR company ILIKE $3 ESCAPE '\'
               OR position ILIKE $3 ESCAPE '\')
        ORDER BY created_at DESC
        "#
    );
    let rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(user_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.search_pattern())
        .fetch_all(db)
        .await?;
    rows.into_iter().map(Job::try_from).collect()
}

pub async fn create(db: &PgPool, user_id: Uuid, job: &NewJob) -> anyhow::Result<Job> {
    let sql = format!(
        r#"
        INSERT INTO jobs (id, user_id, company, position, status, notes)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {JOB_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&job.company)
        .bind(&job.position)
        .bind(job.status.as_str())
        .bind(&job.notes)
        .fetch_one(db)
        .await?;
    row.try_into()
}

/// Applies `changes` to a job the user owns. `None` when no such job exists for this user.
pub async fn update(
    db: &PgPool,
    user_id: Uuid,
    job_id: Uuid,
    changes: &JobChanges,
) -> anyhow::Result<Option<Job>> {
    let sql = format!(
        r#"
        UPDATE jobs
        SET company = COALESCE($3, company),
            position = COALESCE($4, position),
            status = COALESCE($5, status),
            notes = COALESCE($6, notes),
            updated_at = now()
        WHERE id = $1 AND user_id = $2
        RETURNING {JOB_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .bind(user_id)
        .bind(&changes.company)
        .bind(&changes.position)
        .bind(changes.status.map(|s| s.as_str()))
        .bind(&changes.notes)
        .fetch_optional(db)
        .await?;
    row.map(Job::try_from).transpose()
}

pub async fn delete(db: &PgPool, user_id: Uuid, job_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND user_id = $2")
        .bind(job_id)
        .bind(user_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Deletes the listed jobs the user owns; ids belonging to others are ignored.
pub async fn delete_many(db: &PgPool, user_id: Uuid, job_ids: &[Uuid]) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM jobs WHERE user_id = $1 AND id = ANY($2)")
        .bind(user_id)
        .bind(job_ids)
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}
