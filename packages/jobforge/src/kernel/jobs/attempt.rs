//! Append-only attempt log, one row per claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use super::job::JobError;
use crate::common::{JobAttemptId, JobId, TenantId};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: JobAttemptId,
    pub job_id: JobId,
    pub tenant: TenantId,
    pub attempt_no: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<Json<JobError>>,
    pub created_at: DateTime<Utc>,
}

impl JobAttempt {
    /// Opens the attempt row for a freshly claimed job. Runs on the claim
    /// transaction so the attempt and the lock commit together.
    pub async fn open(
        conn: &mut PgConnection,
        job_id: JobId,
        tenant: TenantId,
        attempt_no: i32,
        at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_attempts (id, job_id, tenant, attempt_no, started_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING id, job_id, tenant, attempt_no, started_at, finished_at, error, created_at
            "#,
        )
        .bind(JobAttemptId::new())
        .bind(job_id)
        .bind(tenant)
        .bind(attempt_no)
        .bind(at)
        .fetch_one(conn)
        .await
    }

    /// Closes the newest open attempt for a job, recording the outcome.
    /// Returns the number of rows closed (0 when no attempt was open).
    pub async fn close_latest(
        conn: &mut PgConnection,
        job_id: JobId,
        error: Option<&JobError>,
        at: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let error = error.map(|e| serde_json::to_value(e).expect("JobError serializes"));
        let result = sqlx::query(
            r#"
            UPDATE job_attempts
            SET finished_at = $1, error = $2
            WHERE id = (
                SELECT id FROM job_attempts
                WHERE job_id = $3 AND finished_at IS NULL
                ORDER BY attempt_no DESC
                LIMIT 1
            )
            "#,
        )
        .bind(at)
        .bind(error)
        .bind(job_id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// All attempts for a job in `attempt_no` order.
    pub async fn list_for_job(pool: &PgPool, job_id: JobId) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, tenant, attempt_no, started_at, finished_at, error, created_at
            FROM job_attempts
            WHERE job_id = $1
            ORDER BY attempt_no ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(pool)
        .await
    }
}
