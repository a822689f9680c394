//! Terminal run results, one per successful completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{JobId, JobResultId, TenantId};

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: JobResultId,
    pub job_id: JobId,
    pub tenant: TenantId,
    pub payload: serde_json::Value,
    pub artifact_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobResult {
    /// Persists a result on the completion transaction.
    pub async fn insert(
        conn: &mut PgConnection,
        job_id: JobId,
        tenant: TenantId,
        payload: serde_json::Value,
        artifact_ref: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO job_results (id, job_id, tenant, payload, artifact_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, job_id, tenant, payload, artifact_ref, created_at
            "#,
        )
        .bind(JobResultId::new())
        .bind(job_id)
        .bind(tenant)
        .bind(payload)
        .bind(artifact_ref)
        .bind(at)
        .fetch_one(conn)
        .await
    }

    pub async fn find_for_job(pool: &PgPool, job_id: JobId) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, tenant, payload, artifact_ref, created_at
            FROM job_results
            WHERE job_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await
    }
}
