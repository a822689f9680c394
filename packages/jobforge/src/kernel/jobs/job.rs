//! Job model: one unit of durable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{EventId, JobId, JobResultId, TenantId};

/// Default retry budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses are sticky; only `failed -> queued` re-entry is
    /// permitted, and only through the retry policy.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead | JobStatus::Canceled
        )
    }

    /// Statuses from which `reschedule` may move a job back to `queued`.
    pub fn is_reschedulable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Dead | JobStatus::Queued)
    }
}

/// Structured handler failure recorded on the job and its attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,
    pub tenant: TenantId,
    pub job_type: String,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,

    pub run_at: DateTime<Utc>,

    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub trace_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub parent_bundle_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub triggering_event_id: Option<EventId>,

    #[builder(default, setter(strip_option))]
    pub error: Option<Json<JobError>>,
    #[builder(default, setter(strip_option))]
    pub result_id: Option<JobResultId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const JOB_COLUMNS: &str = "id, tenant, job_type, payload, status, attempts, max_attempts, \
     run_at, locked_by, locked_at, heartbeat_at, started_at, finished_at, \
     idempotency_key, created_by, trace_id, parent_bundle_id, triggering_event_id, \
     error, result_id, created_at, updated_at";

impl Job {
    /// Tenant-scoped lookup. A job belonging to another tenant is invisible.
    pub async fn find_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
        id: JobId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant = $1 AND id = $2"
        ))
        .bind(tenant)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Tenant-scoped listing, newest first, optionally filtered by status.
    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        match status {
            Some(status) => {
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE tenant = $1 AND status = $2 \
                     ORDER BY created_at DESC LIMIT $3"
                ))
                .bind(tenant)
                .bind(status)
                .bind(limit)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE tenant = $1 ORDER BY created_at DESC LIMIT $2"
                ))
                .bind(tenant)
                .bind(limit)
                .fetch_all(pool)
                .await
            }
        }
    }

    /// Number of `queued` rows for a tenant; backs the per-tenant cap.
    pub async fn count_queued_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE tenant = $1 AND status = 'queued'",
        )
        .bind(tenant)
        .fetch_one(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job::builder()
            .tenant(TenantId::new())
            .job_type("test_job".to_string())
            .run_at(now)
            .created_at(now)
            .updated_at(now)
            .build()
    }

    #[test]
    fn new_job_starts_queued_with_no_attempts() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn new_job_has_default_max_attempts_of_5() {
        assert_eq!(sample_job().max_attempts, 5);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn reschedulable_statuses() {
        assert!(JobStatus::Failed.is_reschedulable());
        assert!(JobStatus::Dead.is_reschedulable());
        assert!(JobStatus::Queued.is_reschedulable());
        assert!(!JobStatus::Running.is_reschedulable());
        assert!(!JobStatus::Succeeded.is_reschedulable());
        assert!(!JobStatus::Canceled.is_reschedulable());
    }

    #[test]
    fn job_error_serde_skips_missing_stack() {
        let err = JobError::new("Timeout", "deadline exceeded");
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("stack").is_none());

        let with_stack = err.with_stack("at handler");
        let json = serde_json::to_value(&with_stack).unwrap();
        assert_eq!(json["stack"], "at handler");
    }
}
