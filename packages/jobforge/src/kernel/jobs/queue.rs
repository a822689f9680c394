//! PostgreSQL-backed job queue protocol.
//!
//! One durable operation per queue step, each inside a single transaction:
//! enqueue (idempotent), claim (skip-locked), heartbeat, complete, cancel,
//! reschedule, and the stale-lock reaper. Coordination between workers flows
//! exclusively through these operations.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use super::attempt::JobAttempt;
use super::job::{Job, JobError, JobStatus, DEFAULT_MAX_ATTEMPTS, JOB_COLUMNS};
use super::result::JobResult;
use crate::common::backoff::backoff_ms;
use crate::common::{EventId, JobId, TenantId};
use crate::kernel::audit::{AuditAction, AuditEntry};
use crate::kernel::error::{ForgeError, ForgeResult};
use crate::kernel::forge_kernel::ForgeKernel;

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new row was created.
    Created(Job),
    /// The idempotency key matched an existing row, returned unchanged.
    Duplicate(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Parameters for a new unit of durable work.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueRequest {
    pub tenant: TenantId,
    pub job_type: String,
    #[builder(default = json!({}))]
    pub payload: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub trace_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub parent_bundle_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub triggering_event_id: Option<EventId>,
}

/// Outcome reported by a worker at the end of a run.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        result: serde_json::Value,
        artifact_ref: Option<String>,
    },
    Failed {
        error: JobError,
    },
}

/// The queue protocol against the relational truth layer.
pub struct PostgresJobQueue {
    kernel: Arc<ForgeKernel>,
}

impl PostgresJobQueue {
    pub fn new(kernel: Arc<ForgeKernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<ForgeKernel> {
        &self.kernel
    }

    async fn audit(&self, conn: &mut PgConnection, entry: AuditEntry) -> ForgeResult<()> {
        if self.kernel.flags.audit_logging_enabled {
            entry.insert(conn).await?;
        }
        Ok(())
    }

    /// Enqueue a unit of work.
    ///
    /// If `idempotency_key` collides with an existing row for the same
    /// `(tenant, job_type)`, the existing row is returned unchanged.
    pub async fn enqueue(&self, request: EnqueueRequest) -> ForgeResult<EnqueueOutcome> {
        if self.kernel.flags.security_validation_enabled {
            self.validate_enqueue(&request)?;
        }

        if let Some(cap) = self.kernel.limits.max_queued_per_tenant {
            let queued = Job::count_queued_for_tenant(&self.kernel.db_pool, request.tenant).await?;
            if queued >= cap {
                return Err(ForgeError::Conflict(format!(
                    "tenant {} has reached its queued-job cap of {cap}",
                    request.tenant
                )));
            }
        }

        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let job = Job::builder()
            .tenant(request.tenant)
            .job_type(request.job_type.clone())
            .payload(request.payload.clone())
            .max_attempts(request.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
            .run_at(request.run_at.unwrap_or(now))
            .created_at(now)
            .updated_at(now)
            .build();

        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant, job_type, payload, status, attempts, max_attempts,
                run_at, idempotency_key, created_by, trace_id, parent_bundle_id,
                triggering_event_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (tenant, job_type, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(job.tenant)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(&request.idempotency_key)
        .bind(&request.created_by)
        .bind(&request.trace_id)
        .bind(&request.parent_bundle_id)
        .bind(request.triggering_event_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(job) => EnqueueOutcome::Created(job),
            None => {
                // The unique constraint fired: return the existing row unchanged.
                let key = request
                    .idempotency_key
                    .as_deref()
                    .expect("conflict implies an idempotency key");
                let existing = sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE tenant = $1 AND job_type = $2 AND idempotency_key = $3"
                ))
                .bind(request.tenant)
                .bind(&request.job_type)
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;
                EnqueueOutcome::Duplicate(existing)
            }
        };

        let job = outcome.job();
        self.audit(
            &mut tx,
            AuditEntry::builder()
                .tenant(job.tenant)
                .action(AuditAction::JobRequest)
                .job_id(job.id)
                .template_key(job.job_type.clone())
                .response_summary(json!({
                    "status": if outcome.is_created() { "created" } else { "duplicate" },
                }))
                .created_at(now)
                .build(),
        )
        .await?;

        tx.commit().await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            created = outcome.is_created(),
            "job enqueued"
        );

        Ok(outcome)
    }

    fn validate_enqueue(&self, request: &EnqueueRequest) -> ForgeResult<()> {
        if request.job_type.is_empty() || request.job_type.len() > 200 {
            return Err(ForgeError::BadInput(
                "job_type must be between 1 and 200 characters".into(),
            ));
        }
        let size = serde_json::to_vec(&request.payload)
            .map_err(|e| ForgeError::BadInput(e.to_string()))?
            .len();
        if size > self.kernel.limits.max_payload_bytes {
            return Err(ForgeError::BadInput(format!(
                "payload of {size} bytes exceeds the {} byte limit",
                self.kernel.limits.max_payload_bytes
            )));
        }
        if let Some(max) = request.max_attempts {
            if max < 1 {
                return Err(ForgeError::BadInput("max_attempts must be at least 1".into()));
            }
        }
        Ok(())
    }

    /// Claim up to `limit` ready jobs for a worker.
    ///
    /// Concurrent claimers never receive the same row: the selection runs
    /// `FOR UPDATE SKIP LOCKED` so rows mid-claim in another transaction are
    /// passed over. Each claimed row transitions to `running` and gains an
    /// attempt-log entry in the same transaction.
    pub async fn claim(&self, worker_id: &str, limit: i64) -> ForgeResult<Vec<Job>> {
        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let mut jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH ready AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued'
                  AND run_at <= $1
                  AND attempts < max_attempts
                ORDER BY run_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                locked_by = $3,
                locked_at = $1,
                heartbeat_at = $1,
                started_at = COALESCE(started_at, $1),
                attempts = attempts + 1,
                updated_at = $1
            WHERE id IN (SELECT id FROM ready)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await?;

        // RETURNING carries no order guarantee; restore the claim order.
        jobs.sort_by(|a, b| (a.run_at, a.id).cmp(&(b.run_at, b.id)));

        for job in &jobs {
            JobAttempt::open(&mut tx, job.id, job.tenant, job.attempts, now).await?;
        }

        tx.commit().await?;
        Ok(jobs)
    }

    /// Refresh the heartbeat of a running job held by `worker_id`.
    pub async fn heartbeat(&self, job_id: JobId, worker_id: &str) -> ForgeResult<()> {
        let now = self.kernel.now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_at = $1, updated_at = $1
            WHERE id = $2 AND locked_by = $3 AND status = 'running'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.kernel.db_pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        Err(self.lock_mismatch(job_id, worker_id).await?)
    }

    /// Report a run's outcome. Only the lock holder may complete.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> ForgeResult<JobStatus> {
        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            return Err(ForgeError::NotRunning(job_id.into_uuid()));
        };
        if job.status != JobStatus::Running {
            return Err(ForgeError::NotRunning(job_id.into_uuid()));
        }
        if job.locked_by.as_deref() != Some(worker_id) {
            return Err(ForgeError::NotOwned {
                job_id: job_id.into_uuid(),
                worker_id: worker_id.to_string(),
            });
        }

        let new_status = match outcome {
            JobOutcome::Succeeded {
                result,
                artifact_ref,
            } => {
                let result =
                    JobResult::insert(&mut tx, job.id, job.tenant, result, artifact_ref, now)
                        .await?;
                JobAttempt::close_latest(&mut tx, job.id, None, now).await?;

                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded',
                        finished_at = $1,
                        result_id = $2,
                        locked_by = NULL,
                        locked_at = NULL,
                        heartbeat_at = NULL,
                        error = NULL,
                        updated_at = $1
                    WHERE id = $3
                    "#,
                )
                .bind(now)
                .bind(result.id)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;

                JobStatus::Succeeded
            }
            JobOutcome::Failed { error } => {
                JobAttempt::close_latest(&mut tx, job.id, Some(&error), now).await?;

                // Schema failures never earn a retry, whatever the budget.
                let exhausted = job.attempts >= job.max_attempts || error.code == "BadInput";
                let error_value = serde_json::to_value(&error)
                    .map_err(|e| ForgeError::Internal(e.to_string()))?;

                if exhausted {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'dead',
                            finished_at = $1,
                            error = $2,
                            locked_by = NULL,
                            locked_at = NULL,
                            heartbeat_at = NULL,
                            updated_at = $1
                        WHERE id = $3
                        "#,
                    )
                    .bind(now)
                    .bind(&error_value)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await?;

                    warn!(job_id = %job.id, code = %error.code, "job dead-lettered");
                    JobStatus::Dead
                } else {
                    let delay = Duration::milliseconds(backoff_ms(job.attempts as u32));
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET status = 'queued',
                            run_at = $1,
                            error = $2,
                            locked_by = NULL,
                            locked_at = NULL,
                            heartbeat_at = NULL,
                            updated_at = $3
                        WHERE id = $4
                        "#,
                    )
                    .bind(now + delay)
                    .bind(&error_value)
                    .bind(now)
                    .bind(job.id)
                    .execute(&mut *tx)
                    .await?;

                    JobStatus::Queued
                }
            }
        };

        tx.commit().await?;
        Ok(new_status)
    }

    /// Cancel a queued job. Running jobs stop cooperatively or via the reaper.
    pub async fn cancel(&self, tenant: TenantId, job_id: JobId) -> ForgeResult<()> {
        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled', finished_at = $1, updated_at = $1
            WHERE id = $2 AND tenant = $3 AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .bind(tenant)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists = Job::find_for_tenant(&self.kernel.db_pool, tenant, job_id).await?;
            return Err(match exists {
                Some(_) => ForgeError::NotCancelable(job_id.into_uuid()),
                None => ForgeError::Forbidden(format!("job {job_id} not found for tenant")),
            });
        }

        self.audit(
            &mut tx,
            AuditEntry::builder()
                .tenant(tenant)
                .action(AuditAction::JobCancel)
                .job_id(job_id)
                .created_at(now)
                .build(),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move a `failed`, `dead`, or `queued` job back to `queued` at `run_at`.
    ///
    /// The attempt counter is preserved unless `reset_attempts` is passed;
    /// raising `max_attempts` is a separate explicit choice. A dead job with
    /// an untouched budget stays parked even after requeue, since claims only
    /// take rows with attempts remaining.
    pub async fn reschedule(
        &self,
        tenant: TenantId,
        job_id: JobId,
        run_at: DateTime<Utc>,
        reset_attempts: bool,
        new_max_attempts: Option<i32>,
    ) -> ForgeResult<Job> {
        let now = self.kernel.now();
        let mut tx = self.kernel.db_pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND tenant = $2 FOR UPDATE"
        ))
        .bind(job_id)
        .bind(tenant)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            return Err(ForgeError::Forbidden(format!(
                "job {job_id} not found for tenant"
            )));
        };
        if !job.status.is_reschedulable() {
            return Err(ForgeError::NotReschedulable(job_id.into_uuid()));
        }

        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = $1,
                attempts = CASE WHEN $2 THEN 0 ELSE attempts END,
                max_attempts = COALESCE($3, max_attempts),
                finished_at = NULL,
                updated_at = $4
            WHERE id = $5
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(run_at)
        .bind(reset_attempts)
        .bind(new_max_attempts)
        .bind(now)
        .bind(job.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    /// Reclaim running jobs whose worker stopped heartbeating.
    ///
    /// Rows past the threshold go back to `queued` (or `dead` when the
    /// attempt budget is spent); the dangling attempt row is closed with a
    /// `stale-reap` annotation. Returns the reclaimed jobs.
    pub async fn reap_stale(&self, threshold: Duration) -> ForgeResult<Vec<Job>> {
        let now = self.kernel.now();
        let cutoff = now - threshold;
        let mut tx = self.kernel.db_pool.begin().await?;

        let reaped = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'running'
                  AND (
                      (heartbeat_at IS NOT NULL AND heartbeat_at < $1)
                      OR (heartbeat_at IS NULL AND locked_at < $1)
                  )
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = CASE WHEN attempts >= max_attempts
                              THEN 'dead'::job_status ELSE 'queued'::job_status END,
                finished_at = CASE WHEN attempts >= max_attempts THEN $2 ELSE NULL END,
                run_at = CASE WHEN attempts >= max_attempts THEN run_at ELSE $2 END,
                error = $3,
                locked_by = NULL,
                locked_at = NULL,
                heartbeat_at = NULL,
                updated_at = $2
            WHERE id IN (SELECT id FROM stale)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .bind(now)
        .bind(serde_json::to_value(stale_reap_error()).expect("JobError serializes"))
        .fetch_all(&mut *tx)
        .await?;

        for job in &reaped {
            JobAttempt::close_latest(&mut tx, job.id, Some(&stale_reap_error()), now).await?;
            warn!(
                job_id = %job.id,
                status = ?job.status,
                "reclaimed stale job"
            );
        }

        tx.commit().await?;
        Ok(reaped)
    }

    /// Distinguishes `NotOwned` from `NotRunning` after a conditional update
    /// matched nothing.
    async fn lock_mismatch(&self, job_id: JobId, worker_id: &str) -> Result<ForgeError, sqlx::Error> {
        let row = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.kernel.db_pool)
        .await?;

        Ok(match row {
            Some(job) if job.status == JobStatus::Running => ForgeError::NotOwned {
                job_id: job_id.into_uuid(),
                worker_id: worker_id.to_string(),
            },
            _ => ForgeError::NotRunning(job_id.into_uuid()),
        })
    }
}

fn stale_reap_error() -> JobError {
    JobError::new("StaleReap", "stale-reap: lease expired without heartbeat")
}
