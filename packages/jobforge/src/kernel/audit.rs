//! Append-only audit log.
//!
//! Every admission point (event ingest, job request, cancel, policy check,
//! trigger fire) writes exactly one entry, inside the same transaction as
//! the decision's primary write. An audit failure therefore aborts the
//! enclosing decision; there is no silent decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{AuditEntryId, EventId, JobId, ProjectId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EventIngest,
    JobRequest,
    JobCancel,
    PolicyCheck,
    TriggerFire,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AuditEntry {
    #[builder(default = AuditEntryId::new())]
    pub id: AuditEntryId,
    pub tenant: TenantId,
    #[builder(default, setter(strip_option))]
    pub project: Option<ProjectId>,
    pub action: AuditAction,
    #[builder(default, setter(strip_option))]
    pub actor: Option<String>,
    #[builder(default, setter(strip_option))]
    pub event_id: Option<EventId>,
    #[builder(default, setter(strip_option))]
    pub job_id: Option<JobId>,
    #[builder(default, setter(strip_option))]
    pub template_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub request_payload: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub response_summary: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub scopes_granted: Option<Vec<String>>,
    #[builder(default, setter(strip_option))]
    pub policy_token_used: Option<bool>,
    #[builder(default, setter(strip_option))]
    pub policy_check_result: Option<bool>,
    #[builder(default, setter(strip_option))]
    pub duration_ms: Option<i64>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Writes the entry on the caller's connection, which is expected to be
    /// the decision's open transaction.
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, tenant, project, action, actor, event_id, job_id, template_key,
                request_payload, response_summary, scopes_granted,
                policy_token_used, policy_check_result, duration_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(self.id)
        .bind(self.tenant)
        .bind(self.project)
        .bind(self.action)
        .bind(&self.actor)
        .bind(self.event_id)
        .bind(self.job_id)
        .bind(&self.template_key)
        .bind(&self.request_payload)
        .bind(&self.response_summary)
        .bind(&self.scopes_granted)
        .bind(self.policy_token_used)
        .bind(self.policy_check_result)
        .bind(self.duration_ms)
        .bind(self.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// All entries for a tenant with the given action, oldest first.
    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
        action: AuditAction,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, tenant, project, action, actor, event_id, job_id, template_key,
                   request_payload, response_summary, scopes_granted,
                   policy_token_used, policy_check_result, duration_ms, created_at
            FROM audit_log
            WHERE tenant = $1 AND action = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant)
        .bind(action)
        .fetch_all(pool)
        .await
    }

    /// Entries attached to one job, oldest first.
    pub async fn list_for_job(pool: &PgPool, job_id: JobId) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, tenant, project, action, actor, event_id, job_id, template_key,
                   request_payload, response_summary, scopes_granted,
                   policy_token_used, policy_check_result, duration_ms, created_at
            FROM audit_log
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(pool)
        .await
    }
}
