//! Ingested events and their pinned wire envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{EventId, JobId, ProjectId, TenantId};

pub const EVENT_VERSION: &str = "1.0";

/// Originating application, pinned on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceApp {
    Settler,
    Aias,
    Keys,
    Readylayer,
    Jobforge,
    External,
}

impl SourceApp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceApp::Settler => "settler",
            SourceApp::Aias => "aias",
            SourceApp::Keys => "keys",
            SourceApp::Readylayer => "readylayer",
            SourceApp::Jobforge => "jobforge",
            SourceApp::External => "external",
        }
    }
}

/// Originating module, pinned on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceModule {
    Ops,
    Support,
    Growth,
    Finops,
    Core,
}

impl SourceModule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceModule::Ops => "ops",
            SourceModule::Support => "support",
            SourceModule::Growth => "growth",
            SourceModule::Finops => "finops",
            SourceModule::Core => "core",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubject {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// The pinned ingestion envelope (version "1.0").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_version: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: String,
    pub tenant: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub source_app: SourceApp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_module: Option<SourceModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<EventSubject>,
    pub payload: Value,
    #[serde(default)]
    pub contains_pii: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction_hints: Option<Vec<String>>,
}

/// A stored event row.
#[derive(FromRow, Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub tenant: TenantId,
    pub project: Option<ProjectId>,
    pub event_type: String,
    pub trace_id: String,
    pub source_app: String,
    pub source_module: Option<String>,
    pub subject: Option<Json<EventSubject>>,
    pub payload: Value,
    pub contains_pii: bool,
    pub redaction_hints: Option<Json<Vec<String>>>,
    pub occurred_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

const EVENT_COLUMNS: &str = "id, tenant, project, event_type, trace_id, source_app, source_module, \
     subject, payload, contains_pii, redaction_hints, occurred_at, processed, \
     processed_at, processing_job_id, created_at";

impl Event {
    /// Builds the row for an accepted envelope.
    pub fn from_envelope(envelope: &EventEnvelope, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            tenant: envelope.tenant,
            project: envelope.project,
            event_type: envelope.event_type.clone(),
            trace_id: envelope.trace_id.clone(),
            source_app: envelope.source_app.as_str().to_string(),
            source_module: envelope.source_module.map(|m| m.as_str().to_string()),
            subject: envelope.subject.clone().map(Json),
            payload: envelope.payload.clone(),
            contains_pii: envelope.contains_pii,
            redaction_hints: envelope.redaction_hints.clone().map(Json),
            occurred_at: envelope.occurred_at,
            processed: false,
            processed_at: None,
            processing_job_id: None,
            created_at,
        }
    }

    /// Persists the event on the ingestion transaction.
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO events (
                id, tenant, project, event_type, trace_id, source_app, source_module,
                subject, payload, contains_pii, redaction_hints, occurred_at,
                processed, processed_at, processing_job_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.tenant)
        .bind(self.project)
        .bind(&self.event_type)
        .bind(&self.trace_id)
        .bind(&self.source_app)
        .bind(&self.source_module)
        .bind(&self.subject)
        .bind(&self.payload)
        .bind(self.contains_pii)
        .bind(&self.redaction_hints)
        .bind(self.occurred_at)
        .bind(self.processed)
        .bind(self.processed_at)
        .bind(self.processing_job_id)
        .bind(self.created_at)
        .fetch_one(conn)
        .await
    }

    /// Marks the event processed, optionally linking the job it produced.
    /// The event -> job link is the authoritative owner; job -> event is a
    /// lookup key only.
    pub async fn mark_processed(
        pool: &PgPool,
        event_id: EventId,
        processing_job_id: Option<JobId>,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE events
            SET processed = TRUE, processed_at = $1, processing_job_id = $2
            WHERE id = $3
            "#,
        )
        .bind(at)
        .bind(processing_job_id)
        .bind(event_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
        id: EventId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE tenant = $1 AND id = $2"
        ))
        .bind(tenant)
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
