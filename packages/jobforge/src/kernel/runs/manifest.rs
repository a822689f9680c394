//! Run manifests: the durable record of a run's inputs, outputs, and
//! fingerprints.
//!
//! A manifest is created `pending` when the run starts and finalized to
//! `complete` or `failed` exactly once; the row is immutable afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use super::snapshot::InputSnapshot;
use super::trace::{DecisionKind, DecisionTrace};
use crate::common::{ManifestId, ProjectId, RunId, TenantId};
use crate::kernel::error::{ForgeError, ForgeResult};

pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "manifest_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestOutput {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The persisted manifest document, keyed by `run_id` within the tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: String,
    pub run_id: RunId,
    pub tenant: TenantId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub job_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_snapshot_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_snapshot: Option<InputSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
    pub outputs: Vec<ManifestOutput>,
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub env_fingerprint: BTreeMap<String, String>,
    pub tool_versions: BTreeMap<String, String>,
    pub status: ManifestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_decision: Option<DecisionKind>,
    /// Recorded when replay packs are enabled; feeds `ReplayBundle`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_trace: Option<DecisionTrace>,
}

impl ManifestDocument {
    /// A fresh pending document for a run that is about to execute.
    pub fn pending(
        run_id: RunId,
        tenant: TenantId,
        project: Option<ProjectId>,
        job_type: impl Into<String>,
        input_snapshot: Option<InputSnapshot>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            run_id,
            tenant,
            project,
            job_type: job_type.into(),
            created_at,
            inputs_snapshot_ref: None,
            input_snapshot,
            logs_ref: None,
            outputs: Vec::new(),
            metrics: BTreeMap::new(),
            env_fingerprint: default_env_fingerprint(),
            tool_versions: default_tool_versions(),
            status: ManifestStatus::Pending,
            error: None,
            final_decision: None,
            decision_trace: None,
        }
    }

    /// Verification rules: the input hash must be recomputable from the
    /// canonical JSON, a completed manifest must carry a final decision, and
    /// every output must have a non-empty ref.
    pub fn verify(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if let Some(snapshot) = &self.input_snapshot {
            if !snapshot.verify() {
                problems.push("input hash does not match canonical JSON".to_string());
            }
        }
        if self.status == ManifestStatus::Complete && self.final_decision.is_none() {
            problems.push("completed manifest is missing a final decision".to_string());
        }
        for output in &self.outputs {
            if output.reference.is_empty() {
                problems.push(format!("output {} has an empty ref", output.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Environment fingerprint recorded on every manifest.
pub fn default_env_fingerprint() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("os".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
        ("family".to_string(), std::env::consts::FAMILY.to_string()),
    ])
}

pub fn default_tool_versions() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "jobforge".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    )])
}

/// Manifest row wrapping the document.
#[derive(FromRow, Debug, Clone)]
pub struct Manifest {
    pub id: ManifestId,
    pub run_id: RunId,
    pub tenant: TenantId,
    pub project: Option<ProjectId>,
    pub job_type: String,
    pub status: ManifestStatus,
    pub document: Json<ManifestDocument>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

const MANIFEST_COLUMNS: &str =
    "id, run_id, tenant, project, job_type, status, document, created_at, finalized_at";

impl Manifest {
    /// Persists a pending manifest at run start.
    pub async fn create_pending(
        conn: &mut PgConnection,
        document: &ManifestDocument,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO manifests (id, run_id, tenant, project, job_type, status, document, created_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
            RETURNING {MANIFEST_COLUMNS}
            "#
        ))
        .bind(ManifestId::new())
        .bind(document.run_id)
        .bind(document.tenant)
        .bind(document.project)
        .bind(&document.job_type)
        .bind(Json(document))
        .bind(document.created_at)
        .fetch_one(conn)
        .await
    }

    /// Transitions a pending manifest to its terminal status. Finalizing a
    /// manifest that is no longer pending is a `Conflict`: finalized rows are
    /// immutable.
    pub async fn finalize(
        conn: &mut PgConnection,
        tenant: TenantId,
        run_id: RunId,
        document: &ManifestDocument,
        at: DateTime<Utc>,
    ) -> ForgeResult<()> {
        if document.status == ManifestStatus::Pending {
            return Err(ForgeError::BadInput(
                "finalize requires a complete or failed document".into(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE manifests
            SET status = $1, document = $2, finalized_at = $3
            WHERE tenant = $4 AND run_id = $5 AND status = 'pending'
            "#,
        )
        .bind(document.status)
        .bind(Json(document))
        .bind(at)
        .bind(tenant)
        .bind(run_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ForgeError::Conflict(format!(
                "manifest for run {run_id} is not pending"
            )));
        }
        Ok(())
    }

    pub async fn find_for_run(
        pool: &PgPool,
        tenant: TenantId,
        run_id: RunId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests WHERE tenant = $1 AND run_id = $2"
        ))
        .bind(tenant)
        .bind(run_id)
        .fetch_optional(pool)
        .await
    }

    /// Tenant-scoped listing, newest first.
    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant: TenantId,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests \
             WHERE tenant = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(tenant)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
