//! Trigger rules: matcher + action + safety definitions that can fire a
//! bundle in response to events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use typed_builder::TypedBuilder;

use crate::common::{ProjectId, TenantId, TriggerFireId, TriggerRuleId};
use crate::domains::bundles::ExecutionMode;

/// Severity ladder used by match thresholds, weakest first.
pub const SEVERITY_LEVELS: [&str; 4] = ["info", "warning", "error", "critical"];

/// Rank of a severity label; unknown labels rank lowest.
pub fn severity_rank(label: &str) -> usize {
    SEVERITY_LEVELS
        .iter()
        .position(|l| *l == label)
        .unwrap_or(0)
}

/// What an event must look like for the rule to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub event_type_allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_module_allowlist: Option<Vec<String>>,
    /// Minimum `payload.severity` (see [`SEVERITY_LEVELS`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Minimum numeric `payload.priority`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSource {
    Inline,
    Ref,
}

/// One templated child request inside a rule's inline bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRequestTemplate {
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    /// May contain `{{dotted.path}}` placeholders rendered from the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub is_action_job: bool,
}

/// What the rule does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub bundle_source: BundleSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<Vec<BundleRequestTemplate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_ref: Option<String>,
    pub mode: ExecutionMode,
}

/// Safety limits applied before a fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySpec {
    pub cooldown_seconds: i64,
    pub max_runs_per_hour: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key_template: Option<String>,
    /// Window for dedupe-key suppression; defaults to one hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_window_seconds: Option<i64>,
    #[serde(default)]
    pub allow_action_jobs: bool,
}

impl SafetySpec {
    pub fn dedupe_window(&self) -> Duration {
        Duration::seconds(self.dedupe_window_seconds.unwrap_or(3_600))
    }
}

#[derive(FromRow, Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TriggerRule {
    #[builder(default = TriggerRuleId::new())]
    pub id: TriggerRuleId,
    pub tenant: TenantId,
    #[builder(default, setter(strip_option))]
    pub project: Option<ProjectId>,
    pub name: String,
    #[builder(default = false)]
    pub enabled: bool,
    pub match_spec: Json<MatchSpec>,
    pub action_spec: Json<ActionSpec>,
    pub safety: Json<SafetySpec>,
    #[builder(default = 0)]
    pub fire_count: i64,
    #[builder(default, setter(strip_option))]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const RULE_COLUMNS: &str = "id, tenant, project, name, enabled, match_spec, action_spec, safety, \
     fire_count, last_fired_at, created_at, updated_at";

impl TriggerRule {
    pub async fn insert(&self, pool: &PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO trigger_rules (
                id, tenant, project, name, enabled, match_spec, action_spec, safety,
                fire_count, last_fired_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {RULE_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(self.tenant)
        .bind(self.project)
        .bind(&self.name)
        .bind(self.enabled)
        .bind(&self.match_spec)
        .bind(&self.action_spec)
        .bind(&self.safety)
        .bind(self.fire_count)
        .bind(self.last_fired_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await
    }

    /// Rules considered for an event, in deterministic `id` order. Rules
    /// scoped to a project only see that project's events.
    pub async fn list_for_event(
        pool: &PgPool,
        tenant: TenantId,
        project: Option<ProjectId>,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {RULE_COLUMNS}
            FROM trigger_rules
            WHERE tenant = $1 AND (project IS NULL OR project = $2)
            ORDER BY id ASC
            "#
        ))
        .bind(tenant)
        .bind(project)
        .fetch_all(pool)
        .await
    }

    pub async fn find(
        pool: &PgPool,
        tenant: TenantId,
        id: TriggerRuleId,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {RULE_COLUMNS} FROM trigger_rules WHERE tenant = $1 AND id = $2"
        ))
        .bind(tenant)
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Records a fire on the rule row and in the fire history, on the fire
    /// transaction.
    pub async fn record_fire(
        &self,
        conn: &mut PgConnection,
        dedupe_key: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE trigger_rules
            SET fire_count = fire_count + 1, last_fired_at = $1, updated_at = $1
            WHERE id = $2
            "#,
        )
        .bind(at)
        .bind(self.id)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO trigger_fires (id, rule_id, tenant, fired_at, dedupe_key)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(TriggerFireId::new())
        .bind(self.id)
        .bind(self.tenant)
        .bind(at)
        .bind(dedupe_key)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Fires within the sliding window ending now.
    pub async fn fires_since(
        pool: &PgPool,
        rule_id: TriggerRuleId,
        since: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM trigger_fires WHERE rule_id = $1 AND fired_at >= $2",
        )
        .bind(rule_id)
        .bind(since)
        .fetch_one(pool)
        .await
    }

    /// Whether a rendered dedupe key already fired within the window.
    pub async fn dedupe_key_seen(
        pool: &PgPool,
        rule_id: TriggerRuleId,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM trigger_fires
                WHERE rule_id = $1 AND dedupe_key = $2 AND fired_at >= $3
            )
            "#,
        )
        .bind(rule_id)
        .bind(key)
        .bind(since)
        .fetch_one(pool)
        .await
    }
}
