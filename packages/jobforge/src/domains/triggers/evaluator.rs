//! Trigger evaluator: matches events against rules and fires bundles under
//! cooldown, rate, and dedupe gates.
//!
//! Evaluation for one event visits the tenant's rules in `id` order; fires
//! are recorded in that order, each with an audit entry on the fire
//! transaction.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::rule::{severity_rank, BundleRequestTemplate, BundleSource, TriggerRule};
use crate::common::TriggerRuleId;
use crate::domains::bundles::{
    BundleExecutor, BundleMetadata, BundleRequest, BundleSummary, RequestBundle, BUNDLE_VERSION,
};
use crate::domains::events::Event;
use crate::kernel::audit::{AuditAction, AuditEntry};
use crate::kernel::error::ForgeResult;
use crate::kernel::forge_kernel::ForgeKernel;

lazy_static! {
    static ref TEMPLATE_VAR: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\[\]]+)\s*\}\}").expect("template regex compiles");
}

/// Resolves `bundle_ref` actions to request templates.
pub trait BundleResolver: Send + Sync {
    fn resolve(&self, bundle_ref: &str, event: &Event) -> Option<Vec<BundleRequestTemplate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDecision {
    Fire,
    Skip,
    Disabled,
    Cooldown,
    RateLimited,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyChecks {
    pub cooldown_passed: bool,
    pub rate_limit_passed: bool,
    pub dedupe_passed: bool,
}

impl Default for SafetyChecks {
    fn default() -> Self {
        Self {
            cooldown_passed: true,
            rate_limit_passed: true,
            dedupe_passed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvaluationResult {
    pub rule_id: TriggerRuleId,
    pub decision: TriggerDecision,
    pub safety_checks: SafetyChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_summary: Option<BundleSummary>,
}

pub struct TriggerEvaluator {
    kernel: Arc<ForgeKernel>,
    executor: Arc<BundleExecutor>,
    resolver: Option<Arc<dyn BundleResolver>>,
}

impl TriggerEvaluator {
    pub fn new(kernel: Arc<ForgeKernel>, executor: Arc<BundleExecutor>) -> Self {
        Self {
            kernel,
            executor,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BundleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Evaluate every rule of the event's tenant against the event.
    pub async fn evaluate_event(&self, event: &Event) -> ForgeResult<Vec<TriggerEvaluationResult>> {
        let rules =
            TriggerRule::list_for_event(&self.kernel.db_pool, event.tenant, event.project).await?;

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            results.push(self.evaluate_rule(&rule, event).await?);
        }
        Ok(results)
    }

    async fn evaluate_rule(
        &self,
        rule: &TriggerRule,
        event: &Event,
    ) -> ForgeResult<TriggerEvaluationResult> {
        let mut checks = SafetyChecks::default();

        if !self.kernel.flags.triggers_enabled {
            return Ok(skip(rule.id, checks, "triggers_enabled is off"));
        }

        if !self.matches(rule, event) {
            return Ok(skip(rule.id, checks, "event does not match rule"));
        }

        if !rule.enabled {
            return Ok(TriggerEvaluationResult {
                rule_id: rule.id,
                decision: TriggerDecision::Disabled,
                safety_checks: checks,
                reason: Some("rule is disabled".to_string()),
                bundle_summary: None,
            });
        }

        let now = self.kernel.now();
        let safety = &rule.safety.0;

        // Cooldown gate.
        if let Some(last_fired_at) = rule.last_fired_at {
            let elapsed = now - last_fired_at;
            if elapsed < chrono::Duration::seconds(safety.cooldown_seconds) {
                checks.cooldown_passed = false;
                return Ok(TriggerEvaluationResult {
                    rule_id: rule.id,
                    decision: TriggerDecision::Cooldown,
                    safety_checks: checks,
                    reason: Some(format!(
                        "cooldown of {}s has {}s remaining",
                        safety.cooldown_seconds,
                        (chrono::Duration::seconds(safety.cooldown_seconds) - elapsed).num_seconds()
                    )),
                    bundle_summary: None,
                });
            }
        }

        // Sliding-window rate gate.
        if self.kernel.flags.rate_limiting_enabled {
            let window_start = now - chrono::Duration::hours(1);
            let fires =
                TriggerRule::fires_since(&self.kernel.db_pool, rule.id, window_start).await?;
            if fires >= safety.max_runs_per_hour {
                checks.rate_limit_passed = false;
                return Ok(TriggerEvaluationResult {
                    rule_id: rule.id,
                    decision: TriggerDecision::RateLimited,
                    safety_checks: checks,
                    reason: Some(format!(
                        "{fires} fires in the last hour meets the cap of {}",
                        safety.max_runs_per_hour
                    )),
                    bundle_summary: None,
                });
            }
        }

        // Dedupe gate.
        let dedupe_key = safety
            .dedupe_key_template
            .as_deref()
            .map(|template| render_template(template, event));
        if let Some(key) = &dedupe_key {
            let since = now - safety.dedupe_window();
            if TriggerRule::dedupe_key_seen(&self.kernel.db_pool, rule.id, key, since).await? {
                checks.dedupe_passed = false;
                return Ok(TriggerEvaluationResult {
                    rule_id: rule.id,
                    decision: TriggerDecision::Duplicate,
                    safety_checks: checks,
                    reason: Some(format!("dedupe key {key} already fired in window")),
                    bundle_summary: None,
                });
            }
        }

        if !self.kernel.flags.bundle_triggers_enabled {
            return Ok(skip(rule.id, checks, "bundle_triggers_enabled is off"));
        }

        let Some(bundle) = self.build_bundle(rule, event) else {
            return Ok(skip(rule.id, checks, "rule action yields no requests"));
        };

        // Fire: record on the rule, in the fire history, and in the audit
        // log, all on one transaction, before handing off to the executor.
        let mut tx = self.kernel.db_pool.begin().await?;
        rule.record_fire(&mut tx, dedupe_key.as_deref(), now).await?;
        if self.kernel.flags.audit_logging_enabled {
            AuditEntry::builder()
                .tenant(rule.tenant)
                .action(AuditAction::TriggerFire)
                .event_id(event.id)
                .template_key(rule.name.clone())
                .response_summary(json!({
                    "rule_id": rule.id,
                    "bundle_id": bundle.bundle_id,
                    "requests": bundle.requests.len(),
                }))
                .created_at(now)
                .build()
                .insert(&mut tx)
                .await?;
        }
        tx.commit().await?;

        info!(
            rule_id = %rule.id,
            rule = %rule.name,
            event_id = %event.id,
            "trigger fired"
        );

        let mode = rule.action_spec.0.mode;
        let summary = self.executor.execute(&bundle, mode, None).await?;

        Ok(TriggerEvaluationResult {
            rule_id: rule.id,
            decision: TriggerDecision::Fire,
            safety_checks: checks,
            reason: None,
            bundle_summary: Some(summary),
        })
    }

    fn matches(&self, rule: &TriggerRule, event: &Event) -> bool {
        let spec = &rule.match_spec.0;

        if !spec.event_type_allowlist.contains(&event.event_type) {
            return false;
        }

        if let Some(modules) = &spec.source_module_allowlist {
            match &event.source_module {
                Some(module) if modules.contains(module) => {}
                _ => return false,
            }
        }

        if let Some(minimum) = &spec.severity {
            let event_severity = event
                .payload
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("info");
            if severity_rank(event_severity) < severity_rank(minimum) {
                return false;
            }
        }

        if let Some(minimum) = spec.priority {
            let event_priority = event
                .payload
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if event_priority < minimum {
                return false;
            }
        }

        true
    }

    /// Builds the concrete bundle for a fire, from the inline literal or the
    /// resolved `bundle_ref`. Action-job templates are dropped unless the
    /// rule's safety spec allows them.
    fn build_bundle(&self, rule: &TriggerRule, event: &Event) -> Option<RequestBundle> {
        let action = &rule.action_spec.0;
        let templates: Vec<BundleRequestTemplate> = match action.bundle_source {
            BundleSource::Inline => action.requests.clone().unwrap_or_default(),
            BundleSource::Ref => {
                let bundle_ref = action.bundle_ref.as_deref()?;
                self.resolver.as_ref()?.resolve(bundle_ref, event)?
            }
        };

        let safety = &rule.safety.0;
        let templates: Vec<BundleRequestTemplate> = templates
            .into_iter()
            .filter(|t| safety.allow_action_jobs || !t.is_action_job)
            .collect();
        if templates.is_empty() {
            return None;
        }

        let bundle_id = format!("trigger-{}-{}", rule.id, event.id);
        let requests = templates
            .into_iter()
            .enumerate()
            .map(|(i, template)| BundleRequest {
                id: format!("{bundle_id}-r{i}"),
                job_type: template.job_type,
                tenant: event.tenant,
                project: event.project,
                payload: render_payload(&template.payload, event),
                idempotency_key: template
                    .idempotency_key
                    .as_deref()
                    .map(|t| render_template(t, event)),
                required_scopes: template.required_scopes,
                is_action_job: template.is_action_job,
            })
            .collect();

        debug!(rule_id = %rule.id, bundle_id = %bundle_id, "built trigger bundle");

        Some(RequestBundle {
            version: BUNDLE_VERSION.to_string(),
            bundle_id,
            tenant: event.tenant,
            project: event.project,
            trace_id: event.trace_id.clone(),
            requests,
            metadata: BundleMetadata {
                source: format!("trigger:{}", rule.name),
                triggered_at: self.kernel.now(),
                correlation_id: Some(event.id.to_string()),
            },
        })
    }
}

fn skip(
    rule_id: TriggerRuleId,
    safety_checks: SafetyChecks,
    reason: &str,
) -> TriggerEvaluationResult {
    TriggerEvaluationResult {
        rule_id,
        decision: TriggerDecision::Skip,
        safety_checks,
        reason: Some(reason.to_string()),
        bundle_summary: None,
    }
}

/// Renders `{{dotted.path}}` placeholders against the event. Available
/// roots: `event.type`, `event.id`, `event.trace_id`, `event.subject.*`,
/// and `payload.*`. Unresolvable paths render empty.
pub fn render_template(template: &str, event: &Event) -> String {
    let context = template_context(event);
    TEMPLATE_VAR
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup_path(&context, &caps[1])
        })
        .into_owned()
}

/// Renders every string leaf of a payload template.
fn render_payload(payload: &Value, event: &Event) -> Value {
    match payload {
        Value::String(s) => Value::String(render_template(s, event)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_payload(v, event)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_payload(v, event)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn template_context(event: &Event) -> Value {
    json!({
        "event": {
            "id": event.id,
            "type": event.event_type,
            "trace_id": event.trace_id,
            "source_app": event.source_app,
            "source_module": event.source_module,
            "subject": event.subject.as_ref().map(|s| &s.0),
        },
        "payload": event.payload,
    })
}

fn lookup_path(context: &Value, path: &str) -> String {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
