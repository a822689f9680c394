//! Bundle executor: validates a request bundle and fans it out to child
//! jobs under scope and safety gates.
//!
//! Per-request processing is ordered and deterministic. The policy gate is
//! bundle-level and atomic: when any action request lacks a valid token,
//! every request in the bundle is denied and nothing is enqueued.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use super::bundle::{
    BundleRequest, BundleSummary, ChildOutcome, ChildStatus, ExecutionMode, RequestBundle,
};
use crate::domains::policy::{PolicySigner, PolicyToken, TokenExpectation};
use crate::kernel::audit::{AuditAction, AuditEntry};
use crate::kernel::error::ForgeResult;
use crate::kernel::forge_kernel::ForgeKernel;
use crate::kernel::jobs::{EnqueueRequest, PostgresJobQueue, SharedJobRegistry};

pub struct BundleExecutor {
    kernel: Arc<ForgeKernel>,
    queue: Arc<PostgresJobQueue>,
    registry: SharedJobRegistry,
}

impl BundleExecutor {
    pub fn new(
        kernel: Arc<ForgeKernel>,
        queue: Arc<PostgresJobQueue>,
        registry: SharedJobRegistry,
    ) -> Self {
        Self {
            kernel,
            queue,
            registry,
        }
    }

    /// Process a bundle in the given mode. `dry_run` reports the would-be
    /// outcome of every request without enqueuing anything.
    pub async fn execute(
        &self,
        bundle: &RequestBundle,
        mode: ExecutionMode,
        token: Option<&PolicyToken>,
    ) -> ForgeResult<BundleSummary> {
        bundle.validate()?;

        let action_requests: Vec<&BundleRequest> =
            bundle.requests.iter().filter(|r| r.is_action_job).collect();

        // Bundle-level policy gate for write-class requests.
        let bundle_denial = self.check_action_policy(bundle, &action_requests, token).await?;

        let dry_run = mode == ExecutionMode::DryRun;
        let mut children = Vec::with_capacity(bundle.requests.len());
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_keys: HashSet<&str> = HashSet::new();

        for request in &bundle.requests {
            if let Some(reason) = &bundle_denial {
                children.push(ChildOutcome {
                    request_id: request.id.clone(),
                    status: ChildStatus::Denied,
                    job_id: None,
                    reason: Some(reason.clone()),
                });
                continue;
            }

            // Duplicate suppression within the bundle, by id then by key.
            if !seen_ids.insert(request.id.as_str()) {
                children.push(ChildOutcome {
                    request_id: request.id.clone(),
                    status: ChildStatus::Skipped,
                    job_id: None,
                    reason: Some("duplicate request id in bundle".to_string()),
                });
                continue;
            }
            if let Some(key) = &request.idempotency_key {
                if !seen_keys.insert(key.as_str()) {
                    children.push(ChildOutcome {
                        request_id: request.id.clone(),
                        status: ChildStatus::Skipped,
                        job_id: None,
                        reason: Some("duplicate idempotency key in bundle".to_string()),
                    });
                    continue;
                }
            }

            if request.is_action_job && !self.kernel.flags.action_jobs_enabled {
                children.push(ChildOutcome {
                    request_id: request.id.clone(),
                    status: ChildStatus::Denied,
                    job_id: None,
                    reason: Some("action_jobs_enabled is off".to_string()),
                });
                continue;
            }

            if !self.kernel.flags.autopilot_jobs_enabled {
                children.push(ChildOutcome {
                    request_id: request.id.clone(),
                    status: ChildStatus::Denied,
                    job_id: None,
                    reason: Some("autopilot_jobs_enabled is off".to_string()),
                });
                continue;
            }

            if dry_run {
                children.push(ChildOutcome {
                    request_id: request.id.clone(),
                    status: ChildStatus::Accepted,
                    job_id: None,
                    reason: Some("dry run".to_string()),
                });
                continue;
            }

            children.push(self.enqueue_child(bundle, request).await);
        }

        let summary = summarize(bundle, dry_run, &action_requests, bundle_denial.as_deref(), children);
        info!(
            bundle_id = %summary.bundle_id,
            total = summary.total,
            accepted = summary.accepted,
            denied = summary.denied,
            "bundle processed"
        );
        Ok(summary)
    }

    /// Evaluates the token against every action request. Returns the denial
    /// reason that applies to the whole bundle, if any. Emits one
    /// `policy_check` audit entry whenever the gate actually ran.
    async fn check_action_policy(
        &self,
        bundle: &RequestBundle,
        action_requests: &[&BundleRequest],
        token: Option<&PolicyToken>,
    ) -> ForgeResult<Option<String>> {
        let flags = &self.kernel.flags;
        if action_requests.is_empty()
            || !flags.action_jobs_enabled
            || !flags.require_policy_tokens
        {
            return Ok(None);
        }

        let denial: Option<String> = match token {
            None => Some("action job requires a policy token".to_string()),
            Some(token) => match PolicySigner::from_kernel(&self.kernel) {
                Err(e) => Some(e.to_string()),
                Ok(signer) => action_requests
                    .iter()
                    .find_map(|request| {
                        let expectation = TokenExpectation {
                            tenant: bundle.tenant,
                            action: request.job_type.clone(),
                            required_scopes: request.required_scopes.clone(),
                        };
                        signer
                            .verify(token, &expectation)
                            .err()
                            .map(|e| format!("request {}: {e}", request.id))
                    }),
            },
        };

        if denial.is_some() {
            warn!(bundle_id = %bundle.bundle_id, reason = ?denial, "bundle denied by policy gate");
        }

        if self.kernel.flags.audit_logging_enabled {
            let mut conn = self.kernel.db_pool.acquire().await?;
            AuditEntry::builder()
                .tenant(bundle.tenant)
                .action(AuditAction::PolicyCheck)
                .template_key(bundle.bundle_id.clone())
                .policy_token_used(token.is_some())
                .policy_check_result(denial.is_none())
                .scopes_granted(token.map(|t| t.scopes.clone()).unwrap_or_default())
                .response_summary(json!({
                    "action_requests": action_requests.len(),
                    "denial": denial,
                }))
                .created_at(self.kernel.now())
                .build()
                .insert(&mut conn)
                .await?;
        }

        Ok(denial)
    }

    async fn enqueue_child(&self, bundle: &RequestBundle, request: &BundleRequest) -> ChildOutcome {
        let mut enqueue = EnqueueRequest::builder()
            .tenant(bundle.tenant)
            .job_type(request.job_type.clone())
            .payload(request.payload.clone())
            .created_by(bundle.metadata.source.clone())
            .trace_id(bundle.trace_id.clone())
            .parent_bundle_id(bundle.bundle_id.clone())
            .build();
        enqueue.idempotency_key = request.idempotency_key.clone();
        enqueue.max_attempts = self.registry.options(&request.job_type).max_attempts;

        match self.queue.enqueue(enqueue).await {
            Ok(outcome) if outcome.is_created() => ChildOutcome {
                request_id: request.id.clone(),
                status: ChildStatus::Accepted,
                job_id: Some(outcome.job().id),
                reason: None,
            },
            Ok(outcome) => ChildOutcome {
                request_id: request.id.clone(),
                status: ChildStatus::Skipped,
                job_id: Some(outcome.job().id),
                reason: Some("idempotency key already enqueued".to_string()),
            },
            Err(e) => ChildOutcome {
                request_id: request.id.clone(),
                status: ChildStatus::Error,
                job_id: None,
                reason: Some(e.to_string()),
            },
        }
    }
}

fn summarize(
    bundle: &RequestBundle,
    dry_run: bool,
    action_requests: &[&BundleRequest],
    bundle_denial: Option<&str>,
    children: Vec<ChildOutcome>,
) -> BundleSummary {
    let accepted = children
        .iter()
        .filter(|c| c.status == ChildStatus::Accepted)
        .count();
    let skipped = children
        .iter()
        .filter(|c| c.status == ChildStatus::Skipped)
        .count();
    let denied = children
        .iter()
        .filter(|c| c.status == ChildStatus::Denied)
        .count();

    let action_jobs_blocked = if bundle_denial.is_some() {
        action_requests.len()
    } else {
        children
            .iter()
            .filter(|c| {
                c.status == ChildStatus::Denied
                    && action_requests.iter().any(|r| r.id == c.request_id)
            })
            .count()
    };

    BundleSummary {
        bundle_id: bundle.bundle_id.clone(),
        dry_run,
        total: children.len(),
        accepted,
        skipped,
        denied,
        action_jobs_blocked,
        children,
    }
}
