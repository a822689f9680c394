//! Request-bundle wire envelope (pinned, version "1.0").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{JobId, ProjectId, TenantId};
use crate::kernel::error::{ForgeError, ForgeResult};

pub const BUNDLE_VERSION: &str = "1.0";
pub const MAX_BUNDLE_REQUESTS: usize = 100;

/// One job request inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleRequest {
    pub id: String,
    pub job_type: String,
    pub tenant: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub is_action_job: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleMetadata {
    pub source: String,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// An ordered set of 1–100 job requests under one tenant and trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestBundle {
    pub version: String,
    pub bundle_id: String,
    pub tenant: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectId>,
    pub trace_id: String,
    pub requests: Vec<BundleRequest>,
    pub metadata: BundleMetadata,
}

impl RequestBundle {
    /// Pinned-envelope checks: version, request count, tenant and project
    /// agreement between the bundle and every request.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.version != BUNDLE_VERSION {
            return Err(ForgeError::BadInput(format!(
                "unsupported bundle version {}",
                self.version
            )));
        }
        if self.requests.is_empty() || self.requests.len() > MAX_BUNDLE_REQUESTS {
            return Err(ForgeError::BadInput(format!(
                "bundle must carry between 1 and {MAX_BUNDLE_REQUESTS} requests"
            )));
        }
        for request in &self.requests {
            if request.tenant != self.tenant {
                return Err(ForgeError::Forbidden(format!(
                    "request {} tenant disagrees with bundle tenant",
                    request.id
                )));
            }
            if let (Some(bundle_project), Some(request_project)) = (self.project, request.project) {
                if bundle_project != request_project {
                    return Err(ForgeError::Forbidden(format!(
                        "request {} project disagrees with bundle project",
                        request.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Whether accepted requests are enqueued or only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Execute,
}

/// Status of one child request after executor processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Accepted,
    Skipped,
    Denied,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub request_id: String,
    pub status: ChildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSummary {
    pub bundle_id: String,
    pub dry_run: bool,
    pub total: usize,
    pub accepted: usize,
    pub skipped: usize,
    pub denied: usize,
    pub action_jobs_blocked: usize,
    pub children: Vec<ChildOutcome>,
}
