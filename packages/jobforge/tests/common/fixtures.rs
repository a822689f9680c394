//! Builders for the wire shapes the tests submit.

use chrono::Utc;
use jobforge_core::common::TenantId;
use jobforge_core::domains::bundles::{
    BundleMetadata, BundleRequest, RequestBundle, BUNDLE_VERSION,
};
use jobforge_core::domains::events::{EventEnvelope, EventSubject, SourceApp, SourceModule, EVENT_VERSION};
use jobforge_core::kernel::jobs::EnqueueRequest;
use serde_json::json;

pub fn enqueue_request(tenant: TenantId, job_type: &str) -> EnqueueRequest {
    EnqueueRequest::builder()
        .tenant(tenant)
        .job_type(job_type.to_string())
        .payload(json!({"a": 1}))
        .build()
}

pub fn bundle_request(tenant: TenantId, id: &str, job_type: &str) -> BundleRequest {
    BundleRequest {
        id: id.to_string(),
        job_type: job_type.to_string(),
        tenant,
        project: None,
        payload: json!({"from": "bundle"}),
        idempotency_key: None,
        required_scopes: Vec::new(),
        is_action_job: false,
    }
}

pub fn action_request(tenant: TenantId, id: &str, job_type: &str, scopes: &[&str]) -> BundleRequest {
    BundleRequest {
        required_scopes: scopes.iter().map(|s| s.to_string()).collect(),
        is_action_job: true,
        ..bundle_request(tenant, id, job_type)
    }
}

pub fn bundle(tenant: TenantId, requests: Vec<BundleRequest>) -> RequestBundle {
    RequestBundle {
        version: BUNDLE_VERSION.to_string(),
        bundle_id: format!("bundle-{}", uuid::Uuid::new_v4()),
        tenant,
        project: None,
        trace_id: format!("trace-{}", uuid::Uuid::new_v4()),
        requests,
        metadata: BundleMetadata {
            source: "tests".to_string(),
            triggered_at: Utc::now(),
            correlation_id: None,
        },
    }
}

pub fn event_envelope(tenant: TenantId, event_type: &str) -> EventEnvelope {
    EventEnvelope {
        event_version: EVENT_VERSION.to_string(),
        event_type: event_type.to_string(),
        occurred_at: Utc::now(),
        trace_id: format!("trace-{}", uuid::Uuid::new_v4()),
        tenant,
        project: None,
        source_app: SourceApp::Settler,
        source_module: Some(SourceModule::Ops),
        subject: Some(EventSubject {
            kind: "deploy".to_string(),
            id: "d-1".to_string(),
        }),
        payload: json!({"severity": "error", "priority": 5}),
        contains_pii: false,
        redaction_hints: None,
    }
}
