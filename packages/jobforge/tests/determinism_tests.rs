//! Determinism envelope integration tests: manifests around worker runs,
//! immutability after finalize, and replay-bundle comparison.

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use common::*;
use jobforge_core::common::{JobId, RunId, TenantId};
use jobforge_core::kernel::jobs::{
    EnqueueRequest, HandlerOptions, Job, JobError, JobOutput, JobRegistry, JobStatus, JobWorker,
    JobWorkerConfig,
};
use jobforge_core::kernel::runs::{
    compare, InputSnapshot, Manifest, ManifestDocument, ManifestStatus, ReplayBundle,
};
use jobforge_core::kernel::FeatureFlags;
use jobforge_core::ForgeError;
use serde::Deserialize;
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct StepPayload {
    region: String,
}

fn manifest_flags() -> FeatureFlags {
    let mut flags = test_flags();
    flags.manifests_enabled = true;
    flags.replay_pack_enabled = true;
    flags
}

fn worker_config(worker_id: &str) -> JobWorkerConfig {
    JobWorkerConfig {
        worker_id: worker_id.to_string(),
        batch_size: 5,
        poll_interval: StdDuration::from_millis(50),
        poll_jitter: StdDuration::from_millis(10),
        heartbeat_interval: StdDuration::from_millis(200),
        shutdown_grace: StdDuration::from_secs(5),
    }
}

fn traced_registry() -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry
        .register::<StepPayload, _, _>(
            "traced",
            HandlerOptions::default(),
            |payload, ctx| async move {
                ctx.trace.allow("load", "payload accepted");
                ctx.trace.conditional("route", format!("region {}", payload.region));
                Ok(JobOutput::from_value(json!({"routed": payload.region})))
            },
        )
        .unwrap();
    registry
        .register::<StepPayload, _, _>(
            "traced-failing",
            HandlerOptions::default(),
            |_payload, ctx| async move {
                ctx.trace.deny("route", "no capacity");
                Err(JobError::new("HandlerError", "no capacity"))
            },
        )
        .unwrap();
    Arc::new(registry)
}

async fn wait_terminal(pool: &PgPool, tenant: TenantId, job_id: JobId) -> Job {
    for _ in 0..200 {
        let job = Job::find_for_tenant(pool, tenant, job_id)
            .await
            .unwrap()
            .expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
    panic!("job {job_id} never finished");
}

async fn run_traced_job(forge: &TestForge, job_type: &str, region: &str) -> (Job, ManifestDocument) {
    let shutdown = CancellationToken::new();
    let worker = JobWorker::with_config(
        forge.queue.clone(),
        traced_registry(),
        worker_config(&format!("manifest-worker-{region}")),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type(job_type.to_string())
        .payload(json!({"region": region}))
        .max_attempts(1)
        .build();
    let job_id = forge.queue.enqueue(request).await.unwrap().job().id;

    let job = wait_terminal(forge.pool(), forge.tenant, job_id).await;
    shutdown.cancel();
    worker_handle.await.unwrap().unwrap();

    let manifests = Manifest::list_for_tenant(forge.pool(), forge.tenant, 100)
        .await
        .unwrap();
    let manifest = manifests
        .into_iter()
        .find(|m| m.job_type == job_type)
        .expect("manifest exists for the run");
    (job, manifest.document.0.clone())
}

#[tokio::test]
#[serial]
async fn a_successful_run_finalizes_a_complete_manifest() {
    let forge = forge_with_flags(manifest_flags()).await;

    let (job, document) = run_traced_job(&forge, "traced", "us-east-1").await;
    assert_eq!(job.status, JobStatus::Succeeded);

    assert_eq!(document.status, ManifestStatus::Complete);
    assert!(document.final_decision.is_some());
    assert!(document.verify().is_ok());

    let snapshot = document.input_snapshot.as_ref().expect("snapshot recorded");
    assert!(snapshot.verify());
    assert_eq!(
        snapshot.hash,
        InputSnapshot::capture(&json!({"region": "us-east-1"}), None).hash
    );

    // Outputs carry non-empty refs and the result checksum.
    assert!(!document.outputs.is_empty());
    assert!(document.outputs.iter().all(|o| !o.reference.is_empty()));

    // Replay pack material is present.
    let trace = document.decision_trace.as_ref().expect("trace recorded");
    assert_eq!(trace.decisions.len(), 2);
    assert!(trace.is_closed());
}

#[tokio::test]
#[serial]
async fn a_failed_run_finalizes_a_failed_manifest() {
    let forge = forge_with_flags(manifest_flags()).await;

    let (job, document) = run_traced_job(&forge, "traced-failing", "us-east-1").await;
    assert_eq!(job.status, JobStatus::Dead);

    assert_eq!(document.status, ManifestStatus::Failed);
    assert!(document.error.as_deref().unwrap_or("").contains("HandlerError"));

    let trace = document.decision_trace.as_ref().expect("trace recorded");
    assert!(trace.error.is_some());
    assert!(trace.final_decision.is_none());
}

#[tokio::test]
#[serial]
async fn finalized_manifests_are_immutable() {
    let forge = forge_with_flags(manifest_flags()).await;

    let mut document = ManifestDocument::pending(
        RunId::new(),
        forge.tenant,
        None,
        "manual",
        Some(InputSnapshot::capture(&json!({"a": 1}), None)),
        forge.kernel.now(),
    );

    let mut conn = forge.pool().acquire().await.unwrap();
    Manifest::create_pending(&mut conn, &document).await.unwrap();

    document.status = ManifestStatus::Failed;
    document.error = Some("first finalize".to_string());
    Manifest::finalize(
        &mut conn,
        forge.tenant,
        document.run_id,
        &document,
        forge.kernel.now(),
    )
    .await
    .unwrap();

    // A second finalize is refused.
    document.error = Some("second finalize".to_string());
    let second = Manifest::finalize(
        &mut conn,
        forge.tenant,
        document.run_id,
        &document,
        forge.kernel.now(),
    )
    .await;
    assert!(matches!(second, Err(ForgeError::Conflict(_))));
}

#[tokio::test]
#[serial]
async fn identical_runs_replay_identically() {
    let forge_a = forge_with_flags(manifest_flags()).await;
    let forge_b = forge_with_flags(manifest_flags()).await;

    let (_, doc_a) = run_traced_job(&forge_a, "traced", "eu-west-1").await;
    let (_, doc_b) = run_traced_job(&forge_b, "traced", "eu-west-1").await;

    let bundle_a = ReplayBundle::from_document(&doc_a).expect("bundle exports");
    let bundle_b = ReplayBundle::from_document(&doc_b).expect("bundle exports");

    assert!(compare(&bundle_a, &bundle_b).is_empty());
}

#[tokio::test]
#[serial]
async fn diverging_runs_report_differences() {
    let forge_a = forge_with_flags(manifest_flags()).await;
    let forge_b = forge_with_flags(manifest_flags()).await;

    let (_, doc_a) = run_traced_job(&forge_a, "traced", "eu-west-1").await;
    let (_, doc_b) = run_traced_job(&forge_b, "traced", "ap-south-1").await;

    let bundle_a = ReplayBundle::from_document(&doc_a).expect("bundle exports");
    let bundle_b = ReplayBundle::from_document(&doc_b).expect("bundle exports");

    let diffs = compare(&bundle_a, &bundle_b);
    let fields: Vec<&str> = diffs.iter().map(|d| d.field.as_str()).collect();
    assert!(fields.contains(&"input_hash"));
    assert!(fields.contains(&"output_hash"));
}

#[tokio::test]
#[serial]
async fn manifests_disabled_produce_no_rows() {
    let forge = forge().await; // manifests_enabled defaults off

    let shutdown = CancellationToken::new();
    let worker = JobWorker::with_config(
        forge.queue.clone(),
        traced_registry(),
        worker_config("no-manifest-worker"),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("traced".to_string())
        .payload(json!({"region": "us-east-1"}))
        .build();
    let job_id = forge.queue.enqueue(request).await.unwrap().job().id;
    wait_terminal(forge.pool(), forge.tenant, job_id).await;

    shutdown.cancel();
    worker_handle.await.unwrap().unwrap();

    let manifests = Manifest::list_for_tenant(forge.pool(), forge.tenant, 100)
        .await
        .unwrap();
    assert!(manifests.is_empty());
}
