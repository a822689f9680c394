//! Queue protocol integration tests: idempotent enqueue, claim exclusivity,
//! retry with backoff, dead-lettering, cancel/reschedule, and the reaper.

mod common;

use std::collections::HashSet;

use chrono::Duration;
use common::*;
use jobforge_core::common::clock::Clock;
use jobforge_core::common::TenantId;
use jobforge_core::kernel::audit::{AuditAction, AuditEntry};
use jobforge_core::kernel::jobs::{
    EnqueueRequest, Job, JobAttempt, JobError, JobOutcome, JobResult, JobStatus,
};
use jobforge_core::ForgeError;
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn idempotent_enqueue_returns_the_same_row() {
    let forge = forge().await;

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("x".to_string())
        .payload(json!({"a": 1}))
        .idempotency_key("k1".to_string())
        .build();

    let first = forge.queue.enqueue(request.clone()).await.unwrap();
    let second = forge.queue.enqueue(request).await.unwrap();

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.job().id, second.job().id);

    let jobs = Job::list_for_tenant(forge.pool(), forge.tenant, None, 100)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);

    // No attempts exist until a worker claims.
    let attempts = JobAttempt::list_for_job(forge.pool(), first.job().id)
        .await
        .unwrap();
    assert!(attempts.is_empty());
}

#[tokio::test]
#[serial]
async fn distinct_keys_create_distinct_rows() {
    let forge = forge().await;

    for key in ["k1", "k2"] {
        let request = EnqueueRequest::builder()
            .tenant(forge.tenant)
            .job_type("x".to_string())
            .idempotency_key(key.to_string())
            .build();
        assert!(forge.queue.enqueue(request).await.unwrap().is_created());
    }

    let jobs = Job::list_for_tenant(forge.pool(), forge.tenant, None, 100)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
#[serial]
async fn enqueue_writes_a_job_request_audit_entry() {
    let forge = forge().await;

    forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "audited"))
        .await
        .unwrap();

    let entries = AuditEntry::list_for_tenant(forge.pool(), forge.tenant, AuditAction::JobRequest)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].template_key.as_deref(), Some("audited"));
}

#[tokio::test]
#[serial]
async fn claim_transitions_to_running_and_opens_an_attempt() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "claimable"))
        .await
        .unwrap();

    let claimed = forge.queue.claim("w1", 10).await.unwrap();
    let job = claimed
        .iter()
        .find(|j| j.id == outcome.job().id)
        .expect("our job is claimed");

    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("w1"));
    assert!(job.locked_at.is_some());
    assert!(job.started_at.is_some());
    assert_eq!(job.attempts, 1);

    let attempts = JobAttempt::list_for_job(forge.pool(), job.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_no, 1);
    assert!(attempts[0].finished_at.is_none());
}

#[tokio::test]
#[serial]
async fn future_jobs_are_not_claimed_until_due() {
    let forge = forge().await;

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("later".to_string())
        .run_at(forge.clock.now() + Duration::minutes(10))
        .build();
    let outcome = forge.queue.enqueue(request).await.unwrap();

    let claimed = forge.queue.claim("w1", 100).await.unwrap();
    assert!(claimed.iter().all(|j| j.id != outcome.job().id));

    forge.clock.advance(Duration::minutes(11));
    let claimed = forge.queue.claim("w1", 100).await.unwrap();
    assert!(claimed.iter().any(|j| j.id == outcome.job().id));
}

#[tokio::test]
#[serial]
async fn concurrent_claimers_never_share_a_row() {
    let forge = forge().await;

    for i in 0..20 {
        forge
            .queue
            .enqueue(enqueue_request(forge.tenant, &format!("burst-{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let queue = forge.queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim(&format!("racer-{w}"), 10).await.unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for job in handle.await.unwrap() {
            assert!(seen.insert(job.id), "job {} was claimed twice", job.id);
        }
    }
}

#[tokio::test]
#[serial]
async fn heartbeat_is_owner_only() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "hb"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    forge.queue.claim("w1", 10).await.unwrap();

    assert!(forge.queue.heartbeat(job_id, "w1").await.is_ok());
    assert!(matches!(
        forge.queue.heartbeat(job_id, "w2").await,
        Err(ForgeError::NotOwned { .. })
    ));
}

#[tokio::test]
#[serial]
async fn heartbeat_on_a_finished_job_is_not_running() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "hb-done"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    forge.queue.claim("w1", 10).await.unwrap();
    forge
        .queue
        .complete(
            job_id,
            "w1",
            JobOutcome::Succeeded {
                result: json!({}),
                artifact_ref: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        forge.queue.heartbeat(job_id, "w1").await,
        Err(ForgeError::NotRunning(_))
    ));
}

#[tokio::test]
#[serial]
async fn success_persists_a_result_and_clears_the_lock() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "winner"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    forge.queue.claim("w1", 10).await.unwrap();
    let status = forge
        .queue
        .complete(
            job_id,
            "w1",
            JobOutcome::Succeeded {
                result: json!({"answer": 42}),
                artifact_ref: Some("s3://artifacts/run".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Succeeded);

    let job = Job::find_for_tenant(forge.pool(), forge.tenant, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.locked_by.is_none());
    assert!(job.finished_at.is_some());
    assert!(job.result_id.is_some());

    let result = JobResult::find_for_job(forge.pool(), job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.payload, json!({"answer": 42}));
    assert_eq!(result.artifact_ref.as_deref(), Some("s3://artifacts/run"));
}

#[tokio::test]
#[serial]
async fn only_the_lock_holder_may_complete() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "guarded"))
        .await
        .unwrap();

    forge.queue.claim("w1", 10).await.unwrap();
    let denied = forge
        .queue
        .complete(
            outcome.job().id,
            "intruder",
            JobOutcome::Succeeded {
                result: json!({}),
                artifact_ref: None,
            },
        )
        .await;
    assert!(matches!(denied, Err(ForgeError::NotOwned { .. })));
}

/// Scenario: a handler that always fails walks queued -> running ->
/// queued(+backoff) -> ... -> dead, with one attempt row per claim.
#[tokio::test]
#[serial]
async fn retry_with_backoff_then_dead() {
    let forge = forge().await;

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("x".to_string())
        .payload(json!({"a": 1}))
        .max_attempts(3)
        .build();
    let job_id = forge.queue.enqueue(request).await.unwrap().job().id;

    let mut expected_backoffs_ms = vec![1_000i64, 2_000];

    for attempt in 1..=3 {
        forge.clock.advance(Duration::hours(2)); // past any backoff
        let claimed = forge.queue.claim("w1", 10).await.unwrap();
        assert!(claimed.iter().any(|j| j.id == job_id), "attempt {attempt} claim");

        let before = forge.clock.now();
        let status = forge
            .queue
            .complete(
                job_id,
                "w1",
                JobOutcome::Failed {
                    error: JobError::new("HandlerError", "always fails"),
                },
            )
            .await
            .unwrap();

        let job = Job::find_for_tenant(forge.pool(), forge.tenant, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.attempts, attempt);

        if attempt < 3 {
            assert_eq!(status, JobStatus::Queued);
            let delay = (job.run_at - before).num_milliseconds();
            assert_eq!(delay, expected_backoffs_ms.remove(0));
            assert!(job.locked_by.is_none());
        } else {
            assert_eq!(status, JobStatus::Dead);
            assert_eq!(job.status, JobStatus::Dead);
            assert_eq!(
                job.error.as_ref().map(|e| e.0.code.as_str()),
                Some("HandlerError")
            );
        }
    }

    let attempts = JobAttempt::list_for_job(forge.pool(), job_id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    for (i, attempt) in attempts.iter().enumerate() {
        assert_eq!(attempt.attempt_no, i as i32 + 1);
        assert!(attempt.finished_at.is_some());
        assert_eq!(
            attempt.error.as_ref().map(|e| e.0.code.as_str()),
            Some("HandlerError")
        );
    }
}

#[tokio::test]
#[serial]
async fn bad_input_failures_dead_letter_immediately() {
    let forge = forge().await;

    let outcome = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "malformed"))
        .await
        .unwrap();
    let job_id = outcome.job().id;

    forge.queue.claim("w1", 10).await.unwrap();
    let status = forge
        .queue
        .complete(
            job_id,
            "w1",
            JobOutcome::Failed {
                error: JobError::new("BadInput", "schema rejected payload"),
            },
        )
        .await
        .unwrap();

    // Default budget is 5 attempts, but BadInput is terminal on the first.
    assert_eq!(status, JobStatus::Dead);
}

#[tokio::test]
#[serial]
async fn cancel_is_queued_only() {
    let forge = forge().await;

    let queued = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "cancel-me"))
        .await
        .unwrap();
    forge.queue.cancel(forge.tenant, queued.job().id).await.unwrap();

    let job = Job::find_for_tenant(forge.pool(), forge.tenant, queued.job().id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(job.finished_at.is_some());

    // Canceled rows never reach a worker.
    let claimed = forge.queue.claim("w1", 100).await.unwrap();
    assert!(claimed.iter().all(|j| j.id != queued.job().id));

    // A running job is not cancelable.
    let running = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "keep-running"))
        .await
        .unwrap();
    forge.queue.claim("w1", 10).await.unwrap();
    assert!(matches!(
        forge.queue.cancel(forge.tenant, running.job().id).await,
        Err(ForgeError::NotCancelable(_))
    ));

    let entries = AuditEntry::list_for_tenant(forge.pool(), forge.tenant, AuditAction::JobCancel)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
#[serial]
async fn reschedule_preserves_attempts_unless_reset() {
    let forge = forge().await;

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("flaky".to_string())
        .max_attempts(1)
        .build();
    let job_id = forge.queue.enqueue(request).await.unwrap().job().id;

    forge.queue.claim("w1", 10).await.unwrap();
    forge
        .queue
        .complete(
            job_id,
            "w1",
            JobOutcome::Failed {
                error: JobError::new("HandlerError", "boom"),
            },
        )
        .await
        .unwrap();

    // Dead with attempts == max_attempts; an operator reschedule without a
    // raised budget leaves it parked.
    let run_at = forge.clock.now();
    let job = forge
        .queue
        .reschedule(forge.tenant, job_id, run_at, false, None)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert!(forge
        .queue
        .claim("w2", 100)
        .await
        .unwrap()
        .iter()
        .all(|j| j.id != job_id));

    // Raising the budget makes it claimable again.
    let job = forge
        .queue
        .reschedule(forge.tenant, job_id, run_at, false, Some(3))
        .await
        .unwrap();
    assert_eq!(job.max_attempts, 3);
    assert!(forge
        .queue
        .claim("w2", 100)
        .await
        .unwrap()
        .iter()
        .any(|j| j.id == job_id));
}

#[tokio::test]
#[serial]
async fn succeeded_jobs_cannot_be_rescheduled() {
    let forge = forge().await;

    let job_id = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "done"))
        .await
        .unwrap()
        .job()
        .id;
    forge.queue.claim("w1", 10).await.unwrap();
    forge
        .queue
        .complete(
            job_id,
            "w1",
            JobOutcome::Succeeded {
                result: json!({}),
                artifact_ref: None,
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        forge
            .queue
            .reschedule(forge.tenant, job_id, forge.clock.now(), false, None)
            .await,
        Err(ForgeError::NotReschedulable(_))
    ));
}

/// Scenario: worker W1 claims, heartbeats once, and crashes. After the
/// threshold the reaper requeues the job with the dangling attempt closed
/// as a stale reap, and W2 finishes it.
#[tokio::test]
#[serial]
async fn stale_worker_reclaim() {
    let forge = forge().await;

    let job_id = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "orphaned"))
        .await
        .unwrap()
        .job()
        .id;

    forge.queue.claim("w1", 10).await.unwrap();
    forge.queue.heartbeat(job_id, "w1").await.unwrap();
    // w1 crashes here.

    forge.clock.advance(Duration::minutes(6));
    let reaped = forge.queue.reap_stale(Duration::minutes(5)).await.unwrap();
    assert!(reaped.iter().any(|j| j.id == job_id));

    let job = Job::find_for_tenant(forge.pool(), forge.tenant, job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.locked_by.is_none());

    let attempts = JobAttempt::list_for_job(forge.pool(), job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    let stale = &attempts[0];
    assert!(stale.finished_at.is_some());
    assert!(stale
        .error
        .as_ref()
        .map(|e| e.0.message.contains("stale-reap"))
        .unwrap_or(false));

    // W2 picks it up and completes.
    let claimed = forge.queue.claim("w2", 10).await.unwrap();
    assert!(claimed.iter().any(|j| j.id == job_id));
    let status = forge
        .queue
        .complete(
            job_id,
            "w2",
            JobOutcome::Succeeded {
                result: json!({}),
                artifact_ref: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Succeeded);

    let attempts = JobAttempt::list_for_job(forge.pool(), job_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].attempt_no, 2);
}

#[tokio::test]
#[serial]
async fn healthy_jobs_are_not_reaped() {
    let forge = forge().await;

    let job_id = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "healthy"))
        .await
        .unwrap()
        .job()
        .id;
    forge.queue.claim("w1", 10).await.unwrap();

    forge.clock.advance(Duration::minutes(4));
    forge.queue.heartbeat(job_id, "w1").await.unwrap();
    forge.clock.advance(Duration::minutes(4));

    let reaped = forge.queue.reap_stale(Duration::minutes(5)).await.unwrap();
    assert!(reaped.iter().all(|j| j.id != job_id));
}

#[tokio::test]
#[serial]
async fn tenant_reads_are_isolated() {
    let forge = forge().await;
    let other_tenant = TenantId::new();

    let job_id = forge
        .queue
        .enqueue(enqueue_request(forge.tenant, "private"))
        .await
        .unwrap()
        .job()
        .id;

    assert!(Job::find_for_tenant(forge.pool(), other_tenant, job_id)
        .await
        .unwrap()
        .is_none());

    // Cross-tenant cancel is refused without leaking existence.
    assert!(matches!(
        forge.queue.cancel(other_tenant, job_id).await,
        Err(ForgeError::Forbidden(_))
    ));
}

#[tokio::test]
#[serial]
async fn oversized_payloads_are_rejected() {
    let forge = forge().await;

    let request = EnqueueRequest::builder()
        .tenant(forge.tenant)
        .job_type("big".to_string())
        .payload(json!({"blob": "x".repeat(70_000)}))
        .build();

    assert!(matches!(
        forge.queue.enqueue(request).await,
        Err(ForgeError::BadInput(_))
    ));
}
