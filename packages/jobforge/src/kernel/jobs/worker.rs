//! Job worker: the long-running service that polls, executes, and completes.
//!
//! The worker claims batches from the queue, runs each job in its own task
//! with a heartbeat ticker and a handler deadline, and reports the outcome.
//! Many job tasks progress concurrently per worker; the only shared state
//! between them is the store. Control flow is strictly pull-based.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::context::JobContext;
use super::job::{Job, JobError};
use super::queue::{JobOutcome, PostgresJobQueue};
use super::registry::{JobOutput, SharedJobRegistry};
use crate::common::JobId;
use crate::kernel::error::ForgeError;
use crate::kernel::runs::RunEnvelope;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Stable identity installed as `locked_by` on claimed rows.
    pub worker_id: String,
    /// Maximum jobs in flight; also the claim batch size.
    pub batch_size: i64,
    /// How long to wait when no jobs are ready.
    pub poll_interval: Duration,
    /// Random extra wait added to each poll, desynchronizing peers.
    pub poll_jitter: Duration,
    /// How often to refresh the lease of a running job.
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight jobs before leaving the rest
    /// to the reaper.
    pub shutdown_grace: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            batch_size: 10,
            poll_interval: Duration::from_secs(2),
            poll_jitter: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// A worker that processes jobs from the queue until shutdown.
pub struct JobWorker {
    queue: Arc<PostgresJobQueue>,
    registry: SharedJobRegistry,
    config: JobWorkerConfig,
    /// Running jobs and their cancellation tokens, for cooperative stop.
    running_jobs: Arc<RwLock<HashMap<JobId, CancellationToken>>>,
}

impl JobWorker {
    pub fn new(queue: Arc<PostgresJobQueue>, registry: SharedJobRegistry) -> Self {
        Self::with_config(queue, registry, JobWorkerConfig::default())
    }

    pub fn with_config(
        queue: Arc<PostgresJobQueue>,
        registry: SharedJobRegistry,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            config,
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run until the shutdown token fires: claim, spawn per-job tasks,
    /// repeat. On shutdown, stop claiming, cancel in-flight jobs, and wait
    /// up to the grace period.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let worker = Arc::new(self);

        info!(
            worker_id = %worker.config.worker_id,
            batch_size = worker.config.batch_size,
            "job worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let in_flight = worker.running_jobs.read().await.len() as i64;
            let capacity = worker.config.batch_size - in_flight;
            if capacity <= 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let jobs = match worker.queue.claim(&worker.config.worker_id, capacity).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                let jitter = worker.config.poll_jitter.as_millis() as u64;
                let wait = worker.config.poll_interval
                    + Duration::from_millis(if jitter > 0 {
                        rand::thread_rng().gen_range(0..jitter)
                    } else {
                        0
                    });
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            for job in jobs {
                let worker = Arc::clone(&worker);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.process_job(job, &shutdown).await;
                });
            }
        }

        worker.drain(&shutdown).await;
        info!(worker_id = %worker.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Cancel in-flight jobs and wait up to the grace period. Whatever is
    /// still running afterwards is reclaimed later by the reaper.
    async fn drain(&self, _shutdown: &CancellationToken) {
        let running_count = self.running_jobs.read().await.len();
        if running_count == 0 {
            return;
        }

        info!(count = running_count, "waiting for running jobs to complete");

        {
            let running = self.running_jobs.read().await;
            for token in running.values() {
                token.cancel();
            }
        }

        let start = Instant::now();
        while !self.running_jobs.read().await.is_empty()
            && start.elapsed() < self.config.shutdown_grace
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let left_behind = self.running_jobs.read().await.len();
        if left_behind > 0 {
            warn!(count = left_behind, "jobs still running past grace; leaving to the reaper");
        }
    }

    /// Process one claimed job: envelope, heartbeats, deadline, completion.
    async fn process_job(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let job_cancel = shutdown.child_token();

        {
            let mut running = self.running_jobs.write().await;
            running.insert(job_id, job_cancel.clone());
        }

        let envelope = match RunEnvelope::open(self.queue.kernel(), &job).await {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to open run envelope");
                let outcome = JobOutcome::Failed {
                    error: JobError::new(e.code(), e.to_string()),
                };
                self.finish(job_id, outcome).await;
                self.running_jobs.write().await.remove(&job_id);
                return;
            }
        };

        let ctx = JobContext::new(
            Arc::clone(&self.queue),
            self.config.worker_id.clone(),
            &job,
            job_cancel.clone(),
            envelope.recorder.clone(),
        );

        let options = self.registry.options(&job_type);
        let deadline = Duration::from_millis(options.timeout_ms.max(1) as u64);
        let started = Instant::now();

        let heartbeat_handle = self.spawn_heartbeat(job_id, job_cancel.clone());

        // Isolation boundary: the handler runs in its own task so a panic
        // surfaces as a JoinError instead of taking the worker down.
        let registry = Arc::clone(&self.registry);
        let handler_job = job.clone();
        let mut handler_task =
            tokio::spawn(async move { registry.execute(&handler_job, ctx).await });

        let result: Result<JobOutput, JobError> = tokio::select! {
            joined = &mut handler_task => match joined {
                Ok(inner) => inner,
                Err(join_err) if join_err.is_panic() => Err(JobError::new(
                    "Internal",
                    "handler panicked",
                )
                .with_stack(format!("{join_err}"))),
                Err(join_err) => Err(JobError::new("Internal", join_err.to_string())),
            },
            _ = tokio::time::sleep(deadline) => {
                handler_task.abort();
                Err(JobError::new(
                    "Timeout",
                    format!("handler exceeded {} ms deadline", options.timeout_ms),
                ))
            }
        };

        // Stop the heartbeat ticker for this run.
        job_cancel.cancel();
        let _ = heartbeat_handle.await;

        let duration_ms = started.elapsed().as_millis() as i64;
        let kernel = self.queue.kernel();

        let outcome = match result {
            Ok(output) => {
                debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(e) = envelope.finalize_success(kernel, &output, duration_ms).await {
                    warn!(job_id = %job_id, error = %e, "failed to finalize manifest");
                }
                JobOutcome::Succeeded {
                    result: output.result,
                    artifact_ref: output.artifact_ref,
                }
            }
            Err(error) => {
                warn!(
                    job_id = %job_id,
                    job_type = %job_type,
                    code = %error.code,
                    error = %error.message,
                    "job failed"
                );
                if let Err(e) = envelope.finalize_failure(kernel, &error, duration_ms).await {
                    warn!(job_id = %job_id, error = %e, "failed to finalize manifest");
                }
                JobOutcome::Failed { error }
            }
        };

        self.finish(job_id, outcome).await;
        self.running_jobs.write().await.remove(&job_id);
    }

    fn spawn_heartbeat(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.heartbeat(job_id, &worker_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn finish(&self, job_id: JobId, outcome: JobOutcome) {
        match self
            .queue
            .complete(job_id, &self.config.worker_id, outcome)
            .await
        {
            Ok(status) => debug!(job_id = %job_id, status = ?status, "job completed"),
            // The reaper may have reclaimed the row if we stalled badly.
            Err(ForgeError::NotOwned { .. }) | Err(ForgeError::NotRunning(_)) => {
                warn!(job_id = %job_id, "lost job lock before completion")
            }
            Err(e) => error!(job_id = %job_id, error = %e, "failed to complete job"),
        }
    }
}
