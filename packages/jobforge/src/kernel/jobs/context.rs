//! Execution context handed to every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::job::Job;
use super::queue::PostgresJobQueue;
use crate::common::{JobId, TenantId};
use crate::kernel::error::ForgeResult;
use crate::kernel::runs::TraceRecorder;

/// Ambient context for one run. Long handlers poll `cancellation` and call
/// `heartbeat()` on their own schedule instead of relying on any framework
/// construct.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub tenant: TenantId,
    pub attempt_no: i32,
    pub trace_id: Option<String>,
    pub cancellation: CancellationToken,
    /// Decision-trace recorder feeding the run's manifest.
    pub trace: TraceRecorder,
    queue: Arc<PostgresJobQueue>,
    worker_id: String,
}

impl JobContext {
    pub(crate) fn new(
        queue: Arc<PostgresJobQueue>,
        worker_id: impl Into<String>,
        job: &Job,
        cancellation: CancellationToken,
        trace: TraceRecorder,
    ) -> Self {
        Self {
            job_id: job.id,
            tenant: job.tenant,
            attempt_no: job.attempts,
            trace_id: job.trace_id.clone(),
            cancellation,
            trace,
            queue,
            worker_id: worker_id.into(),
        }
    }

    /// Extends this run's lease. The periodic worker heartbeat covers most
    /// handlers; explicit calls help around long non-yielding sections.
    pub async fn heartbeat(&self) -> ForgeResult<()> {
        self.queue.heartbeat(self.job_id, &self.worker_id).await
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
