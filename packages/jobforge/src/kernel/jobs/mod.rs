//! Durable job infrastructure: the queue protocol, the worker runtime, the
//! handler registry, and the stale-lock reaper.
//!
//! ```text
//! caller ──enqueue──► jobs table ◄──claim/heartbeat/complete── JobWorker
//!                          ▲                                        │
//!                          └───────────reap────── StaleJobReaper ◄──┘
//! ```
//!
//! Business handlers live with their domains; this module only provides the
//! infrastructure.

mod attempt;
mod context;
mod job;
mod queue;
mod reaper;
mod registry;
mod result;
mod worker;

pub use attempt::JobAttempt;
pub use context::JobContext;
pub use job::{Job, JobError, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use queue::{EnqueueOutcome, EnqueueRequest, JobOutcome, PostgresJobQueue};
pub use reaper::{ReaperConfig, StaleJobReaper};
pub use registry::{
    HandlerOptions, JobOutput, JobRegistry, SharedJobRegistry, DEFAULT_TIMEOUT_MS,
};
pub use result::JobResult;
pub use worker::{JobWorker, JobWorkerConfig};
